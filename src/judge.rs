//! Judge: draft + evidence → [`Verdict`].
//!
//! The judge model grades factuality, hallucination, coverage of the
//! section's required elements, and a score. Citation validity is also
//! checked structurally here, and the verdict's `cites_ok` is the
//! conjunction of both: the model can flag a resolvable citation as wrong,
//! but it can never pass one that does not resolve.
//!
//! The judge is advisory. A verdict that cannot be parsed is regenerated
//! once, whatever the retry budget; a second unparseable reply is a
//! [`MalformedOutputError::UnparseableVerdict`]. Other capability failures
//! stay [`CapabilityError`]s. Both are system faults, never
//! content verdicts.

use tracing::{debug, warn};

use crate::citation::{self, UNSUPPORTED_MARKER};
use crate::config::RetrievalConfig;
use crate::error::{CapabilityError, MalformedOutputError, SectionError};
use crate::llm::{JudgeModel, Prompt};
use crate::models::{Draft, EvidenceSet, SectionSpec, Verdict};
use crate::retrieve::render_context;
use crate::retry::{with_retry, RetryPolicy};

pub struct Judge<'a> {
    pub model: &'a dyn JudgeModel,
    pub retry: &'a RetryPolicy,
    pub retrieval: &'a RetrievalConfig,
}

impl Judge<'_> {
    pub async fn judge(
        &self,
        draft: &Draft,
        evidence: &EvidenceSet,
        spec: &SectionSpec,
    ) -> Result<Verdict, SectionError> {
        let citations = citation::parse_citations(&draft.text);
        let unresolved: Vec<String> = citation::unresolved(&citations, evidence)
            .into_iter()
            .map(|c| c.to_string())
            .collect();

        if evidence.is_empty() && citations.is_empty() {
            return Ok(evidence_gap_verdict(spec));
        }

        let prompt = build_prompt(draft, evidence, spec, &unresolved, self.retrieval);
        let mut regenerated = false;
        let mut verdict = loop {
            match with_retry(self.retry, "judge", || self.model.judge(&prompt)).await {
                Ok(v) => break v,
                Err(CapabilityError::Malformed { message, .. }) if regenerated => {
                    return Err(MalformedOutputError::UnparseableVerdict { message }.into())
                }
                Err(CapabilityError::Malformed { message, .. }) => {
                    warn!(section = %spec.id, revision = draft.revision, %message, "unparseable verdict, regenerating");
                    regenerated = true;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if !unresolved.is_empty() {
            verdict.cites_ok = false;
            let note = format!("Citations not in evidence: {}", unresolved.join(", "));
            verdict.notes = if verdict.notes.is_empty() {
                note
            } else {
                format!("{} {}", verdict.notes.trim_end(), note)
            };
        }

        debug!(
            section = %spec.id,
            revision = draft.revision,
            factual = verdict.factual,
            cites_ok = verdict.cites_ok,
            hallucinated = verdict.hallucinated,
            score = verdict.score,
            "verdict"
        );
        Ok(verdict)
    }
}

/// Verdict for a marker-only draft written without evidence.
///
/// Nothing is asserted, so nothing can be wrong; every required element is
/// reported missing.
fn evidence_gap_verdict(spec: &SectionSpec) -> Verdict {
    Verdict {
        factual: true,
        cites_ok: true,
        hallucinated: false,
        missing_but_expected: spec.required_elements.clone(),
        unsupported_claims: Vec::new(),
        score: 1.0,
        notes: "No evidence retrieved; every claim is marked unsupported.".to_string(),
    }
}

fn build_prompt(
    draft: &Draft,
    evidence: &EvidenceSet,
    spec: &SectionSpec,
    unresolved: &[String],
    retrieval: &RetrievalConfig,
) -> Prompt {
    let system = format!(
        "You are a strict technical reviewer. Judge ONLY against CONTEXT and return STRICT JSON.\n\
         - factual: false if any claim contradicts or goes beyond the text of the chunk it cites.\n\
         - cites_ok: false if any citation does not point at a CONTEXT tag range that supports the claim.\n\
         - hallucinated: true if any claim has no citation and is not marked {}.\n\
         - missing_but_expected: REQUIRED ELEMENTS the draft does not address.\n\
         - unsupported_claims: the offending claims, verbatim.\n\
         - score: rubric score in [0, 1]; 0 when a claim is unsupported.",
        UNSUPPORTED_MARKER
    );

    let mut user = String::from(
        "Schema:\n{\"factual\":bool,\"cites_ok\":bool,\"hallucinated\":bool,\
         \"unsupported_claims\":[string],\"missing_but_expected\":[string],\
         \"score\":number,\"notes\":string}\n\n",
    );
    user.push_str(&format!("SECTION: {}\n", spec.title));
    user.push_str(&format!(
        "REQUIRED ELEMENTS: {}\n\n",
        if spec.required_elements.is_empty() {
            "(none)".to_string()
        } else {
            spec.required_elements.join("; ")
        }
    ));
    if !unresolved.is_empty() {
        user.push_str(&format!(
            "CITATIONS KNOWN NOT TO RESOLVE: {}\n\n",
            unresolved.join(", ")
        ));
    }
    user.push_str(&format!(
        "CONTEXT:\n{}\n\nDRAFT:\n{}",
        render_context(evidence, retrieval),
        draft.text
    ));
    Prompt { system, user }
}
