//! Drafter: evidence set → section prose with inline citations.
//!
//! The drafter only ever shows the model the section's own evidence, and it
//! checks every citation in the reply against that evidence before returning
//! the draft. A reply with unresolved citations is regenerated once with the
//! offending tags named; a second failure is a
//! [`MalformedOutputError::UnresolvedCitations`].
//!
//! Revisions reuse the section's original evidence set. The failing
//! verdict's `missing_but_expected`, unsupported claims, and notes are put
//! in front of the model together with the previous draft.
//!
//! With an empty evidence set no model is called: the draft consists of
//! unsupported markers only.

use tracing::{debug, warn};

use crate::citation::{self, INFERRED_MARKER, UNSUPPORTED_MARKER};
use crate::config::RetrievalConfig;
use crate::error::{MalformedOutputError, SectionError};
use crate::llm::{Generator, Prompt};
use crate::models::{Draft, EvidenceSet, SectionSpec, Verdict};
use crate::retrieve::render_context;
use crate::retry::{with_retry, RetryPolicy};

/// The failing judgment a revision must address.
#[derive(Debug, Clone, Copy)]
pub struct Feedback<'a> {
    pub previous: &'a Draft,
    pub verdict: &'a Verdict,
}

pub struct Drafter<'a> {
    pub generator: &'a dyn Generator,
    pub retry: &'a RetryPolicy,
    pub retrieval: &'a RetrievalConfig,
}

impl Drafter<'_> {
    /// Write revision `feedback.previous.revision + 1`, or revision 0.
    pub async fn draft(
        &self,
        spec: &SectionSpec,
        query: &str,
        evidence: &EvidenceSet,
        feedback: Option<Feedback<'_>>,
    ) -> Result<Draft, SectionError> {
        let revision = feedback.map(|f| f.previous.revision + 1).unwrap_or(0);

        if evidence.is_empty() {
            debug!(section = %spec.id, revision, "empty evidence set, writing markers only");
            return Ok(Draft {
                section_id: spec.id.clone(),
                text: evidence_gap_text(spec),
                evidence_set_id: evidence.id.clone(),
                revision,
                citations: Vec::new(),
            });
        }

        let mut prompt = build_prompt(spec, query, evidence, feedback, self.retrieval);
        let mut regenerated = false;
        loop {
            let text = with_retry(self.retry, "generate", || self.generator.generate(&prompt)).await?;
            let citations = citation::parse_citations(&text);
            let bad: Vec<String> = citation::unresolved(&citations, evidence)
                .into_iter()
                .map(|c| c.to_string())
                .collect();

            if bad.is_empty() {
                return Ok(Draft {
                    section_id: spec.id.clone(),
                    text,
                    evidence_set_id: evidence.id.clone(),
                    revision,
                    citations,
                });
            }

            if regenerated {
                return Err(MalformedOutputError::UnresolvedCitations { citations: bad }.into());
            }
            warn!(section = %spec.id, revision, unresolved = ?bad, "draft cites spans outside its evidence, regenerating");
            prompt.user.push_str(&format!(
                "\n\nYOUR PREVIOUS ANSWER CITED SPANS THAT ARE NOT IN CONTEXT: {}\n\
                 Cite only tags that appear in CONTEXT, or use {} for the claim.",
                bad.join(", "),
                UNSUPPORTED_MARKER
            ));
            regenerated = true;
        }
    }
}

/// Marker-only text for a section without evidence.
pub fn evidence_gap_text(spec: &SectionSpec) -> String {
    if spec.required_elements.is_empty() {
        return format!("{} {}", spec.title, UNSUPPORTED_MARKER);
    }
    spec.required_elements
        .iter()
        .map(|e| format!("- {}: {}", e, UNSUPPORTED_MARKER))
        .collect::<Vec<_>>()
        .join("\n")
}

fn citation_rules() -> String {
    format!(
        "Citation rules (every sentence stating a fact about the repository MUST end with a tag):\n\
         - Cite with the exact tags shown in CONTEXT, e.g. [src/app.py:10-42].\n\
         - A narrower range inside a tag's range is allowed; any other range is not.\n\
         - Several sources: [a.py:1-20, b.py:5-9] or adjacent tags [a.py:1-20] [b.py:5-9].\n\
         - A deduction from cited content: {} followed by the tags it rests on.\n\
         - A fact CONTEXT does not support: write {} instead of asserting it.\n\
         - Never invent files, line ranges, endpoints, variables, or versions.\n",
        INFERRED_MARKER, UNSUPPORTED_MARKER
    )
}

fn build_prompt(
    spec: &SectionSpec,
    query: &str,
    evidence: &EvidenceSet,
    feedback: Option<Feedback<'_>>,
    retrieval: &RetrievalConfig,
) -> Prompt {
    let system = "You are a senior engineer writing technical documentation for a repository. \
                  Use ONLY the provided CONTEXT and ADDITIONAL CONTEXT. Be concise and factual; \
                  do not hedge with 'likely' or 'maybe'."
        .to_string();

    let mut user = format!(
        "SECTION: {}\nGOAL: {}\nGUIDANCE: {}\n",
        spec.title, query, spec.guidance
    );
    if !spec.required_elements.is_empty() {
        user.push_str(&format!(
            "REQUIRED ELEMENTS: {}\n",
            spec.required_elements.join("; ")
        ));
    }
    user.push_str(&format!("\n{}\n", citation_rules()));
    user.push_str(&format!(
        "CONTEXT:\n{}\n\nADDITIONAL CONTEXT:\n{}\n",
        render_context(evidence, retrieval),
        spec.additional_context
    ));

    if let Some(f) = feedback {
        user.push_str("\nREVIEW OF YOUR PREVIOUS DRAFT:\n");
        if !f.verdict.notes.is_empty() {
            user.push_str(&format!("Notes: {}\n", f.verdict.notes));
        }
        if !f.verdict.missing_but_expected.is_empty() {
            user.push_str(&format!(
                "Missing but expected: {}\n",
                f.verdict.missing_but_expected.join("; ")
            ));
        }
        if !f.verdict.unsupported_claims.is_empty() {
            user.push_str(&format!(
                "Unsupported claims: {}\n",
                f.verdict.unsupported_claims.join("; ")
            ));
        }
        user.push_str(&format!(
            "\nPREVIOUS DRAFT:\n{}\n\nRevise the draft to address the review. ",
            f.previous.text
        ));
    }

    user.push_str(&format!("Write the '{}' section in Markdown.", spec.title));
    Prompt { system, user }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::models::{Chunk, ChunkKind, Evidence, Route, SpanQuality};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Replays canned replies and records every prompt.
    struct Scripted {
        replies: Mutex<Vec<String>>,
        prompts: Mutex<Vec<Prompt>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn generate(&self, prompt: &Prompt) -> Result<String, CapabilityError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            Ok(self.replies.lock().unwrap().pop().unwrap_or_default())
        }
    }

    fn spec() -> SectionSpec {
        SectionSpec {
            id: "installation".to_string(),
            order: 1,
            title: "Installation".to_string(),
            query: "setup".to_string(),
            route: Route::Both,
            k_text: None,
            k_code: None,
            guidance: String::new(),
            additional_context: String::new(),
            required_elements: vec!["environment variables".to_string(), "ports".to_string()],
        }
    }

    fn evidence() -> EvidenceSet {
        let chunk = Arc::new(Chunk {
            id: "c1".to_string(),
            source_path: "app/imports.py".to_string(),
            start_line: 12,
            end_line: 28,
            kind: ChunkKind::Code,
            text: "from dotenv import load_dotenv\nload_dotenv()".to_string(),
            hash: String::new(),
            quality: SpanQuality::Exact,
            symbol: None,
        });
        EvidenceSet {
            id: "ev".to_string(),
            items: vec![Evidence { chunk, score: 0.9 }],
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            timeout: Duration::from_secs(5),
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn empty_evidence_writes_markers_without_calling_model() {
        let gen = Scripted::new(&["should not be used [x.py:1-2]"]);
        let retrieval = RetrievalConfig::default();
        let drafter = Drafter {
            generator: &gen,
            retry: &policy(),
            retrieval: &retrieval,
        };
        let empty = EvidenceSet {
            id: "empty".to_string(),
            items: Vec::new(),
        };
        let d = drafter.draft(&spec(), "setup", &empty, None).await.unwrap();
        assert_eq!(gen.calls(), 0);
        assert!(d.citations.is_empty());
        assert!(citation::parse_citations(&d.text).is_empty());
        assert_eq!(d.text.matches(UNSUPPORTED_MARKER).count(), 2);
    }

    #[tokio::test]
    async fn unresolved_citation_regenerates_once_then_fails() {
        let gen = Scripted::new(&["Bad [app/imports.py:1-5]", "Still bad [utils.py:1-2]"]);
        let retrieval = RetrievalConfig::default();
        let drafter = Drafter {
            generator: &gen,
            retry: &policy(),
            retrieval: &retrieval,
        };
        let err = drafter.draft(&spec(), "setup", &evidence(), None).await.unwrap_err();
        assert!(matches!(
            err,
            SectionError::Malformed(MalformedOutputError::UnresolvedCitations { .. })
        ));
        assert_eq!(gen.calls(), 2);
        let second = &gen.prompts.lock().unwrap()[1];
        assert!(second.user.contains("app/imports.py:1-5"));
    }

    #[tokio::test]
    async fn regeneration_can_recover() {
        let gen = Scripted::new(&[
            "Bad [app/imports.py:1-5]",
            "Environment variables are loaded from a .env file [app/imports.py:12-28]",
        ]);
        let retrieval = RetrievalConfig::default();
        let drafter = Drafter {
            generator: &gen,
            retry: &policy(),
            retrieval: &retrieval,
        };
        let d = drafter.draft(&spec(), "setup", &evidence(), None).await.unwrap();
        assert_eq!(d.revision, 0);
        assert_eq!(d.citations.len(), 1);
        assert_eq!(d.citations[0].to_string(), "app/imports.py:12-28");
    }

    #[tokio::test]
    async fn revision_prompt_carries_verdict_feedback() {
        let gen = Scripted::new(&["Loads .env [app/imports.py:12-28]"]);
        let retrieval = RetrievalConfig::default();
        let drafter = Drafter {
            generator: &gen,
            retry: &policy(),
            retrieval: &retrieval,
        };
        let previous = Draft {
            section_id: "installation".to_string(),
            text: "Old text".to_string(),
            evidence_set_id: "ev".to_string(),
            revision: 1,
            citations: Vec::new(),
        };
        let verdict = Verdict {
            missing_but_expected: vec!["ports".to_string()],
            notes: "mention the port".to_string(),
            ..Verdict::synthetic_failure("")
        };
        let d = drafter
            .draft(
                &spec(),
                "setup",
                &evidence(),
                Some(Feedback {
                    previous: &previous,
                    verdict: &verdict,
                }),
            )
            .await
            .unwrap();
        assert_eq!(d.revision, 2);
        assert_eq!(d.evidence_set_id, "ev");
        let prompt = &gen.prompts.lock().unwrap()[0];
        assert!(prompt.user.contains("Missing but expected: ports"));
        assert!(prompt.user.contains("mention the port"));
        assert!(prompt.user.contains("Old text"));
        assert!(prompt.user.contains("[app/imports.py:12-28]"));
    }
}
