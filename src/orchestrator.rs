//! Per-section write → judge → revise state machine and section scheduling.
//!
//! # State machine
//!
//! ```text
//!            Drafted           Passed
//! DRAFTING ──────────▶ JUDGING ───────▶ SAVED
//!    ▲                    │  └─────────▶ SAVED (forced_accept)
//!    │ Revised            │ Failed          Exhausted
//!    └──────── REVISING ◀─┘
//! ```
//!
//! Transitions come from one table ([`next_state`]). `Failed` is only
//! raised while `revision < max_revisions` and each revision raises the
//! number by one, so a section makes at most `max_revisions + 1` drafts.
//! A section whose capabilities fail is saved with `forced_accept` and a
//! synthetic zero-score verdict; only run-level faults abort the run.
//!
//! # Scheduling
//!
//! Sections are independent except for `{{section:<id>}}` references in
//! query templates. They run in dependency waves, each wave concurrently
//! under `section_concurrency`. Cancellation is checked before every
//! section: nothing new starts once the token fires, and a section that is
//! still in flight is abandoned without persisting anything.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

use crate::citation::{has_unsupported_marker, UNSUPPORTED_MARKER};
use crate::config::ReviewConfig;
use crate::context::RunContext;
use crate::draft::{Drafter, Feedback};
use crate::error::{RunError, SectionError};
use crate::judge::Judge;
use crate::models::{Draft, EvidenceSet, SectionOutcome, SectionSpec, Verdict};
use crate::progress::ProgressEvent;
use crate::plan::SectionGraph;
use crate::retrieve::{render_query, retrieve};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    Drafting,
    Judging,
    Revising,
    Saved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionEvent {
    Drafted,
    Passed,
    /// Verdict failed and revisions remain.
    Failed,
    /// Verdict failed with no revisions left.
    Exhausted,
    Revised,
}

const TRANSITIONS: &[(SectionState, SectionEvent, SectionState)] = &[
    (SectionState::Drafting, SectionEvent::Drafted, SectionState::Judging),
    (SectionState::Judging, SectionEvent::Passed, SectionState::Saved),
    (SectionState::Judging, SectionEvent::Exhausted, SectionState::Saved),
    (SectionState::Judging, SectionEvent::Failed, SectionState::Revising),
    (SectionState::Revising, SectionEvent::Revised, SectionState::Drafting),
];

/// Look up a transition; `None` means the event is illegal in `state`.
pub fn next_state(state: SectionState, event: SectionEvent) -> Option<SectionState> {
    TRANSITIONS
        .iter()
        .find(|(from, on, _)| *from == state && *on == event)
        .map(|(_, _, to)| *to)
}

/// Whether a verdict saves the section without another revision.
pub fn passes(policy: &ReviewConfig, verdict: &Verdict) -> bool {
    (!policy.require_factual || verdict.factual)
        && (!policy.require_cites_ok || verdict.cites_ok)
        && (!policy.forbid_hallucination || !verdict.hallucinated)
        && verdict.score >= policy.min_score
}

/// Event after judging revision `revision`.
pub fn judge_event(policy: &ReviewConfig, verdict: &Verdict, revision: u32) -> SectionEvent {
    if passes(policy, verdict) {
        SectionEvent::Passed
    } else if revision >= policy.max_revisions {
        SectionEvent::Exhausted
    } else {
        SectionEvent::Failed
    }
}

fn advance(state: SectionState, event: SectionEvent) -> Result<SectionState, RunError> {
    next_state(state, event).ok_or_else(|| {
        RunError::Config(format!("illegal section transition {:?} on {:?}", state, event))
    })
}

/// Drive one section to `SAVED`.
///
/// `saved` holds the text of earlier sections for query templates.
pub async fn run_section(
    ctx: &RunContext,
    spec: &SectionSpec,
    saved: &HashMap<String, String>,
) -> Result<SectionOutcome, RunError> {
    let query = render_query(&spec.query, saved);
    let evidence = match retrieve(
        spec,
        &query,
        &ctx.indexes,
        ctx.capabilities.embedder.as_ref(),
        &ctx.retrieval,
        &ctx.embed_retry,
    )
    .await
    {
        Ok(e) => e,
        Err(e) => {
            let empty = EvidenceSet {
                id: String::new(),
                items: Vec::new(),
            };
            return section_failure(ctx, spec, &empty, None, 0, 0, e.into()).await;
        }
    };
    info!(section = %spec.id, evidence = evidence.len(), "evidence retrieved");

    let drafter = Drafter {
        generator: ctx.capabilities.generator.as_ref(),
        retry: &ctx.generation_retry,
        retrieval: &ctx.retrieval,
    };
    let judge = Judge {
        model: ctx.capabilities.judge.as_ref(),
        retry: &ctx.generation_retry,
        retrieval: &ctx.retrieval,
    };

    let mut state = SectionState::Drafting;
    let mut revision = 0u32;
    let mut attempts = 0u32;
    let mut judged: Option<(Draft, Verdict)> = None;

    loop {
        match state {
            SectionState::Drafting => {
                attempts += 1;
                let feedback = judged.as_ref().map(|(d, v)| Feedback {
                    previous: d,
                    verdict: v,
                });
                let draft = match drafter.draft(spec, &query, &evidence, feedback).await {
                    Ok(d) => d,
                    Err(e) => {
                        let last = judged.map(|(d, _)| d);
                        return section_failure(ctx, spec, &evidence, last, revision, attempts, e)
                            .await;
                    }
                };
                debug_assert_eq!(draft.revision, revision);
                state = advance(state, SectionEvent::Drafted)?;

                let verdict = match judge.judge(&draft, &evidence, spec).await {
                    Ok(v) => v,
                    Err(e) => {
                        return section_failure(ctx, spec, &evidence, Some(draft), revision, attempts, e)
                            .await;
                    }
                };
                ctx.audit.record_verdict(&ctx.run_id, &draft, &verdict).await?;

                let event = judge_event(&ctx.review, &verdict, revision);
                state = advance(state, event)?;
                info!(
                    section = %spec.id,
                    revision,
                    score = verdict.score,
                    unsupported = has_unsupported_marker(&draft.text),
                    ?event,
                    "judged"
                );
                judged = Some((draft, verdict));
            }
            SectionState::Revising => {
                revision += 1;
                state = advance(state, SectionEvent::Revised)?;
            }
            SectionState::Saved => {
                let (draft, verdict) = judged.ok_or_else(|| {
                    RunError::Config("section saved without a judged draft".to_string())
                })?;
                let forced_accept = !passes(&ctx.review, &verdict);
                if forced_accept {
                    warn!(section = %spec.id, attempts, score = verdict.score, "revision budget exhausted, forced accept");
                }
                let outcome = SectionOutcome {
                    section_id: spec.id.clone(),
                    title: spec.title.clone(),
                    order: spec.order,
                    draft,
                    verdict,
                    forced_accept,
                    attempts,
                };
                ctx.audit.record_outcome(&ctx.run_id, &outcome).await?;
                return Ok(outcome);
            }
            SectionState::Judging => {
                return Err(RunError::Config(
                    "judging state reached outside a draft step".to_string(),
                ))
            }
        }
    }
}

/// Save a section whose capabilities failed, with a synthetic verdict.
async fn section_failure(
    ctx: &RunContext,
    spec: &SectionSpec,
    evidence: &EvidenceSet,
    last_draft: Option<Draft>,
    revision: u32,
    attempts: u32,
    error: SectionError,
) -> Result<SectionOutcome, RunError> {
    warn!(section = %spec.id, revision, %error, "section failed, forced accept");
    let verdict = Verdict::synthetic_failure(format!("section failed: {}", error));
    let draft = last_draft.unwrap_or_else(|| Draft {
        section_id: spec.id.clone(),
        text: format!("{} {}", spec.title, UNSUPPORTED_MARKER),
        evidence_set_id: evidence.id.clone(),
        revision,
        citations: Vec::new(),
    });
    let audited = Draft {
        revision,
        ..draft.clone()
    };
    ctx.audit.record_verdict(&ctx.run_id, &audited, &verdict).await?;

    let outcome = SectionOutcome {
        section_id: spec.id.clone(),
        title: spec.title.clone(),
        order: spec.order,
        draft,
        verdict,
        forced_accept: true,
        attempts,
    };
    ctx.audit.record_outcome(&ctx.run_id, &outcome).await?;
    Ok(outcome)
}

/// Group sections into dependency waves, each sorted by `order` then id.
pub fn plan_waves(sections: &[SectionSpec]) -> Result<Vec<Vec<SectionSpec>>, RunError> {
    SectionGraph::build(sections)
        .and_then(|graph| graph.waves())
        .map_err(|e| RunError::Config(e.to_string()))
}

/// Outcomes of a run, in document order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<SectionOutcome>,
    /// The run was cancelled; sections not in `outcomes` were never saved.
    pub cancelled: bool,
}

/// Run every section to completion or cancellation.
pub async fn run_sections(ctx: Arc<RunContext>, sections: &[SectionSpec]) -> Result<RunReport, RunError> {
    let waves = plan_waves(sections)?;
    let semaphore = Arc::new(Semaphore::new(ctx.section_concurrency));
    let mut saved: HashMap<String, String> = HashMap::new();
    let mut report = RunReport::default();

    'waves: for wave in waves {
        let snapshot = Arc::new(saved.clone());
        let mut tasks: JoinSet<Option<Result<SectionOutcome, RunError>>> = JoinSet::new();

        for spec in wave {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit,
            };
            let ctx = ctx.clone();
            let snapshot = snapshot.clone();
            let span = tracing::info_span!("section", run_id = %ctx.run_id, section = %spec.id);
            tasks.spawn(
                async move {
                    let _permit = permit;
                    if ctx.cancel.is_cancelled() {
                        return None;
                    }
                    ctx.progress.report(ProgressEvent::SectionStarted {
                        section: spec.id.clone(),
                    });
                    // A finished section wins over a cancel seen in the same poll.
                    tokio::select! {
                        biased;
                        outcome = run_section(&ctx, &spec, &snapshot) => Some(outcome),
                        _ = ctx.cancel.cancelled() => None,
                    }
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| RunError::Config(format!("section task failed: {}", e)))?;
            match result {
                Some(outcome) => {
                    let outcome = outcome?;
                    ctx.progress.report(ProgressEvent::SectionFinished {
                        section: outcome.section_id.clone(),
                        attempts: outcome.attempts,
                        forced_accept: outcome.forced_accept,
                    });
                    saved.insert(outcome.section_id.clone(), outcome.draft.text.clone());
                    report.outcomes.push(outcome);
                }
                None => report.cancelled = true,
            }
        }

        if ctx.cancel.is_cancelled() {
            report.cancelled = true;
            break 'waves;
        }
    }

    report
        .outcomes
        .sort_by(|a, b| (a.order, &a.section_id).cmp(&(b.order, &b.section_id)));
    info!(
        run_id = %ctx.run_id,
        sections = report.outcomes.len(),
        forced = report.outcomes.iter().filter(|o| o.forced_accept).count(),
        cancelled = report.cancelled,
        "run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Route;

    fn verdict(factual: bool, cites_ok: bool, hallucinated: bool, score: f64) -> Verdict {
        Verdict {
            factual,
            cites_ok,
            hallucinated,
            missing_but_expected: Vec::new(),
            unsupported_claims: Vec::new(),
            score,
            notes: String::new(),
        }
    }

    fn section(id: &str, order: u32, query: &str) -> SectionSpec {
        SectionSpec {
            id: id.to_string(),
            order,
            title: id.to_string(),
            query: query.to_string(),
            route: Route::Both,
            k_text: None,
            k_code: None,
            guidance: String::new(),
            additional_context: String::new(),
            required_elements: Vec::new(),
        }
    }

    #[test]
    fn transition_table() {
        use SectionEvent::*;
        use SectionState::*;
        assert_eq!(next_state(Drafting, Drafted), Some(Judging));
        assert_eq!(next_state(Judging, Passed), Some(Saved));
        assert_eq!(next_state(Judging, Exhausted), Some(Saved));
        assert_eq!(next_state(Judging, Failed), Some(Revising));
        assert_eq!(next_state(Revising, Revised), Some(Drafting));
        assert_eq!(next_state(Saved, Drafted), None);
        assert_eq!(next_state(Drafting, Passed), None);
    }

    #[test]
    fn default_pass_policy() {
        let policy = ReviewConfig::default();
        assert!(passes(&policy, &verdict(true, true, false, 0.75)));
        assert!(!passes(&policy, &verdict(true, true, false, 0.74)));
        assert!(!passes(&policy, &verdict(false, true, false, 0.9)));
        assert!(!passes(&policy, &verdict(true, false, false, 0.9)));
        assert!(!passes(&policy, &verdict(true, true, true, 0.9)));

        let lenient = ReviewConfig {
            require_cites_ok: false,
            min_score: 0.5,
            ..ReviewConfig::default()
        };
        assert!(passes(&lenient, &verdict(true, false, false, 0.5)));
    }

    #[test]
    fn loop_terminates_within_budget() {
        let policy = ReviewConfig {
            max_revisions: 2,
            ..ReviewConfig::default()
        };
        let failing = verdict(false, false, true, 0.0);
        let mut state = SectionState::Drafting;
        let mut revision = 0;
        let mut drafts = 0;
        while state != SectionState::Saved {
            state = match state {
                SectionState::Drafting => {
                    drafts += 1;
                    next_state(state, SectionEvent::Drafted).unwrap()
                }
                SectionState::Judging => {
                    next_state(state, judge_event(&policy, &failing, revision)).unwrap()
                }
                SectionState::Revising => {
                    revision += 1;
                    next_state(state, SectionEvent::Revised).unwrap()
                }
                SectionState::Saved => unreachable!(),
            };
        }
        assert_eq!(drafts, 3);
        assert_eq!(revision, 2);
    }

    #[test]
    fn waves_follow_template_dependencies() {
        let sections = vec![
            section("install", 4, "setup for {{section:tech}}"),
            section("objective", 1, "goals"),
            section("tech", 3, "technologies"),
            section("usage", 5, "usage of {{section:install}} and {{section:tech}}"),
        ];
        let waves = plan_waves(&sections).unwrap();
        let ids: Vec<Vec<&str>> = waves
            .iter()
            .map(|w| w.iter().map(|s| s.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["objective", "tech"], vec!["install"], vec!["usage"]]);
    }

    #[test]
    fn cyclic_plan_is_rejected() {
        let sections = vec![
            section("a", 1, "{{section:b}}"),
            section("b", 2, "{{section:a}}"),
        ];
        assert!(matches!(plan_waves(&sections), Err(RunError::Config(_))));
    }
}
