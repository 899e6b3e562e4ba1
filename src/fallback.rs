//! Fallback Executor: walks a role's model chain in order,
//! skipping models the caller's policy rules out, and stops at the first
//! attempt that succeeds.
//!
//! Chain order is never reshuffled — health and privacy only ever remove
//! candidates, they don't reorder them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backends::{GenerateOutput, GenerateParams, ProviderAdapter};
use crate::error::AdapterError;

/// Why a single model attempt ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    SkippedBudget,
    SkippedPrivacy,
    SkippedUnhealthy,
    Error,
}

/// One row of the per-request attempt ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl Attempt {
    fn skipped(model_id: &str, outcome: Outcome) -> Self {
        let now = Utc::now();
        Self {
            model_id: model_id.to_string(),
            started_at: now,
            ended_at: now,
            outcome,
            error_kind: None,
            tokens_in: None,
            tokens_out: None,
            preview: None,
        }
    }
}

/// Decides, for one candidate model, whether the Fallback Executor should
/// even attempt a call. Implementations compose privacy, health-cache and
/// budget checks in a fixed order: privacy first, then health, then
/// budget.
pub trait SkipPolicy {
    /// Returns `Some(outcome)` naming why the model must be skipped, or
    /// `None` if the call should proceed.
    fn should_skip(&self, model_id: &str) -> Option<Outcome>;
}

/// A policy that never skips — used by tests and by chains with a single
/// candidate where skip semantics are moot.
pub struct NoSkip;

impl SkipPolicy for NoSkip {
    fn should_skip(&self, _model_id: &str) -> Option<Outcome> {
        None
    }
}

/// Composable skip policy: runs a list of sub-policies in order and
/// returns the first skip any of them reports.
pub struct CompositeSkipPolicy<'a> {
    policies: Vec<&'a dyn SkipPolicy>,
}

impl<'a> CompositeSkipPolicy<'a> {
    pub fn new(policies: Vec<&'a dyn SkipPolicy>) -> Self {
        Self { policies }
    }
}

impl<'a> SkipPolicy for CompositeSkipPolicy<'a> {
    fn should_skip(&self, model_id: &str) -> Option<Outcome> {
        self.policies.iter().find_map(|p| p.should_skip(model_id))
    }
}

/// Outcome of a full chain walk.
pub enum FallbackOutcome {
    Succeeded {
        output: GenerateOutput,
        attempts: Vec<Attempt>,
    },
    AllFailed {
        attempts: Vec<Attempt>,
    },
    Cancelled {
        attempts: Vec<Attempt>,
    },
}

/// Walks `chain` in order, calling `adapter_for` to resolve each model id
/// to a live adapter. Stops at the first `Ok` attempt.
pub struct FallbackExecutor;

impl FallbackExecutor {
    pub async fn run<F>(
        chain: &[String],
        prompt: &str,
        params: &GenerateParams,
        skip_policy: &dyn SkipPolicy,
        cancel: &CancellationToken,
        per_attempt_deadline: Duration,
        mut adapter_for: F,
    ) -> FallbackOutcome
    where
        F: FnMut(&str) -> Option<std::sync::Arc<ProviderAdapter>>,
    {
        let mut attempts = Vec::with_capacity(chain.len());

        for model_id in chain {
            if cancel.is_cancelled() {
                return FallbackOutcome::Cancelled { attempts };
            }

            if let Some(outcome) = skip_policy.should_skip(model_id) {
                attempts.push(Attempt::skipped(model_id, outcome));
                continue;
            }

            let Some(adapter) = adapter_for(model_id) else {
                attempts.push(Attempt::skipped(model_id, Outcome::SkippedUnhealthy));
                continue;
            };

            let started_at = Utc::now();
            let call = adapter.generate(prompt, params);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let ended_at = Utc::now();
                    attempts.push(Attempt {
                        model_id: model_id.clone(),
                        started_at,
                        ended_at,
                        outcome: Outcome::Error,
                        error_kind: Some("cancelled".to_string()),
                        tokens_in: None,
                        tokens_out: None,
                        preview: None,
                    });
                    return FallbackOutcome::Cancelled { attempts };
                }
                res = tokio::time::timeout(per_attempt_deadline, call) => res,
            };

            let ended_at = Utc::now();

            match result {
                Ok(Ok(output)) => {
                    attempts.push(Attempt {
                        model_id: model_id.clone(),
                        started_at,
                        ended_at,
                        outcome: Outcome::Ok,
                        error_kind: None,
                        tokens_in: output.tokens_in,
                        tokens_out: output.tokens_out,
                        preview: Some(preview_of(&output.text)),
                    });
                    return FallbackOutcome::Succeeded { output, attempts };
                }
                Ok(Err(err)) => {
                    attempts.push(attempt_for_error(model_id, started_at, ended_at, err));
                }
                Err(_elapsed) => {
                    attempts.push(Attempt {
                        model_id: model_id.clone(),
                        started_at,
                        ended_at,
                        outcome: Outcome::Error,
                        error_kind: Some("timeout".to_string()),
                        tokens_in: None,
                        tokens_out: None,
                        preview: None,
                    });
                }
            }
        }

        FallbackOutcome::AllFailed { attempts }
    }
}

fn attempt_for_error(
    model_id: &str,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    err: AdapterError,
) -> Attempt {
    Attempt {
        model_id: model_id.to_string(),
        started_at,
        ended_at,
        outcome: Outcome::Error,
        error_kind: Some(err.kind_str()),
        tokens_in: None,
        tokens_out: None,
        preview: None,
    }
}

fn preview_of(text: &str) -> String {
    const MAX: usize = 200;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut cut = MAX;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ProviderAdapter;

    struct AlwaysSkip;
    impl SkipPolicy for AlwaysSkip {
        fn should_skip(&self, _model_id: &str) -> Option<Outcome> {
            Some(Outcome::SkippedPrivacy)
        }
    }

    #[tokio::test]
    async fn empty_chain_is_all_failed() {
        let cancel = CancellationToken::new();
        let outcome = FallbackExecutor::run(
            &[],
            "hi",
            &GenerateParams::default(),
            &NoSkip,
            &cancel,
            Duration::from_secs(1),
            |_| -> Option<std::sync::Arc<ProviderAdapter>> { None },
        )
        .await;

        match outcome {
            FallbackOutcome::AllFailed { attempts } => assert!(attempts.is_empty()),
            _ => panic!("expected AllFailed"),
        }
    }

    #[tokio::test]
    async fn skip_policy_marks_every_candidate_and_still_fails() {
        let chain = vec!["a".to_string(), "b".to_string()];
        let cancel = CancellationToken::new();
        let outcome = FallbackExecutor::run(
            &chain,
            "hi",
            &GenerateParams::default(),
            &AlwaysSkip,
            &cancel,
            Duration::from_secs(1),
            |_| -> Option<std::sync::Arc<ProviderAdapter>> { None },
        )
        .await;

        match outcome {
            FallbackOutcome::AllFailed { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts
                    .iter()
                    .all(|a| a.outcome == Outcome::SkippedPrivacy));
            }
            _ => panic!("expected AllFailed"),
        }
    }

    #[tokio::test]
    async fn already_cancelled_short_circuits_before_first_attempt() {
        let chain = vec!["a".to_string()];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = FallbackExecutor::run(
            &chain,
            "hi",
            &GenerateParams::default(),
            &NoSkip,
            &cancel,
            Duration::from_secs(1),
            |_| -> Option<std::sync::Arc<ProviderAdapter>> { None },
        )
        .await;

        match outcome {
            FallbackOutcome::Cancelled { attempts } => assert!(attempts.is_empty()),
            _ => panic!("expected Cancelled"),
        }
    }
}
