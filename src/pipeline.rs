//! Pipeline Orchestrator: drives one request through
//! classifier → planner → worker stages, resolving each stage's role to
//! a model chain and running it through the Fallback Executor.
//!
//! The planner's output is a short ordered list of steps rather than a
//! general dependency graph — later steps may reference the previous
//! step's output via a `{{previous_output}}` placeholder, which keeps the
//! "DAG" to a simple chain without needing a scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backends::GenerateParams;
use crate::config::SystemConfig;
use crate::error::FabricError;
use crate::fallback::{Attempt, CompositeSkipPolicy, FallbackExecutor, FallbackOutcome, Outcome};
use crate::health::{HealthProber, HealthSkipPolicy};
use crate::privacy::{self, PrivacyAuditorConfig, PrivacySkipPolicy};
use crate::registry::ModelRegistry;
use crate::role;

const CLASSIFIER_PROMPT_TEMPLATE: &str = r#"You are routing a user request to one of these roles: {roles}.
Respond with exactly one role name and nothing else.

Request:
{prompt}"#;

const PLANNER_PROMPT_TEMPLATE: &str = r#"Break the following request into an ordered JSON array of steps.
Each step is an object with "role" (one of: {roles}) and "instruction" (the exact task for that step).
A later step's instruction may contain the literal placeholder {{previous_output}} to reference the prior step's result.
Respond with only the JSON array, no prose.

Request:
{prompt}"#;

/// Optional per-request ceiling on total tokens spent across every
/// attempt in every stage. `None` means unbounded.
pub struct RequestBudget {
    max_total_tokens: Option<u32>,
    spent: AtomicU32,
}

impl RequestBudget {
    pub fn unbounded() -> Self {
        Self {
            max_total_tokens: None,
            spent: AtomicU32::new(0),
        }
    }

    pub fn capped(max_total_tokens: u32) -> Self {
        Self {
            max_total_tokens: Some(max_total_tokens),
            spent: AtomicU32::new(0),
        }
    }

    fn record(&self, tokens: u32) {
        self.spent.fetch_add(tokens, Ordering::Relaxed);
    }

    fn exhausted(&self) -> bool {
        match self.max_total_tokens {
            Some(max) => self.spent.load(Ordering::Relaxed) >= max,
            None => false,
        }
    }
}

struct BudgetSkipPolicy<'a> {
    budget: &'a RequestBudget,
}

impl<'a> crate::fallback::SkipPolicy for BudgetSkipPolicy<'a> {
    fn should_skip(&self, _model_id: &str) -> Option<Outcome> {
        if self.budget.exhausted() {
            Some(Outcome::SkippedBudget)
        } else {
            None
        }
    }
}

/// Classifier stage result.
#[derive(Debug, Clone)]
pub struct Classification {
    pub role: String,
}

/// One step of the planner's output.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanStep {
    pub role: String,
    pub instruction: String,
}

/// Result of running one plan step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub role: String,
    pub output_text: String,
}

/// Full result of a pipeline run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub classification: Classification,
    pub steps: Vec<StepResult>,
    pub attempts: Vec<Attempt>,
    pub final_text: String,
    /// Set when the planner's output couldn't be parsed into a non-empty
    /// step list — whether it looked JSON-shaped and failed to parse, or
    /// never looked JSON-shaped at all — and the run fell back to a single
    /// direct step under the classified role.
    pub plan_parse_failed: bool,
}

/// Planner stage outcome: the steps to run, plus whether they came from a
/// parsed plan or a parse-failure fallback to a single direct step.
struct PlanOutcome {
    steps: Vec<PlanStep>,
    parse_failed: bool,
}

pub struct PipelineOrchestrator {
    registry: Arc<ModelRegistry>,
    health: Arc<HealthProber>,
    privacy_config: PrivacyAuditorConfig,
}

impl PipelineOrchestrator {
    pub fn new(registry: Arc<ModelRegistry>, health: Arc<HealthProber>, privacy_config: PrivacyAuditorConfig) -> Self {
        Self {
            registry,
            health,
            privacy_config,
        }
    }

    /// Runs `prompt` through classify → plan → execute. When `forced_role`
    /// names a known role other than `router`, classification is skipped
    /// and the request runs as a single direct step under that role —
    /// this is how a caller that already knows the right role (rather
    /// than relying on the classifier) steers the request.
    pub async fn run(
        &self,
        prompt: &str,
        forced_role: Option<&str>,
        config: &SystemConfig,
        budget: &RequestBudget,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, FabricError> {
        let mut attempts = Vec::new();

        let resolved_forced_role = forced_role
            .map(|role| role::resolve_role(role, config))
            .transpose()?
            .filter(|role| role != "router");

        let classification = match resolved_forced_role {
            Some(role) => Classification { role },
            None => self.classify(prompt, config, budget, cancel, &mut attempts).await?,
        };
        info!(role = %classification.role, "classified request");

        let plan_outcome = self
            .plan(prompt, &classification, config, budget, cancel, &mut attempts)
            .await?;

        let mut previous_output = String::new();
        let mut steps = Vec::with_capacity(plan_outcome.steps.len());

        for step in &plan_outcome.steps {
            if cancel.is_cancelled() {
                return Err(FabricError::Cancelled {
                    stage: "worker".to_string(),
                });
            }

            let instruction = step.instruction.replace("{{previous_output}}", &previous_output);
            let output = self
                .run_stage("worker", &step.role, &instruction, config, budget, cancel, &mut attempts)
                .await?;

            previous_output = output.clone();
            steps.push(StepResult {
                role: step.role.clone(),
                output_text: output,
            });
        }

        let final_text = steps
            .last()
            .map(|s| s.output_text.clone())
            .unwrap_or_default();

        Ok(ExecutionResult {
            classification,
            steps,
            attempts,
            final_text,
            plan_parse_failed: plan_outcome.parse_failed,
        })
    }

    async fn classify(
        &self,
        prompt: &str,
        config: &SystemConfig,
        budget: &RequestBudget,
        cancel: &CancellationToken,
        attempts: &mut Vec<Attempt>,
    ) -> Result<Classification, FabricError> {
        let roles = role_listing(config);
        let classifier_prompt = CLASSIFIER_PROMPT_TEMPLATE
            .replace("{roles}", &roles)
            .replace("{prompt}", prompt);

        let raw = self
            .run_stage("classify", "router", &classifier_prompt, config, budget, cancel, attempts)
            .await?;

        match role::resolve_role(raw.trim(), config) {
            Ok(resolved) => Ok(Classification { role: resolved }),
            Err(_) => {
                warn!(raw = %raw, "classifier output did not resolve to a known role, defaulting to reasoning");
                Ok(Classification {
                    role: "reasoning".to_string(),
                })
            }
        }
    }

    async fn plan(
        &self,
        prompt: &str,
        classification: &Classification,
        config: &SystemConfig,
        budget: &RequestBudget,
        cancel: &CancellationToken,
        attempts: &mut Vec<Attempt>,
    ) -> Result<PlanOutcome, FabricError> {
        let roles = role_listing(config);
        let planner_prompt = PLANNER_PROMPT_TEMPLATE
            .replace("{roles}", &roles)
            .replace("{prompt}", prompt);

        let raw = self
            .run_stage("plan", &classification.role, &planner_prompt, config, budget, cancel, attempts)
            .await?;

        let parsed: Result<Vec<PlanStep>, _> = serde_json::from_str(extract_json_array(&raw));
        let (mut steps, parse_failed) = match parsed {
            Ok(steps) if !steps.is_empty() => (steps, false),
            Ok(_) | Err(_) => {
                if looks_like_json_array(&raw) {
                    warn!(raw = %raw, "planner output looked JSON-shaped but did not parse, degrading to direct execution");
                } else {
                    warn!(raw = %raw, "planner output did not parse, degrading to direct execution");
                }
                (
                    vec![PlanStep {
                        role: classification.role.clone(),
                        instruction: prompt.to_string(),
                    }],
                    true,
                )
            }
        };

        let max_steps = config.system.max_plan_steps;
        if steps.len() > max_steps {
            warn!(requested = steps.len(), allowed = max_steps, "planner exceeded step budget, truncating");
            steps.truncate(max_steps);
        }

        Ok(PlanOutcome { steps, parse_failed })
    }

    async fn run_stage(
        &self,
        stage: &str,
        role: &str,
        prompt: &str,
        config: &SystemConfig,
        budget: &RequestBudget,
        cancel: &CancellationToken,
        attempts: &mut Vec<Attempt>,
    ) -> Result<String, FabricError> {
        let resolved_role = role::resolve_role(role, config)?;
        let chain = role::chain_for(&resolved_role, config)?;

        let findings = privacy::scan(prompt, &self.privacy_config);
        let privacy_policy = PrivacySkipPolicy::new(&findings, &config.models);
        let health_policy = HealthSkipPolicy::new(&self.health);
        let budget_policy = BudgetSkipPolicy { budget };
        let skip_policy = CompositeSkipPolicy::new(vec![&privacy_policy, &health_policy, &budget_policy]);

        let adapters = self.registry.snapshot();
        let params = GenerateParams::default();
        let deadline = Duration::from_secs(config.system.default_timeout_seconds);

        let outcome = FallbackExecutor::run(chain, prompt, &params, &skip_policy, cancel, deadline, |model_id| {
            adapters.get(model_id).map(Arc::clone)
        })
        .await;

        match outcome {
            FallbackOutcome::Succeeded { output, attempts: stage_attempts } => {
                if let Some(tokens) = output.tokens_out {
                    budget.record(tokens);
                }
                attempts.extend(stage_attempts);
                Ok(output.text)
            }
            FallbackOutcome::AllFailed { attempts: stage_attempts } => {
                let all_privacy_skips = !stage_attempts.is_empty()
                    && stage_attempts.iter().all(|a| a.outcome == Outcome::SkippedPrivacy);
                attempts.extend(stage_attempts.clone());
                if all_privacy_skips {
                    Err(FabricError::PiiNoViableModel {
                        stage: stage.to_string(),
                    })
                } else {
                    Err(FabricError::AllFailed {
                        stage: stage.to_string(),
                        attempts: stage_attempts,
                    })
                }
            }
            FallbackOutcome::Cancelled { attempts: stage_attempts } => {
                attempts.extend(stage_attempts);
                Err(FabricError::Cancelled {
                    stage: stage.to_string(),
                })
            }
        }
    }
}

fn role_listing(config: &SystemConfig) -> String {
    let mut roles: Vec<&String> = config.roles.keys().collect();
    roles.sort();
    roles
        .into_iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn looks_like_json_array(raw: &str) -> bool {
    extract_json_array(raw).trim_start().starts_with('[')
}

fn extract_json_array(raw: &str) -> &str {
    let start = raw.find('[');
    let end = raw.rfind(']');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &raw[s..=e],
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_array_trims_surrounding_prose() {
        let raw = "here is the plan:\n[{\"role\":\"coding\",\"instruction\":\"do it\"}]\nthanks";
        assert_eq!(
            extract_json_array(raw),
            "[{\"role\":\"coding\",\"instruction\":\"do it\"}]"
        );
    }

    #[test]
    fn budget_exhausted_after_cap_reached() {
        let budget = RequestBudget::capped(10);
        assert!(!budget.exhausted());
        budget.record(10);
        assert!(budget.exhausted());
    }

    #[test]
    fn unbounded_budget_never_exhausted() {
        let budget = RequestBudget::unbounded();
        budget.record(1_000_000);
        assert!(!budget.exhausted());
    }

    #[test]
    fn role_listing_is_sorted() {
        let mut roles = std::collections::HashMap::new();
        roles.insert("router".to_string(), crate::config::RoleChain(vec![]));
        roles.insert("coding".to_string(), crate::config::RoleChain(vec![]));
        let config = SystemConfig {
            roles,
            ..Default::default()
        };
        assert_eq!(role_listing(&config), "coding, router");
    }
}
