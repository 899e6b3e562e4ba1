//! Privacy Auditor: a best-effort, regex-based scan that
//! flags prompts likely to contain personally identifying information so
//! the Fallback Executor can skip models that aren't marked `private`.
//!
//! This is intentionally conservative rather than exhaustive — false
//! positives cost a skipped cloud model, false negatives cost nothing the
//! rest of the system was promising to prevent anyway. Each detector can
//! be turned off independently for deployments that find it too noisy.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{Locality, ModelEntry};
use crate::fallback::{Outcome, SkipPolicy};

/// One category of detected PII.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Email,
    Phone,
    StreetAddress,
    NationalId,
    CreditCard,
}

/// Per-detector toggles. All default to enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyAuditorConfig {
    #[serde(default = "enabled")]
    pub detect_email: bool,
    #[serde(default = "enabled")]
    pub detect_phone: bool,
    #[serde(default = "enabled")]
    pub detect_street_address: bool,
    #[serde(default = "enabled")]
    pub detect_national_id: bool,
    #[serde(default = "enabled")]
    pub detect_credit_card: bool,
}

fn enabled() -> bool {
    true
}

impl Default for PrivacyAuditorConfig {
    fn default() -> Self {
        Self {
            detect_email: true,
            detect_phone: true,
            detect_street_address: true,
            detect_national_id: true,
            detect_credit_card: true,
        }
    }
}

/// Result of scanning one prompt: empty means nothing was flagged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivacyFindings(pub HashSet<PiiKind>);

impl PrivacyFindings {
    pub fn is_sensitive(&self) -> bool {
        !self.0.is_empty()
    }
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\+?\d{1,3}[-.\s]?)?\(?\d{3}\)?[-.\s]\d{3}[-.\s]\d{4}\b").unwrap()
    })
}

fn street_address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b\d{1,6}\s+([A-Za-z]+\s+){0,3}(street|st\.?|avenue|ave\.?|boulevard|blvd\.?|road|rd\.?|lane|ln\.?|drive|dr\.?|court|ct\.?|way)\b",
        )
        .unwrap()
    })
}

fn national_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap())
}

fn digit_run_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:\d[ -]?){13,19}\b").unwrap())
}

fn luhn_valid(digits: &str) -> bool {
    let cleaned: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    if cleaned.len() < 13 || cleaned.len() > 19 {
        return false;
    }
    let sum: u32 = cleaned
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// Scans `text` for PII, honoring `config`'s per-detector toggles.
pub fn scan(text: &str, config: &PrivacyAuditorConfig) -> PrivacyFindings {
    let mut found = HashSet::new();

    if config.detect_email && email_regex().is_match(text) {
        found.insert(PiiKind::Email);
    }
    if config.detect_phone && phone_regex().is_match(text) {
        found.insert(PiiKind::Phone);
    }
    if config.detect_street_address && street_address_regex().is_match(text) {
        found.insert(PiiKind::StreetAddress);
    }
    if config.detect_national_id && national_id_regex().is_match(text) {
        found.insert(PiiKind::NationalId);
    }
    if config.detect_credit_card
        && digit_run_regex()
            .find_iter(text)
            .any(|m| luhn_valid(m.as_str()))
    {
        found.insert(PiiKind::CreditCard);
    }

    PrivacyFindings(found)
}

/// Skip policy that narrows a chain to privacy-safe models once a prompt
/// has been flagged: a flagged prompt may only go to a model tagged
/// `private` or resolved to `local`. An unflagged prompt never triggers
/// this policy.
pub struct PrivacySkipPolicy<'a> {
    findings: &'a PrivacyFindings,
    models: &'a HashMap<String, ModelEntry>,
}

impl<'a> PrivacySkipPolicy<'a> {
    pub fn new(findings: &'a PrivacyFindings, models: &'a HashMap<String, ModelEntry>) -> Self {
        Self { findings, models }
    }
}

impl<'a> SkipPolicy for PrivacySkipPolicy<'a> {
    fn should_skip(&self, model_id: &str) -> Option<Outcome> {
        if !self.findings.is_sensitive() {
            return None;
        }
        match self.models.get(model_id) {
            Some(entry) if entry.is_private() || entry.resolved_locality() == Locality::Local => None,
            _ => Some(Outcome::SkippedPrivacy),
        }
    }
}
