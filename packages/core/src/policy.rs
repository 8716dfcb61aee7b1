// ABOUTME: Policy decision contract consulted before any sandbox is created
// ABOUTME: Includes a rule-based engine that blocks destructive commands and grades risk

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk grade attached to every policy decision and execution record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyVerdict {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub verdict: PolicyVerdict,
    pub risk_level: RiskLevel,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow(risk_level: RiskLevel) -> Self {
        Self {
            verdict: PolicyVerdict::Allow,
            risk_level,
            reason: None,
        }
    }

    pub fn deny(risk_level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            verdict: PolicyVerdict::Deny,
            risk_level,
            reason: Some(reason.into()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict == PolicyVerdict::Allow
    }
}

/// Who is asking to run a command, and where
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub job_id: String,
    pub workspace_id: String,
    pub user_id: Option<String>,
    pub working_dir: String,
}

/// Decides whether a command may run. A deny is terminal for the job.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn check(&self, command: &str, context: &PolicyContext) -> PolicyDecision;
}

/// Commands that are never allowed, matched against each command segment
const CRITICAL_PREFIXES: &[&str] = &[
    "mkfs",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "init 0",
    "init 6",
    "chmod -r 777 /",
    "chown -r / ",
];

/// Commands that escalate privileges or pipe remote code into a shell
const HIGH_RISK_PREFIXES: &[&str] = &["sudo", "su ", "doas", "chmod 777", "rm -rf", "rm -fr"];

/// Commands that reach the network or mutate remote state
const MEDIUM_RISK_PREFIXES: &[&str] = &[
    "curl", "wget", "ssh", "scp", "rsync", "nc ", "ncat", "git push", "npm publish",
];

/// Rule-based policy engine.
///
/// Splits a command line on shell separators and matches each segment against
/// blocked patterns. Denials carry the risk level that triggered them.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedPolicy {
    blocked_prefixes: Vec<String>,
}

impl RuleBasedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additional operator-configured prefixes denied with high risk
    pub fn with_blocked_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.blocked_prefixes = prefixes
            .into_iter()
            .map(|p| normalize(&p))
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    pub fn evaluate(&self, command: &str) -> PolicyDecision {
        let normalized = normalize(command);

        let compact: String = normalized.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.contains(":(){:|:&};:") {
            return PolicyDecision::deny(RiskLevel::Critical, "fork bomb");
        }

        let mut risk = RiskLevel::Low;
        for segment in segments(&normalized) {
            if is_root_removal(segment) {
                return PolicyDecision::deny(
                    RiskLevel::Critical,
                    format!("recursive removal of the root filesystem: '{}'", segment),
                );
            }

            if segment.starts_with("dd ") && segment.contains("of=/dev/") {
                return PolicyDecision::deny(
                    RiskLevel::Critical,
                    format!("raw device write: '{}'", segment),
                );
            }

            if segment.contains("> /dev/sd") || segment.contains(">/dev/sd") {
                return PolicyDecision::deny(
                    RiskLevel::Critical,
                    format!("raw device write: '{}'", segment),
                );
            }

            if let Some(pattern) = CRITICAL_PREFIXES.iter().find(|p| starts_with_word(segment, p))
            {
                return PolicyDecision::deny(
                    RiskLevel::Critical,
                    format!("blocked command pattern '{}'", pattern),
                );
            }

            if let Some(pattern) = self
                .blocked_prefixes
                .iter()
                .find(|p| starts_with_word(segment, p))
            {
                return PolicyDecision::deny(
                    RiskLevel::High,
                    format!("blocked command pattern '{}'", pattern),
                );
            }

            if HIGH_RISK_PREFIXES.iter().any(|p| starts_with_word(segment, p)) {
                risk = risk.max(RiskLevel::High);
            } else if MEDIUM_RISK_PREFIXES
                .iter()
                .any(|p| starts_with_word(segment, p))
            {
                risk = risk.max(RiskLevel::Medium);
            }
        }

        // Remote script piped into a shell
        if (normalized.contains("curl ") || normalized.contains("wget "))
            && (normalized.contains("| sh") || normalized.contains("| bash"))
        {
            risk = RiskLevel::High;
        }

        PolicyDecision::allow(risk)
    }
}

#[async_trait]
impl PolicyEngine for RuleBasedPolicy {
    async fn check(&self, command: &str, _context: &PolicyContext) -> PolicyDecision {
        self.evaluate(command)
    }
}

fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn segments(command: &str) -> impl Iterator<Item = &str> {
    command
        .split([';', '&', '|', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Prefix match on word boundaries, so `sudoku` does not match `sudo`
fn starts_with_word(segment: &str, pattern: &str) -> bool {
    if !segment.starts_with(pattern) {
        return false;
    }
    if pattern.ends_with(' ') || pattern.ends_with('/') {
        return true;
    }
    match segment[pattern.len()..].chars().next() {
        None => true,
        Some(c) => c == ' ' || c == '.',
    }
}

fn is_root_removal(segment: &str) -> bool {
    let mut words = segment.split(' ');
    if words.next() != Some("rm") {
        return false;
    }
    let mut recursive = false;
    let mut targets_root = false;
    for word in words {
        if word.starts_with('-') && !word.starts_with("--") {
            recursive |= word.contains('r');
        } else if word == "--recursive" {
            recursive = true;
        } else if word == "--no-preserve-root" {
            continue;
        } else if matches!(word, "/" | "/*" | "~" | "~/" | "/.") {
            targets_root = true;
        }
    }
    recursive && targets_root
}
