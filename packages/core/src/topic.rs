// ABOUTME: Pub/sub topic names derived from domain identifiers
// ABOUTME: Topics address channel publishes and client room membership

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_TOPIC_ID_LEN: usize = 128;

fn is_valid_topic_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_TOPIC_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// The domain a topic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Output and lifecycle of one job execution
    Execution,
    /// Progress of a workflow run
    Workflow,
    /// Approval requests scoped to a workspace
    Approvals,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Execution => "execution",
            TopicKind::Workflow => "workflow",
            TopicKind::Approvals => "approvals",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "execution" => Some(TopicKind::Execution),
            "workflow" => Some(TopicKind::Workflow),
            "approvals" => Some(TopicKind::Approvals),
            _ => None,
        }
    }
}

/// A validated `<kind>:<id>` topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn execution(job_id: &str) -> Self {
        Self(format!("{}:{}", TopicKind::Execution.as_str(), job_id))
    }

    pub fn workflow_run(run_id: &str) -> Self {
        Self(format!("{}:{}", TopicKind::Workflow.as_str(), run_id))
    }

    pub fn approvals(workspace_id: &str) -> Self {
        Self(format!("{}:{}", TopicKind::Approvals.as_str(), workspace_id))
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| ValidationError::InvalidTopic(raw.to_string()))?;

        if TopicKind::from_str(kind).is_none() || !is_valid_topic_id(id) {
            return Err(ValidationError::InvalidTopic(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn kind(&self) -> TopicKind {
        self.0
            .split_once(':')
            .and_then(|(kind, _)| TopicKind::from_str(kind))
            .unwrap_or(TopicKind::Execution)
    }

    /// The identifier after the kind prefix
    pub fn id(&self) -> &str {
        self.0.split_once(':').map(|(_, id)| id).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Topic::parse(&value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_constructors() {
        let topic = Topic::execution("123");
        assert_eq!(topic.as_str(), "execution:123");
        assert_eq!(topic.kind(), TopicKind::Execution);
        assert_eq!(topic.id(), "123");

        assert_eq!(Topic::workflow_run("run-7").kind(), TopicKind::Workflow);
        assert_eq!(Topic::approvals("ws_1").to_string(), "approvals:ws_1");
    }

    #[rstest]
    #[case("execution:job_abc")]
    #[case("workflow:run.1")]
    #[case("approvals:ws-9")]
    fn test_parse_accepts(#[case] raw: &str) {
        assert_eq!(Topic::parse(raw).unwrap().as_str(), raw);
    }

    #[rstest]
    #[case("execution")]
    #[case("execution:")]
    #[case("unknown:1")]
    #[case("execution:a b")]
    #[case("execution:a:b")]
    fn test_parse_rejects(#[case] raw: &str) {
        assert!(Topic::parse(raw).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let topic: Topic = serde_json::from_str("\"execution:42\"").unwrap();
        assert_eq!(topic, Topic::execution("42"));
        assert!(serde_json::from_str::<Topic>("\"bogus\"").is_err());
    }
}
