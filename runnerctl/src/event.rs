use std::collections::BTreeSet;

use axum::body::Bytes;
use serde::Deserialize;

/// The payload was not a `workflow_job` event we can act on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid message format: {0}")]
pub struct MalformedRequest(pub String);

/// A delivery as it arrived, before anything about it is trusted.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Exact request body; the signature is computed over these bytes.
    pub raw_body: Bytes,
    /// Value of `X-Hub-Signature-256`.
    pub signature: Option<String>,
    /// Value of `X-GitHub-Event`. Treated as `workflow_job` when absent.
    pub event_name: Option<String>,
    /// Value of `X-GitHub-Delivery`, for log correlation only.
    pub delivery_id: Option<String>,
}

impl Delivery {
    pub fn new(raw_body: impl Into<Bytes>) -> Self {
        Self {
            raw_body: raw_body.into(),
            signature: None,
            event_name: None,
            delivery_id: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_event_name(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = Some(event_name.into());
        self
    }

    pub fn decode(&self) -> Result<WebhookEvent, MalformedRequest> {
        WebhookEvent::from_slice(&self.raw_body)
    }
}

/// `workflow_job.action`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Queued,
    InProgress,
    Completed,
    Other(String),
}

impl From<&str> for Action {
    fn from(action: &str) -> Self {
        match action {
            "queued" => Self::Queued,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Other(other) => write!(f, "{other}"),
        }
    }
}

/// The parts of `workflow_job` the controller looks at.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct JobDescriptor {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub run_id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Only set once a runner has picked the job up.
    #[serde(default)]
    pub runner_name: Option<String>,
}

impl JobDescriptor {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub action: Action,
    pub job: JobDescriptor,
}

#[derive(Deserialize)]
struct RawEvent {
    action: Option<String>,
    workflow_job: Option<JobDescriptor>,
}

impl WebhookEvent {
    pub fn from_slice(body: &[u8]) -> Result<Self, MalformedRequest> {
        let raw: RawEvent = serde_json::from_slice(body)
            .map_err(|e| MalformedRequest(format!("body is not a JSON object: {e}")))?;
        let action = raw
            .action
            .as_deref()
            .map(Action::from)
            .ok_or_else(|| MalformedRequest("missing action".into()))?;
        let job = match (raw.workflow_job, &action) {
            (Some(job), _) => job,
            (None, Action::Queued | Action::Completed) => {
                return Err(MalformedRequest("missing workflow_job".into()));
            }
            (None, _) => JobDescriptor::default(),
        };
        Ok(Self { action, job })
    }
}
