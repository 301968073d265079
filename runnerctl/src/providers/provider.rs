use std::time::Duration;

use serde_json::Value;

use crate::instance::{InstanceSpec, ResourceId, ResourceKind};
use crate::providers::azure::AzureProvider;
use crate::providers::fake::FakeProvider;
use crate::providers::gcp::GcpProvider;

/// One resource to create, with the provider-native request body.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub id: ResourceId,
    pub body: Value,
}

/// How a provider operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded,
    /// The resource does not exist. For deletes this is as good as success.
    NotFound,
    /// The provider's error payload, verbatim.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OperationState {
    Finished(TerminalStatus),
    Pending {
        poll_url: String,
        retry_after: Option<Duration>,
    },
}

/// Handle on a submitted create or delete. Pass it to [`Provider::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub resource: ResourceId,
    pub(crate) state: OperationState,
}

impl Operation {
    pub fn finished(resource: ResourceId, status: TerminalStatus) -> Self {
        Self {
            resource,
            state: OperationState::Finished(status),
        }
    }

    pub(crate) fn pending(
        resource: ResourceId,
        poll_url: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            resource,
            state: OperationState::Pending {
                poll_url: poll_url.into(),
                retry_after,
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, OperationState::Finished(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider refused the request outright.
    /// Bad permissions, quota exceeded, invalid body, name already taken, etc.
    #[error("{resource}: provider returned {status}: {message}")]
    Rejected {
        resource: String,
        status: u16,
        message: String,
    },

    /// The request was accepted but the operation ended in a failed state.
    #[error("{resource}: operation failed: {message}")]
    OperationFailed { resource: String, message: String },

    /// The operation did not reach a terminal state in time. It may still
    /// finish on the provider's side.
    #[error("{resource}: timeout after {after:?} waiting for operation")]
    Timeout { resource: String, after: Duration },

    /// Required config field missing for this provider.
    #[error("missing required config: {field}")]
    MissingConfig { field: &'static str },

    #[error("could not obtain access token: {0}")]
    Token(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Cloud resource API that runners are built on: Compute Engine, Azure, or
/// the in-memory fake.
///
/// Adapters only expose create-or-update, delete and wait. Ordering, naming
/// and failure policy live in the controller.
pub enum Provider {
    Gcp(GcpProvider),
    Azure(AzureProvider),
    Fake(FakeProvider),
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gcp(_) => "gcp",
            Self::Azure(_) => "azure",
            Self::Fake(_) => "fake",
        }
    }

    /// Dependent resource kinds this provider creates next to every instance.
    pub fn dependents(&self) -> &'static [ResourceKind] {
        match self {
            Self::Gcp(_) => GcpProvider::DEPENDENTS,
            Self::Azure(_) => AzureProvider::DEPENDENTS,
            Self::Fake(p) => p.dependents(),
        }
    }

    /// Ordered creation plan for one instance; the instance itself is last.
    pub fn plan(&self, spec: &InstanceSpec) -> Vec<ResourceDescriptor> {
        match self {
            Self::Gcp(p) => p.plan(spec),
            Self::Azure(p) => p.plan(spec),
            Self::Fake(p) => p.plan(spec),
        }
    }

    /// Submit a create-or-update request.
    pub async fn create_or_update(
        &self,
        resource: &ResourceDescriptor,
    ) -> Result<Operation, ProviderError> {
        match self {
            Self::Gcp(p) => p.create_or_update(resource).await,
            Self::Azure(p) => p.create_or_update(resource).await,
            Self::Fake(p) => p.create_or_update(resource).await,
        }
    }

    /// Submit a delete request.
    pub async fn delete_by_id(&self, id: &ResourceId) -> Result<Operation, ProviderError> {
        match self {
            Self::Gcp(p) => p.delete_by_id(id).await,
            Self::Azure(p) => p.delete_by_id(id).await,
            Self::Fake(p) => p.delete_by_id(id).await,
        }
    }

    /// Poll until `operation` is terminal. Has no deadline of its own.
    pub async fn wait(&self, operation: Operation) -> Result<TerminalStatus, ProviderError> {
        let (poll_url, retry_after) = match operation.state {
            OperationState::Finished(status) => return Ok(status),
            OperationState::Pending {
                poll_url,
                retry_after,
            } => (poll_url, retry_after),
        };
        match self {
            Self::Gcp(p) => p.wait(&operation.resource, &poll_url).await,
            Self::Azure(p) => p.wait(&operation.resource, &poll_url, retry_after).await,
            Self::Fake(p) => p.wait(&operation.resource, &poll_url).await,
        }
    }
}
