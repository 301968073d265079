use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::instance::{InstanceSpec, ResourceId, ResourceKind};
use crate::providers::provider::{Operation, ProviderError, ResourceDescriptor, TerminalStatus};

/// Creation order for the dependents the fake models as separate calls.
/// The OS disk comes into existence with the instance, as on Azure.
const CREATE_ORDER: [ResourceKind; 4] = [
    ResourceKind::PublicIp,
    ResourceKind::SecurityGroup,
    ResourceKind::VirtualNetwork,
    ResourceKind::NetworkInterface,
];

/// What happens on a `create_or_update()` call.
#[derive(Debug, Clone)]
pub enum CreateBehavior {
    /// The resource exists afterwards.
    Succeed,
    /// Succeeds after sleeping for the given duration.
    SucceedAfterDelay(Duration),
    /// Accepted, but the operation ends in a failed state.
    Fail(String),
    /// Refused at submission.
    Reject(String),
}

/// What happens on a `delete_by_id()` call.
#[derive(Debug, Clone)]
pub enum DeleteBehavior {
    /// Succeeded if the resource exists, NotFound otherwise.
    Auto,
    Succeed,
    NotFound,
    /// The operation ends in a failed state.
    Fail(String),
    /// Refused at submission, like a 403 from a locked resource.
    Reject(String),
}

/// Logged record of a `create_or_update()` call.
#[derive(Debug, Clone)]
pub struct CreateCall {
    pub descriptor: ResourceDescriptor,
    pub succeeded: bool,
}

/// Logged record of a `delete_by_id()` call.
#[derive(Debug, Clone)]
pub struct DeleteCall {
    pub resource: ResourceId,
    pub status: TerminalStatus,
}

/// Interior state behind the Arc<Mutex<_>>.
#[derive(Debug)]
pub(crate) struct FakeProviderState {
    create_behaviors: VecDeque<CreateBehavior>,
    delete_behaviors: VecDeque<DeleteBehavior>,
    create_by_kind: HashMap<ResourceKind, CreateBehavior>,
    delete_by_kind: HashMap<ResourceKind, DeleteBehavior>,
    default_create: CreateBehavior,
    default_delete: DeleteBehavior,
    existing: BTreeSet<String>,
    pub create_calls: Vec<CreateCall>,
    pub delete_calls: Vec<DeleteCall>,
}

/// A deterministic, in-memory provider for testing failure modes.
///
/// A call takes the next queued behavior first, then the per-kind behavior,
/// then the configured default. The fake keeps track of which resource
/// names exist so that repeated deletes see NotFound.
#[derive(Debug, Clone)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeProviderState>>,
    dependents: &'static [ResourceKind],
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeProviderState {
                create_behaviors: VecDeque::new(),
                delete_behaviors: VecDeque::new(),
                create_by_kind: HashMap::new(),
                delete_by_kind: HashMap::new(),
                default_create: CreateBehavior::Succeed,
                default_delete: DeleteBehavior::Auto,
                existing: BTreeSet::new(),
                create_calls: Vec::new(),
                delete_calls: Vec::new(),
            })),
            dependents: &ResourceKind::DEPENDENTS,
        }
    }

    // ── Builder methods ──────────────────────────────────────────────

    pub fn with_dependents(mut self, dependents: &'static [ResourceKind]) -> Self {
        self.dependents = dependents;
        self
    }

    pub fn with_existing<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .unwrap()
            .existing
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn on_next_create(self, behavior: CreateBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .create_behaviors
            .push_back(behavior);
        self
    }

    pub fn on_next_delete(self, behavior: DeleteBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .delete_behaviors
            .push_back(behavior);
        self
    }

    pub fn on_create(self, kind: ResourceKind, behavior: CreateBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .create_by_kind
            .insert(kind, behavior);
        self
    }

    pub fn on_delete(self, kind: ResourceKind, behavior: DeleteBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .delete_by_kind
            .insert(kind, behavior);
        self
    }

    pub fn with_default_create(self, behavior: CreateBehavior) -> Self {
        self.state.lock().unwrap().default_create = behavior;
        self
    }

    pub fn with_default_delete(self, behavior: DeleteBehavior) -> Self {
        self.state.lock().unwrap().default_delete = behavior;
        self
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.state.lock().unwrap().create_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    /// Names of resources that currently exist.
    pub fn existing(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().existing.clone()
    }

    // ── Provider implementation ──────────────────────────────────────

    pub fn dependents(&self) -> &'static [ResourceKind] {
        self.dependents
    }

    pub fn plan(&self, spec: &InstanceSpec) -> Vec<ResourceDescriptor> {
        CREATE_ORDER
            .iter()
            .filter(|kind| self.dependents.contains(*kind))
            .chain(std::iter::once(&ResourceKind::Instance))
            .map(|kind| ResourceDescriptor {
                id: ResourceId::derive(&spec.name, *kind),
                body: serde_json::json!({ "name": spec.name, "kind": kind.to_string() }),
            })
            .collect()
    }

    pub async fn create_or_update(
        &self,
        resource: &ResourceDescriptor,
    ) -> Result<Operation, ProviderError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            let by_kind = state.create_by_kind.get(&resource.id.kind).cloned();
            state
                .create_behaviors
                .pop_front()
                .or(by_kind)
                .unwrap_or_else(|| state.default_create.clone())
        };

        let result = match behavior {
            CreateBehavior::Succeed => Ok(TerminalStatus::Succeeded),
            CreateBehavior::SucceedAfterDelay(d) => {
                tokio::time::sleep(d).await;
                Ok(TerminalStatus::Succeeded)
            }
            CreateBehavior::Fail(msg) => Ok(TerminalStatus::Failed(msg)),
            CreateBehavior::Reject(msg) => Err(ProviderError::Rejected {
                resource: resource.id.to_string(),
                status: 400,
                message: msg,
            }),
        };

        let succeeded = matches!(result, Ok(TerminalStatus::Succeeded));
        let mut state = self.state.lock().unwrap();
        if succeeded {
            state.existing.insert(resource.id.name.clone());
            if resource.id.kind == ResourceKind::Instance
                && self.dependents.contains(&ResourceKind::OsDisk)
            {
                let disk = ResourceId::derive(&resource.id.name, ResourceKind::OsDisk);
                state.existing.insert(disk.name);
            }
        }
        state.create_calls.push(CreateCall {
            descriptor: resource.clone(),
            succeeded,
        });

        result.map(|status| Operation::finished(resource.id.clone(), status))
    }

    pub async fn delete_by_id(&self, id: &ResourceId) -> Result<Operation, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let by_kind = state.delete_by_kind.get(&id.kind).cloned();
        let behavior = state
            .delete_behaviors
            .pop_front()
            .or(by_kind)
            .unwrap_or_else(|| state.default_delete.clone());

        let status = match behavior {
            DeleteBehavior::Auto if state.existing.contains(&id.name) => {
                TerminalStatus::Succeeded
            }
            DeleteBehavior::Auto | DeleteBehavior::NotFound => TerminalStatus::NotFound,
            DeleteBehavior::Succeed => TerminalStatus::Succeeded,
            DeleteBehavior::Fail(msg) => TerminalStatus::Failed(msg),
            DeleteBehavior::Reject(msg) => {
                state.delete_calls.push(DeleteCall {
                    resource: id.clone(),
                    status: TerminalStatus::Failed(msg.clone()),
                });
                return Err(ProviderError::Rejected {
                    resource: id.to_string(),
                    status: 403,
                    message: msg,
                });
            }
        };
        if !matches!(status, TerminalStatus::Failed(_)) {
            state.existing.remove(&id.name);
        }
        state.delete_calls.push(DeleteCall {
            resource: id.clone(),
            status: status.clone(),
        });

        Ok(Operation::finished(id.clone(), status))
    }

    /// The fake finishes every operation at submission, so there is never
    /// anything to poll.
    pub async fn wait(
        &self,
        resource: &ResourceId,
        _poll_url: &str,
    ) -> Result<TerminalStatus, ProviderError> {
        Err(ProviderError::Internal(anyhow::anyhow!(
            "fake provider has no pending operation for {resource}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> InstanceSpec {
        InstanceSpec::with_uid("ab12cd", "builder", b"#!/bin/sh\n", "ssh-ed25519 AAAA")
    }

    async fn create(
        provider: &FakeProvider,
        d: &ResourceDescriptor,
    ) -> Result<TerminalStatus, ProviderError> {
        let op = provider.create_or_update(d).await?;
        assert!(op.is_finished());
        crate::providers::provider::Provider::Fake(provider.clone())
            .wait(op)
            .await
    }

    #[test]
    fn plan_creates_instance_last() {
        let provider = FakeProvider::new();
        let names: Vec<_> = provider
            .plan(&spec())
            .into_iter()
            .map(|d| d.id.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "builder-ab12cd-ip",
                "builder-ab12cd-nsg",
                "builder-ab12cd-vnet",
                "builder-ab12cd-nic",
                "builder-ab12cd",
            ]
        );
    }

    #[test]
    fn instance_only_plan() {
        let provider = FakeProvider::new().with_dependents(&[]);
        let plan = provider.plan(&spec());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].id.kind, ResourceKind::Instance);
    }

    #[tokio::test]
    async fn default_create_succeeds_and_tracks_existence() {
        let provider = FakeProvider::new();
        let instance = provider.plan(&spec()).pop().unwrap();
        assert_eq!(
            create(&provider, &instance).await.unwrap(),
            TerminalStatus::Succeeded
        );
        let existing = provider.existing();
        assert!(existing.contains("builder-ab12cd"));
        assert!(existing.contains("builder-ab12cd-osdisk"));
    }

    #[tokio::test]
    async fn queued_behaviors_are_consumed_in_order() {
        let provider = FakeProvider::new()
            .on_next_create(CreateBehavior::Fail("quota exceeded".into()))
            .on_next_create(CreateBehavior::Succeed);
        let d = provider.plan(&spec()).remove(0);

        let first = create(&provider, &d).await.unwrap();
        assert_eq!(first, TerminalStatus::Failed("quota exceeded".into()));

        let second = create(&provider, &d).await.unwrap();
        assert_eq!(second, TerminalStatus::Succeeded);
    }

    #[tokio::test]
    async fn per_kind_behavior_applies_before_default() {
        let provider = FakeProvider::new()
            .with_default_create(CreateBehavior::Reject("nope".into()))
            .on_create(ResourceKind::Instance, CreateBehavior::Succeed);
        let plan = provider.plan(&spec());

        assert!(matches!(
            provider.create_or_update(&plan[0]).await,
            Err(ProviderError::Rejected { .. })
        ));
        assert!(provider.create_or_update(&plan[4]).await.is_ok());

        let calls = provider.create_calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].succeeded);
        assert!(calls[1].succeeded);
    }

    #[tokio::test]
    async fn auto_delete_is_not_found_the_second_time() {
        let provider = FakeProvider::new().with_existing(["builder-ab12cd-nic"]);
        let id = ResourceId::derive("builder-ab12cd", ResourceKind::NetworkInterface);

        let first = provider.delete_by_id(&id).await.unwrap();
        assert_eq!(
            first.state,
            crate::providers::provider::OperationState::Finished(TerminalStatus::Succeeded)
        );
        let second = provider.delete_by_id(&id).await.unwrap();
        assert_eq!(
            second.state,
            crate::providers::provider::OperationState::Finished(TerminalStatus::NotFound)
        );
        assert_eq!(provider.delete_calls().len(), 2);
    }

    #[tokio::test]
    async fn failed_delete_keeps_resource() {
        let provider = FakeProvider::new()
            .with_existing(["builder-ab12cd-vnet"])
            .on_delete(
                ResourceKind::VirtualNetwork,
                DeleteBehavior::Fail("InUseSubnetCannotBeDeleted".into()),
            );
        let id = ResourceId::derive("builder-ab12cd", ResourceKind::VirtualNetwork);

        provider.delete_by_id(&id).await.unwrap();
        assert!(provider.existing().contains("builder-ab12cd-vnet"));
    }

    #[tokio::test]
    async fn rejected_delete_keeps_the_resource() {
        let provider = FakeProvider::new()
            .with_existing(["builder-ab12cd-ip"])
            .on_next_delete(DeleteBehavior::Reject("ScopeLocked".into()));
        let id = ResourceId::derive("builder-ab12cd", ResourceKind::PublicIp);

        let err = provider.delete_by_id(&id).await.unwrap_err();

        assert!(matches!(err, ProviderError::Rejected { status: 403, .. }));
        assert!(provider.existing().contains("builder-ab12cd-ip"));
        assert_eq!(
            provider.delete_calls()[0].status,
            TerminalStatus::Failed("ScopeLocked".into())
        );
    }
}
