use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapError, BootstrapSource};
use crate::event::{Action, Delivery, MalformedRequest, WebhookEvent};
use crate::instance::{InstancePhase, InstanceSpec, ResourceId, ResourceSet, generate_uid};
use crate::providers::provider::{Operation, Provider, ProviderError, TerminalStatus};
use crate::secrets::{SecretError, SecretStore};
use crate::signature::{self, Rejection};

/// Knobs the controller needs at request time.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Job label served by this runner pool.
    pub target_label: String,
    pub instance_prefix: String,
    pub webhook_secret_name: String,
    pub ssh_key_secret_name: String,
    /// Upper bound on one submit-and-wait against the provider.
    pub operation_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            target_label: "nested-virt".into(),
            instance_prefix: "builder".into(),
            webhook_secret_name: "WEBHOOK_TOKEN".into(),
            ssh_key_secret_name: "SSH_PUBLIC_KEY".into(),
            operation_timeout: Duration::from_secs(300),
        }
    }
}

/// Shared, immutable context for every webhook delivery.
pub struct ControllerContext {
    pub provider: Provider,
    pub secrets: SecretStore,
    pub bootstrap: BootstrapSource,
    pub settings: ControllerSettings,
}

/// What a successfully handled delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Provisioned { instance: String },
    Reclaimed { instance: String },
    Pong,
    /// Nothing to do. Not an error: GitHub should not redeliver it.
    Ignored(String),
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioned { instance } => write!(f, "created instance {instance}"),
            Self::Reclaimed { instance } => write!(f, "deleted instance {instance}"),
            Self::Pong => write!(f, "pong"),
            Self::Ignored(reason) => write!(f, "{reason}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionFailure {
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Provisioning stopped part way. Nothing is rolled back: `created` lists
/// what is left behind and needs deleting by hand.
#[derive(Debug, thiserror::Error)]
#[error(
    "failed to provision {instance}{}: {cause}{}",
    at_step(.failed_step),
    needs_cleanup(.created)
)]
pub struct ProvisionError {
    pub instance: String,
    pub failed_step: Option<ResourceId>,
    pub created: Vec<ResourceId>,
    #[source]
    pub cause: ProvisionFailure,
}

fn at_step(step: &Option<ResourceId>) -> String {
    step.as_ref().map(|s| format!(" at {s}")).unwrap_or_default()
}

fn needs_cleanup(created: &[ResourceId]) -> String {
    if created.is_empty() {
        return String::new();
    }
    let names: Vec<_> = created.iter().map(ToString::to_string).collect();
    format!("; needs cleanup: {}", names.join(", "))
}

/// Resources that could not be deleted. "Not found" never ends up here.
#[derive(Debug, thiserror::Error)]
#[error("failed to delete {instance}: {}", list_failures(.failures))]
pub struct ReclaimError {
    pub instance: String,
    pub failures: Vec<(ResourceId, ProviderError)>,
}

/// One `{resource}: {error}` entry per failure. Provider errors that
/// already lead with the resource are not prefixed twice.
fn list_failures(failures: &[(ResourceId, ProviderError)]) -> String {
    let entries: Vec<_> = failures
        .iter()
        .map(|(id, e)| {
            let (id, e) = (id.to_string(), e.to_string());
            if e.starts_with(&id) { e } else { format!("{id}: {e}") }
        })
        .collect();
    entries.join("; ")
}

/// Error type for a delivery that could not be handled.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("unauthorized: {0}")]
    Authentication(#[from] Rejection),
    #[error(transparent)]
    MalformedRequest(#[from] MalformedRequest),
    #[error(transparent)]
    Provisioning(#[from] ProvisionError),
    #[error(transparent)]
    Reclamation(#[from] ReclaimError),
}

/// Verify, classify and act on one webhook delivery.
pub async fn handle_delivery(
    ctx: &ControllerContext,
    delivery: &Delivery,
) -> Result<Outcome, HandleError> {
    signature::verify(
        &ctx.secrets,
        &ctx.settings.webhook_secret_name,
        &delivery.raw_body,
        delivery.signature.as_deref(),
    )
    .await?;

    match delivery.event_name.as_deref() {
        None | Some("workflow_job") => {}
        Some("ping") => return Ok(Outcome::Pong),
        Some(other) => return Ok(Outcome::Ignored(format!("ignoring {other} event"))),
    }

    let event = delivery.decode()?;
    handle_event(ctx, &event).await
}

/// Dispatch an authenticated `workflow_job` event.
pub async fn handle_event(
    ctx: &ControllerContext,
    event: &WebhookEvent,
) -> Result<Outcome, HandleError> {
    if !matches!(event.action, Action::Queued | Action::Completed) {
        debug!(action = %event.action, "nothing to do for action");
        return Ok(Outcome::Ignored(format!("ignoring action {}", event.action)));
    }

    let job = &event.job;
    if !job.has_label(&ctx.settings.target_label) {
        let labels: Vec<&str> = job.labels.iter().map(String::as_str).collect();
        info!(job_id = ?job.id, labels = ?labels, "job is not for this runner pool");
        return Ok(Outcome::Ignored(format!(
            "unexpected job labels: [{}]",
            labels.join(", ")
        )));
    }

    if event.action == Action::Queued {
        info!(job_id = ?job.id, run_id = ?job.run_id, job = ?job.name, "job queued");
        let instance = provision(ctx).await?;
        return Ok(Outcome::Provisioned { instance });
    }

    let owned_prefix = format!("{}-", ctx.settings.instance_prefix);
    match job.runner_name.as_deref() {
        Some(runner) if runner.starts_with(&owned_prefix) => {
            info!(job_id = ?job.id, runner, "job completed");
            reclaim(ctx, runner).await?;
            Ok(Outcome::Reclaimed {
                instance: runner.to_string(),
            })
        }
        Some(runner) if !runner.is_empty() => {
            info!(job_id = ?job.id, runner, "job completed on a runner we do not own");
            Ok(Outcome::Ignored(format!("runner {runner} is not managed here")))
        }
        _ => {
            info!(job_id = ?job.id, "job completed without a runner");
            Ok(Outcome::Ignored("job never reached a runner".into()))
        }
    }
}

/// Submit one operation and wait for it, all within `timeout`.
async fn run_operation<F>(
    provider: &Provider,
    resource: &ResourceId,
    submit: F,
    timeout: Duration,
) -> Result<TerminalStatus, ProviderError>
where
    F: Future<Output = Result<Operation, ProviderError>>,
{
    let operation = async {
        let operation = submit.await?;
        provider.wait(operation).await
    };
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| ProviderError::Timeout {
            resource: resource.to_string(),
            after: timeout,
        })?
}

/// Create a fresh instance and its dependents, instance last.
///
/// Returns the instance name, which the runner registers under and which
/// comes back as `runner_name` when its job completes.
pub async fn provision(ctx: &ControllerContext) -> Result<String, ProvisionError> {
    let settings = &ctx.settings;
    let uid = generate_uid();
    let instance = format!("{}-{uid}", settings.instance_prefix);
    info!(instance = %instance, phase = %InstancePhase::Provisioning, "provisioning runner");

    let failed = |failed_step: Option<ResourceId>,
                  created: Vec<ResourceId>,
                  cause: ProvisionFailure| {
        error!(instance = %instance, phase = %InstancePhase::Failed, "provisioning failed");
        ProvisionError {
            instance: instance.clone(),
            failed_step,
            created,
            cause,
        }
    };

    let ssh_public_key = match ctx.secrets.get_secret(&settings.ssh_key_secret_name).await {
        Ok(key) => key,
        Err(e) => return Err(failed(None, vec![], e.into())),
    };
    let bootstrap = match ctx.bootstrap.load().await {
        Ok(script) => script,
        Err(e) => return Err(failed(None, vec![], e.into())),
    };
    let spec = InstanceSpec::with_uid(uid, &settings.instance_prefix, &bootstrap, ssh_public_key);

    let mut created = Vec::new();
    for step in ctx.provider.plan(&spec) {
        let status = run_operation(
            &ctx.provider,
            &step.id,
            ctx.provider.create_or_update(&step),
            settings.operation_timeout,
        )
        .await;
        let error = match status {
            Ok(TerminalStatus::Succeeded) => {
                debug!(resource = %step.id, "created");
                created.push(step.id);
                continue;
            }
            Ok(TerminalStatus::Failed(message)) => ProviderError::OperationFailed {
                resource: step.id.to_string(),
                message,
            },
            Ok(TerminalStatus::NotFound) => ProviderError::OperationFailed {
                resource: step.id.to_string(),
                message: "resource disappeared while being created".into(),
            },
            Err(e) => e,
        };
        warn!(resource = %step.id, %error, created = created.len(), "create step failed");
        return Err(failed(Some(step.id), created, error.into()));
    }

    info!(instance = %spec.name, phase = %InstancePhase::Running, "runner is up");
    Ok(spec.name)
}

/// Delete with "not found" folded into success.
async fn delete(ctx: &ControllerContext, id: &ResourceId) -> Result<TerminalStatus, ProviderError> {
    let status = run_operation(
        &ctx.provider,
        id,
        ctx.provider.delete_by_id(id),
        ctx.settings.operation_timeout,
    )
    .await?;
    match status {
        TerminalStatus::Failed(message) => Err(ProviderError::OperationFailed {
            resource: id.to_string(),
            message,
        }),
        status => Ok(status),
    }
}

/// Delete `instance` and every dependent the provider creates alongside it.
///
/// Safe to repeat: anything already gone counts as deleted.
pub async fn reclaim(ctx: &ControllerContext, instance: &str) -> Result<(), ReclaimError> {
    let set = ResourceSet::new(instance, ctx.provider.dependents());
    info!(
        instance,
        phase = %InstancePhase::Reclaiming,
        members = set.members().len(),
        "reclaiming runner"
    );

    match delete(ctx, set.instance()).await {
        Ok(TerminalStatus::NotFound) => debug!(instance, "instance already gone"),
        Ok(_) => debug!(instance, "instance deleted"),
        Err(e) => {
            // Dependents are still attached to the instance; leave them.
            error!(
                instance,
                phase = %InstancePhase::Failed,
                error = %e,
                "instance deletion failed"
            );
            return Err(ReclaimError {
                instance: instance.to_string(),
                failures: vec![(set.instance().clone(), e)],
            });
        }
    }

    let mut failures = Vec::new();
    for wave in set.reclaim_waves() {
        let deletes = wave
            .into_iter()
            .map(|id| async move { (id, delete(ctx, id).await) });
        let results = join_all(deletes).await;
        for (id, result) in results {
            match result {
                Ok(TerminalStatus::NotFound) => debug!(resource = %id, "already gone"),
                Ok(_) => debug!(resource = %id, "deleted"),
                Err(e) => {
                    warn!(resource = %id, error = %e, "delete failed");
                    failures.push((id.clone(), e));
                }
            }
        }
    }

    if failures.is_empty() {
        info!(instance, phase = %InstancePhase::Absent, "runner reclaimed");
        Ok(())
    } else {
        error!(
            instance,
            phase = %InstancePhase::Failed,
            failed = failures.len(),
            "reclaim incomplete"
        );
        Err(ReclaimError {
            instance: instance.to_string(),
            failures,
        })
    }
}
