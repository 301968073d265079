use std::time::Duration;

use anyhow::anyhow;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::instance::{InstanceSpec, ResourceId, ResourceKind};
use crate::providers::provider::{Operation, ProviderError, ResourceDescriptor, TerminalStatus};
use crate::providers::token::TokenSource;

pub const COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";

const SERVICE_ACCOUNT_SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/compute",
    "https://www.googleapis.com/auth/servicecontrol",
    "https://www.googleapis.com/auth/cloud-platform",
];

#[derive(Debug, Clone)]
pub struct GcpSettings {
    pub project: String,
    pub zone: String,
    /// Either a bare type (`n2-highmem-4`) or `zones/{zone}/machineTypes/{type}`.
    pub machine_type: String,
    pub source_image: String,
    pub network: String,
    pub disk_size_gb: u32,
    pub service_account: Option<String>,
    pub admin_username: String,
    pub poll_interval: Duration,
}

impl GcpSettings {
    fn machine_type_path(&self) -> String {
        let m = &self.machine_type;
        if m.starts_with("zones/") && m.contains("/machineTypes/") {
            self.machine_type.clone()
        } else {
            format!("zones/{}/machineTypes/{}", self.zone, self.machine_type)
        }
    }
}

#[derive(Debug, Deserialize)]
struct GceOperation {
    name: String,
    status: String,
    /// `insert`, `delete`, ...
    #[serde(default, rename = "operationType")]
    operation_type: String,
    #[serde(default)]
    error: Option<GceErrors>,
    #[serde(default)]
    warnings: Vec<GceMessage>,
}

#[derive(Debug, Deserialize)]
struct GceErrors {
    #[serde(default)]
    errors: Vec<GceMessage>,
}

#[derive(Debug, Deserialize)]
struct GceMessage {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl GceOperation {
    /// `None` until the operation is `DONE`.
    ///
    /// `RESOURCE_NOT_FOUND` only means "already gone" on a delete. On an
    /// insert it names a missing image, network or service account.
    fn terminal(&self) -> Option<TerminalStatus> {
        if self.status != "DONE" {
            return None;
        }
        let errors = self
            .error
            .as_ref()
            .map(|e| e.errors.as_slice())
            .unwrap_or_default();
        if errors.is_empty() {
            Some(TerminalStatus::Succeeded)
        } else if self.operation_type == "delete"
            && errors.iter().all(|e| e.code == "RESOURCE_NOT_FOUND")
        {
            Some(TerminalStatus::NotFound)
        } else {
            Some(TerminalStatus::Failed(
                errors
                    .iter()
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            ))
        }
    }
}

/// Compute Engine adapter. A runner is a single instance: the boot disk is
/// created inline with `autoDelete` and it joins an existing network, so
/// there are no dependents to track.
pub struct GcpProvider {
    http: reqwest::Client,
    endpoint: String,
    settings: GcpSettings,
    token: TokenSource,
}

impl GcpProvider {
    pub const DEPENDENTS: &'static [ResourceKind] = &[];

    pub fn new(settings: GcpSettings, token: TokenSource) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: COMPUTE_ENDPOINT.into(),
            settings,
            token,
        }
    }

    /// Point the adapter at another Compute API root, e.g. a regional
    /// endpoint or a local stand-in.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn zone_url(&self) -> String {
        format!(
            "{}/projects/{}/zones/{}",
            self.endpoint, self.settings.project, self.settings.zone
        )
    }

    fn instance_body(&self, spec: &InstanceSpec) -> Value {
        let s = &self.settings;
        let mut body = json!({
            "name": spec.name,
            "machineType": s.machine_type_path(),
            "labels": { "managed-by": "runnerctl" },
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "type": "PERSISTENT",
                "initializeParams": {
                    "sourceImage": s.source_image,
                    "diskSizeGb": s.disk_size_gb.to_string(),
                },
            }],
            "networkInterfaces": [{
                "network": s.network,
                "accessConfigs": [{ "name": "External NAT", "type": "ONE_TO_ONE_NAT" }],
            }],
            "advancedMachineFeatures": { "enableNestedVirtualization": true },
            "metadata": {
                "items": [
                    { "key": "user-data", "value": spec.user_data },
                    { "key": "user-data-encoding", "value": "base64" },
                    {
                        "key": "ssh-keys",
                        "value": format!("{}:{}", s.admin_username, spec.ssh_public_key),
                    },
                ],
            },
        });
        if let Some(email) = &s.service_account {
            body["serviceAccounts"] =
                json!([{ "email": email, "scopes": SERVICE_ACCOUNT_SCOPES }]);
        }
        body
    }

    pub fn plan(&self, spec: &InstanceSpec) -> Vec<ResourceDescriptor> {
        vec![ResourceDescriptor {
            id: ResourceId::derive(&spec.name, ResourceKind::Instance),
            body: self.instance_body(spec),
        }]
    }

    fn operation(&self, resource: &ResourceId, op: GceOperation) -> Operation {
        match op.terminal() {
            Some(status) => Operation::finished(resource.clone(), status),
            None => Operation::pending(
                resource.clone(),
                format!("{}/operations/{}/wait", self.zone_url(), op.name),
                None,
            ),
        }
    }

    async fn read_operation(
        resource: &ResourceId,
        response: reqwest::Response,
    ) -> Result<GceOperation, ProviderError> {
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(ProviderError::Rejected {
                resource: resource.to_string(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let op: GceOperation = serde_json::from_slice(&body)
            .map_err(|e| anyhow!("{resource}: unreadable operation: {e}"))?;
        for w in &op.warnings {
            warn!(
                resource = %resource,
                code = %w.code,
                message = %w.message,
                "compute engine warning"
            );
        }
        Ok(op)
    }

    pub async fn create_or_update(
        &self,
        resource: &ResourceDescriptor,
    ) -> Result<Operation, ProviderError> {
        if resource.id.kind != ResourceKind::Instance {
            return Err(ProviderError::Internal(anyhow!(
                "compute engine runners have no separate {}",
                resource.id.kind
            )));
        }
        let token = self.token.bearer().await?;
        let url = format!("{}/instances", self.zone_url());
        debug!(resource = %resource.id, "POST {url}");
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&resource.body)
            .send()
            .await?;
        let op = Self::read_operation(&resource.id, response).await?;
        Ok(self.operation(&resource.id, op))
    }

    pub async fn delete_by_id(&self, id: &ResourceId) -> Result<Operation, ProviderError> {
        if id.kind != ResourceKind::Instance {
            return Ok(Operation::finished(id.clone(), TerminalStatus::NotFound));
        }
        let token = self.token.bearer().await?;
        let url = format!("{}/instances/{}", self.zone_url(), id.name);
        debug!(resource = %id, "DELETE {url}");
        let response = self.http.delete(&url).bearer_auth(token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Operation::finished(id.clone(), TerminalStatus::NotFound));
        }
        let op = Self::read_operation(id, response).await?;
        Ok(self.operation(id, op))
    }

    /// `operations.wait` blocks server-side for up to two minutes per call,
    /// so the loop only sleeps between calls that came back early.
    pub async fn wait(
        &self,
        resource: &ResourceId,
        poll_url: &str,
    ) -> Result<TerminalStatus, ProviderError> {
        loop {
            let token = self.token.bearer().await?;
            let response = self.http.post(poll_url).bearer_auth(token).send().await?;
            let op = Self::read_operation(resource, response).await?;
            if let Some(status) = op.terminal() {
                return Ok(status);
            }
            debug!(resource = %resource, status = %op.status, "operation still running");
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::providers::provider::Provider;

    fn settings() -> GcpSettings {
        GcpSettings {
            project: "proj".into(),
            zone: "us-central1-c".into(),
            machine_type: "n2-highmem-4".into(),
            source_image: "projects/ubuntu-os-cloud/global/images/family/ubuntu-2004-lts".into(),
            network: "global/networks/default".into(),
            disk_size_gb: 64,
            service_account: None,
            admin_username: "runner".into(),
            poll_interval: Duration::from_secs(5),
        }
    }

    fn spec() -> InstanceSpec {
        InstanceSpec::with_uid("ab12cd", "builder", b"#cloud-config\n", "ssh-ed25519 AAAA")
    }

    fn op(json: &str) -> GceOperation {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn machine_type_is_qualified_once() {
        let mut s = settings();
        assert_eq!(s.machine_type_path(), "zones/us-central1-c/machineTypes/n2-highmem-4");
        s.machine_type = "zones/europe-west3-c/machineTypes/f1-micro".into();
        assert_eq!(s.machine_type_path(), "zones/europe-west3-c/machineTypes/f1-micro");
    }

    #[test]
    fn plan_is_a_single_nested_virt_instance() {
        let provider = GcpProvider::new(settings(), TokenSource::Static("t".into()));
        let plan = provider.plan(&spec());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].id.name, "builder-ab12cd");

        let body = &plan[0].body;
        assert_eq!(body["advancedMachineFeatures"]["enableNestedVirtualization"], true);
        assert_eq!(body["disks"][0]["autoDelete"], true);
        assert_eq!(body["disks"][0]["initializeParams"]["diskSizeGb"], "64");
        let items = body["metadata"]["items"].as_array().unwrap();
        assert_eq!(items[0]["value"], "I2Nsb3VkLWNvbmZpZwo=");
        assert_eq!(items[1]["value"], "base64");
        assert_eq!(items[2]["value"], "runner:ssh-ed25519 AAAA");
        assert!(body.get("serviceAccounts").is_none());
    }

    #[test]
    fn service_account_gets_scopes() {
        let mut s = settings();
        s.service_account = Some("builder@proj.iam.gserviceaccount.com".into());
        let provider = GcpProvider::new(s, TokenSource::Static("t".into()));
        let body = &provider.plan(&spec())[0].body;
        assert_eq!(
            body["serviceAccounts"][0]["email"],
            "builder@proj.iam.gserviceaccount.com"
        );
        assert_eq!(body["serviceAccounts"][0]["scopes"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn operation_terminal_states() {
        assert_eq!(op(r#"{"name":"op-1","status":"RUNNING"}"#).terminal(), None);
        assert_eq!(
            op(r#"{"name":"op-1","status":"DONE"}"#).terminal(),
            Some(TerminalStatus::Succeeded)
        );
        assert_eq!(
            op(r#"{"name":"op-1","status":"DONE","operationType":"insert",
                   "error":{"errors":[{"code":"QUOTA_EXCEEDED","message":"CPUS"}]}}"#)
            .terminal(),
            Some(TerminalStatus::Failed("QUOTA_EXCEEDED: CPUS".into()))
        );
        assert_eq!(
            op(r#"{"name":"op-1","status":"DONE","operationType":"delete",
                   "error":{"errors":[{"code":"RESOURCE_NOT_FOUND","message":"gone"}]}}"#)
            .terminal(),
            Some(TerminalStatus::NotFound)
        );
    }

    #[test]
    fn insert_resource_not_found_keeps_the_message() {
        let status = op(r#"{"name":"op-1","status":"DONE","operationType":"insert",
            "error":{"errors":[{"code":"RESOURCE_NOT_FOUND",
            "message":"The resource 'projects/p/global/images/family/nope' was not found"}]}}"#)
        .terminal();
        assert_eq!(
            status,
            Some(TerminalStatus::Failed(
                "RESOURCE_NOT_FOUND: The resource 'projects/p/global/images/family/nope' \
                 was not found"
                    .into()
            ))
        );
    }

    #[test]
    fn pending_operation_polls_wait_endpoint() {
        let provider = GcpProvider::new(settings(), TokenSource::Static("t".into()));
        let id = ResourceId::derive("builder-ab12cd", ResourceKind::Instance);
        let operation = provider.operation(&id, op(r#"{"name":"op-42","status":"PENDING"}"#));
        assert!(!operation.is_finished());
        assert_eq!(
            operation.state,
            crate::providers::provider::OperationState::Pending {
                poll_url: format!(
                    "{COMPUTE_ENDPOINT}/projects/proj/zones/us-central1-c/operations/op-42/wait"
                ),
                retry_after: None,
            }
        );
    }

    #[tokio::test]
    async fn deleting_a_dependent_is_a_no_op() {
        let provider = GcpProvider::new(settings(), TokenSource::Static("t".into()));
        let id = ResourceId::derive("builder-ab12cd", ResourceKind::NetworkInterface);
        let operation = provider.delete_by_id(&id).await.unwrap();
        assert!(operation.is_finished());
    }

    // ── HTTP round trips against a local Compute API ────────────────

    const ZONE_PATH: &str = "/projects/proj/zones/us-central1-c";

    async fn mock_provider() -> (MockServer, Provider) {
        let server = MockServer::start().await;
        let mut s = settings();
        s.poll_interval = Duration::from_millis(10);
        let gcp = GcpProvider::new(s, TokenSource::Static("t0k3n".into()))
            .with_endpoint(server.uri());
        (server, Provider::Gcp(gcp))
    }

    fn insert_descriptor() -> ResourceDescriptor {
        GcpProvider::new(settings(), TokenSource::Static("t".into()))
            .plan(&spec())
            .remove(0)
    }

    fn operation_response(name: &str, status: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(
            serde_json::json!({ "name": name, "status": status, "operationType": "insert" }),
        )
    }

    fn instance_id() -> ResourceId {
        ResourceId::derive("builder-ab12cd", ResourceKind::Instance)
    }

    #[tokio::test]
    async fn delete_of_missing_instance_is_not_found() {
        let (server, provider) = mock_provider().await;
        Mock::given(method("DELETE"))
            .and(path(format!("{ZONE_PATH}/instances/builder-ab12cd")))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let operation = provider.delete_by_id(&instance_id()).await.unwrap();
        assert_eq!(provider.wait(operation).await.unwrap(), TerminalStatus::NotFound);
    }

    #[tokio::test]
    async fn insert_waits_until_operation_is_done() {
        let (server, provider) = mock_provider().await;
        Mock::given(method("POST"))
            .and(path(format!("{ZONE_PATH}/instances")))
            .and(header("authorization", "Bearer t0k3n"))
            .respond_with(operation_response("op-7", "PENDING"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{ZONE_PATH}/operations/op-7/wait")))
            .respond_with(operation_response("op-7", "RUNNING"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{ZONE_PATH}/operations/op-7/wait")))
            .respond_with(operation_response("op-7", "DONE"))
            .mount(&server)
            .await;

        let descriptor = insert_descriptor();
        let operation = provider.create_or_update(&descriptor).await.unwrap();
        assert!(!operation.is_finished());
        assert_eq!(provider.wait(operation).await.unwrap(), TerminalStatus::Succeeded);
    }

    #[tokio::test]
    async fn failed_insert_reports_compute_errors() {
        let (server, provider) = mock_provider().await;
        Mock::given(method("POST"))
            .and(path(format!("{ZONE_PATH}/instances")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "op-8",
                "status": "DONE",
                "operationType": "insert",
                "error": { "errors": [{
                    "code": "RESOURCE_NOT_FOUND",
                    "message": "The resource 'projects/proj/global/networks/ci' was not found",
                }]},
            })))
            .mount(&server)
            .await;

        let descriptor = insert_descriptor();
        let operation = provider.create_or_update(&descriptor).await.unwrap();
        assert_eq!(
            provider.wait(operation).await.unwrap(),
            TerminalStatus::Failed(
                "RESOURCE_NOT_FOUND: The resource 'projects/proj/global/networks/ci' \
                 was not found"
                    .into()
            )
        );
    }

    #[tokio::test]
    async fn rejected_insert_carries_response_body() {
        let (server, provider) = mock_provider().await;
        let body =
            r#"{"error":{"code":403,"message":"Required 'compute.instances.create' permission"}}"#;
        Mock::given(method("POST"))
            .and(path(format!("{ZONE_PATH}/instances")))
            .respond_with(ResponseTemplate::new(403).set_body_string(body))
            .mount(&server)
            .await;

        let descriptor = insert_descriptor();
        let err = provider.create_or_update(&descriptor).await.unwrap_err();
        assert!(
            matches!(&err, ProviderError::Rejected { status: 403, message, .. } if message == body),
            "{err}"
        );
    }
}
