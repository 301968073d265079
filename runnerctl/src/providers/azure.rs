use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::instance::{InstanceSpec, ResourceId, ResourceKind};
use crate::providers::provider::{Operation, ProviderError, ResourceDescriptor, TerminalStatus};
use crate::providers::token::TokenSource;

pub const ARM_ENDPOINT: &str = "https://management.azure.com";

const NETWORK_API_VERSION: &str = "2023-09-01";
const COMPUTE_API_VERSION: &str = "2023-09-01";
const DISK_API_VERSION: &str = "2023-04-02";

const SUBNET: &str = "default";

/// Marketplace image, written `publisher:offer:sku:version` like the `az` CLI does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

#[derive(Debug, thiserror::Error)]
#[error("image reference {0:?} is not publisher:offer:sku:version")]
pub struct ImageReferenceError(String);

impl std::str::FromStr for ImageReference {
    type Err = ImageReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split(':').collect::<Vec<_>>()[..] {
            [publisher, offer, sku, version]
                if [publisher, offer, sku, version].iter().all(|p| !p.is_empty()) =>
            {
                Ok(Self {
                    publisher: publisher.into(),
                    offer: offer.into(),
                    sku: sku.into(),
                    version: version.into(),
                })
            }
            _ => Err(ImageReferenceError(s.into())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AzureSettings {
    pub subscription_id: String,
    pub resource_group: String,
    pub location: String,
    pub vm_size: String,
    pub image: ImageReference,
    pub disk_size_gb: u32,
    pub admin_username: String,
    /// Lower bound between polls, even if `Retry-After` asks for less.
    pub poll_interval: Duration,
}

/// Azure Resource Manager adapter. Every runner gets its own public IP,
/// security group, virtual network, NIC, VM and OS disk in one resource group.
pub struct AzureProvider {
    http: reqwest::Client,
    endpoint: String,
    settings: AzureSettings,
    token: TokenSource,
}

impl AzureProvider {
    pub const DEPENDENTS: &'static [ResourceKind] = &ResourceKind::DEPENDENTS;

    pub fn new(settings: AzureSettings, token: TokenSource) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: ARM_ENDPOINT.into(),
            settings,
            token,
        }
    }

    /// Point the adapter at another ARM root, e.g. a sovereign cloud.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn api(kind: ResourceKind) -> (&'static str, &'static str, &'static str) {
        match kind {
            ResourceKind::Instance => ("Microsoft.Compute", "virtualMachines", COMPUTE_API_VERSION),
            ResourceKind::OsDisk => ("Microsoft.Compute", "disks", DISK_API_VERSION),
            ResourceKind::NetworkInterface => {
                ("Microsoft.Network", "networkInterfaces", NETWORK_API_VERSION)
            }
            ResourceKind::SecurityGroup => {
                ("Microsoft.Network", "networkSecurityGroups", NETWORK_API_VERSION)
            }
            ResourceKind::VirtualNetwork => {
                ("Microsoft.Network", "virtualNetworks", NETWORK_API_VERSION)
            }
            ResourceKind::PublicIp => {
                ("Microsoft.Network", "publicIPAddresses", NETWORK_API_VERSION)
            }
        }
    }

    /// ARM resource id, also used to reference one resource from another.
    fn resource_path(&self, id: &ResourceId) -> String {
        let (namespace, collection, _) = Self::api(id.kind);
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{namespace}/{collection}/{}",
            self.settings.subscription_id, self.settings.resource_group, id.name
        )
    }

    fn url(&self, id: &ResourceId) -> String {
        let (_, _, version) = Self::api(id.kind);
        format!(
            "{}{}?api-version={version}",
            self.endpoint,
            self.resource_path(id)
        )
    }

    pub fn plan(&self, spec: &InstanceSpec) -> Vec<ResourceDescriptor> {
        let s = &self.settings;
        let id = |kind| ResourceId::derive(&spec.name, kind);
        let (ip, nsg, vnet, nic, vm) = (
            id(ResourceKind::PublicIp),
            id(ResourceKind::SecurityGroup),
            id(ResourceKind::VirtualNetwork),
            id(ResourceKind::NetworkInterface),
            id(ResourceKind::Instance),
        );
        let tags = json!({ "managed-by": "runnerctl", "runner": spec.name });

        let ip_body = json!({
            "location": s.location,
            "tags": tags,
            "sku": { "name": "Standard" },
            "properties": { "publicIPAllocationMethod": "Static" },
        });
        let nsg_body = json!({
            "location": s.location,
            "tags": tags,
            "properties": {
                "securityRules": [{
                    "name": "allow-ssh",
                    "properties": {
                        "priority": 1000,
                        "direction": "Inbound",
                        "access": "Allow",
                        "protocol": "Tcp",
                        "sourceAddressPrefix": "*",
                        "sourcePortRange": "*",
                        "destinationAddressPrefix": "*",
                        "destinationPortRange": "22",
                    },
                }],
            },
        });
        let vnet_body = json!({
            "location": s.location,
            "tags": tags,
            "properties": {
                "addressSpace": { "addressPrefixes": ["10.0.0.0/16"] },
                "subnets": [{ "name": SUBNET, "properties": { "addressPrefix": "10.0.0.0/24" } }],
            },
        });
        let subnet = format!("{}/subnets/{SUBNET}", self.resource_path(&vnet));
        let nic_body = json!({
            "location": s.location,
            "tags": tags,
            "properties": {
                "networkSecurityGroup": { "id": self.resource_path(&nsg) },
                "ipConfigurations": [{
                    "name": "ipconfig1",
                    "properties": {
                        "privateIPAllocationMethod": "Dynamic",
                        "subnet": { "id": subnet },
                        "publicIPAddress": { "id": self.resource_path(&ip) },
                    },
                }],
            },
        });
        let vm_body = json!({
            "location": s.location,
            "tags": tags,
            "properties": {
                "hardwareProfile": { "vmSize": s.vm_size },
                "storageProfile": {
                    "imageReference": {
                        "publisher": s.image.publisher,
                        "offer": s.image.offer,
                        "sku": s.image.sku,
                        "version": s.image.version,
                    },
                    "osDisk": {
                        "name": id(ResourceKind::OsDisk).name,
                        "createOption": "FromImage",
                        "diskSizeGB": s.disk_size_gb,
                        "managedDisk": { "storageAccountType": "Premium_LRS" },
                    },
                },
                "osProfile": {
                    "computerName": spec.name,
                    "adminUsername": s.admin_username,
                    "customData": spec.user_data,
                    "linuxConfiguration": {
                        "disablePasswordAuthentication": true,
                        "ssh": {
                            "publicKeys": [{
                                "path": format!("/home/{}/.ssh/authorized_keys", s.admin_username),
                                "keyData": spec.ssh_public_key,
                            }],
                        },
                    },
                },
                "networkProfile": { "networkInterfaces": [{ "id": self.resource_path(&nic) }] },
            },
        });

        vec![
            ResourceDescriptor { id: ip, body: ip_body },
            ResourceDescriptor { id: nsg, body: nsg_body },
            ResourceDescriptor { id: vnet, body: vnet_body },
            ResourceDescriptor { id: nic, body: nic_body },
            ResourceDescriptor { id: vm, body: vm_body },
        ]
    }

    pub async fn create_or_update(
        &self,
        resource: &ResourceDescriptor,
    ) -> Result<Operation, ProviderError> {
        let url = self.url(&resource.id);
        let token = self.token.bearer().await?;
        debug!(resource = %resource.id, "PUT {url}");
        let response = self
            .http
            .put(&url)
            .bearer_auth(token)
            .json(&resource.body)
            .send()
            .await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(ProviderError::Rejected {
                resource: resource.id.to_string(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if let Some(poll_url) = async_operation_url(&headers) {
            return Ok(Operation::pending(
                resource.id.clone(),
                poll_url,
                retry_after(&headers),
            ));
        }
        Ok(match poll_status(status, &body) {
            Some(terminal) => Operation::finished(resource.id.clone(), terminal),
            // Still provisioning: watch the resource itself.
            None => Operation::pending(resource.id.clone(), url, retry_after(&headers)),
        })
    }

    pub async fn delete_by_id(&self, id: &ResourceId) -> Result<Operation, ProviderError> {
        let url = self.url(id);
        let token = self.token.bearer().await?;
        debug!(resource = %id, "DELETE {url}");
        let response = self.http.delete(&url).bearer_auth(token).send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        match status {
            // ARM answers 204 when there was nothing to delete.
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => {
                Ok(Operation::finished(id.clone(), TerminalStatus::NotFound))
            }
            StatusCode::OK => Ok(Operation::finished(id.clone(), TerminalStatus::Succeeded)),
            StatusCode::ACCEPTED => Ok(Operation::pending(
                id.clone(),
                async_operation_url(&headers).unwrap_or(url),
                retry_after(&headers),
            )),
            _ => Err(ProviderError::Rejected {
                resource: id.to_string(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    pub async fn wait(
        &self,
        resource: &ResourceId,
        poll_url: &str,
        first_delay: Option<Duration>,
    ) -> Result<TerminalStatus, ProviderError> {
        let floor = self.settings.poll_interval;
        let mut delay = first_delay.unwrap_or(floor).max(floor);
        loop {
            tokio::time::sleep(delay).await;
            let token = self.token.bearer().await?;
            let response = self.http.get(poll_url).bearer_auth(token).send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;

            if let Some(terminal) = poll_status(status, &body) {
                if let TerminalStatus::Failed(message) = &terminal {
                    warn!(resource = %resource, %message, "azure operation failed");
                }
                return Ok(terminal);
            }
            delay = retry_after(&headers).unwrap_or(floor).max(floor);
            debug!(resource = %resource, delay_secs = delay.as_secs(), "operation still running");
        }
    }
}

fn async_operation_url(headers: &HeaderMap) -> Option<String> {
    ["azure-asyncoperation", "location"]
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs)
}

/// Interpret a PUT/poll response. `None` while the operation is still running.
fn poll_status(status: StatusCode, body: &[u8]) -> Option<TerminalStatus> {
    if status == StatusCode::NOT_FOUND {
        return Some(TerminalStatus::NotFound);
    }
    if status == StatusCode::ACCEPTED {
        return None;
    }
    if !status.is_success() {
        return Some(TerminalStatus::Failed(
            String::from_utf8_lossy(body).into_owned(),
        ));
    }
    let Ok(v) = serde_json::from_slice::<Value>(body) else {
        return Some(TerminalStatus::Succeeded);
    };
    let state = v["status"]
        .as_str()
        .or_else(|| v["properties"]["provisioningState"].as_str());
    match state {
        None | Some("Succeeded") => Some(TerminalStatus::Succeeded),
        Some("Failed") | Some("Canceled") => Some(TerminalStatus::Failed(error_message(&v))),
        Some(_) => None,
    }
}

fn error_message(v: &Value) -> String {
    v["error"]["message"]
        .as_str()
        .or_else(|| v["properties"]["error"]["message"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| v.to_string())
}
