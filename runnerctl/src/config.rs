use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use envconfig::Envconfig;
use kube::Client;

use crate::bootstrap::BootstrapSource;
use crate::controller::ControllerSettings;
use crate::providers::azure::{AzureProvider, AzureSettings, ImageReference};
use crate::providers::gcp::{GcpProvider, GcpSettings};
use crate::providers::provider::{Provider, ProviderError};
use crate::providers::token::{MetadataToken, TokenSource};
use crate::secrets::{EnvSecrets, KubeSecrets, SecretError, SecretStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gcp,
    Azure,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {what} {value:?}")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

impl std::str::FromStr for ProviderKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gcp" | "gce" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            _ => Err(UnknownVariant {
                what: "provider",
                value: s.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretsBackend {
    Env,
    Kubernetes,
}

impl std::str::FromStr for SecretsBackend {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "env" => Ok(Self::Env),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            _ => Err(UnknownVariant {
                what: "secrets backend",
                value: s.into(),
            }),
        }
    }
}

/// Process configuration, read once from the environment at startup.
#[derive(Envconfig, Debug, Clone)]
pub struct Config {
    #[envconfig(from = "RUNNERCTL_LISTEN_ADDR", default = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    #[envconfig(from = "RUNNERCTL_TARGET_LABEL", default = "nested-virt")]
    pub target_label: String,

    #[envconfig(from = "RUNNERCTL_INSTANCE_PREFIX", default = "builder")]
    pub instance_prefix: String,

    #[envconfig(from = "RUNNERCTL_PROVIDER", default = "gcp")]
    pub provider: ProviderKind,

    #[envconfig(from = "RUNNERCTL_SECRETS_BACKEND", default = "env")]
    pub secrets_backend: SecretsBackend,

    #[envconfig(from = "RUNNERCTL_SECRETS_NAMESPACE", default = "default")]
    pub secrets_namespace: String,

    #[envconfig(from = "RUNNERCTL_SECRETS_OBJECT", default = "runnerctl")]
    pub secrets_object: String,

    #[envconfig(from = "RUNNERCTL_WEBHOOK_SECRET_NAME", default = "WEBHOOK_TOKEN")]
    pub webhook_secret_name: String,

    #[envconfig(from = "RUNNERCTL_SSH_KEY_SECRET_NAME", default = "SSH_PUBLIC_KEY")]
    pub ssh_key_secret_name: String,

    #[envconfig(from = "RUNNERCTL_BOOTSTRAP_PATH", default = "cloud-init.txt")]
    pub bootstrap_path: PathBuf,

    #[envconfig(from = "RUNNERCTL_OPERATION_TIMEOUT_SECS", default = "300")]
    pub operation_timeout_secs: u64,

    #[envconfig(from = "RUNNERCTL_POLL_INTERVAL_SECS", default = "5")]
    pub poll_interval_secs: u64,

    #[envconfig(from = "RUNNERCTL_ADMIN_USERNAME", default = "runner")]
    pub admin_username: String,

    /// Skips the metadata server when set.
    #[envconfig(from = "RUNNERCTL_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    #[envconfig(from = "GCP_PROJECT")]
    pub gcp_project: Option<String>,

    #[envconfig(from = "GCP_ZONE", default = "us-central1-c")]
    pub gcp_zone: String,

    #[envconfig(from = "GCP_MACHINE_TYPE", default = "n2-highmem-4")]
    pub gcp_machine_type: String,

    #[envconfig(
        from = "GCP_SOURCE_IMAGE",
        default = "projects/ubuntu-os-cloud/global/images/family/ubuntu-2004-lts"
    )]
    pub gcp_source_image: String,

    #[envconfig(from = "GCP_NETWORK", default = "global/networks/default")]
    pub gcp_network: String,

    #[envconfig(from = "GCP_DISK_SIZE_GB", default = "64")]
    pub gcp_disk_size_gb: u32,

    #[envconfig(from = "GCP_SERVICE_ACCOUNT")]
    pub gcp_service_account: Option<String>,

    #[envconfig(
        from = "GCP_COMPUTE_ENDPOINT",
        default = "https://compute.googleapis.com/compute/v1"
    )]
    pub gcp_compute_endpoint: String,

    #[envconfig(from = "AZURE_SUBSCRIPTION_ID")]
    pub azure_subscription_id: Option<String>,

    #[envconfig(from = "AZURE_RESOURCE_GROUP")]
    pub azure_resource_group: Option<String>,

    #[envconfig(from = "AZURE_LOCATION", default = "northeurope")]
    pub azure_location: String,

    #[envconfig(from = "AZURE_VM_SIZE", default = "Standard_D4s_v3")]
    pub azure_vm_size: String,

    #[envconfig(
        from = "AZURE_IMAGE",
        default = "Canonical:0001-com-ubuntu-server-focal:20_04-lts-gen2:latest"
    )]
    pub azure_image: String,

    #[envconfig(from = "AZURE_DISK_SIZE_GB", default = "64")]
    pub azure_disk_size_gb: u32,

    #[envconfig(from = "AZURE_ARM_ENDPOINT", default = "https://management.azure.com")]
    pub azure_arm_endpoint: String,
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ProviderError> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or(ProviderError::MissingConfig { field })
}

impl Config {
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            target_label: self.target_label.clone(),
            instance_prefix: self.instance_prefix.clone(),
            webhook_secret_name: self.webhook_secret_name.clone(),
            ssh_key_secret_name: self.ssh_key_secret_name.clone(),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn gcp_settings(&self) -> Result<GcpSettings, ProviderError> {
        Ok(GcpSettings {
            project: required(&self.gcp_project, "GCP_PROJECT")?,
            zone: self.gcp_zone.clone(),
            machine_type: self.gcp_machine_type.clone(),
            source_image: self.gcp_source_image.clone(),
            network: self.gcp_network.clone(),
            disk_size_gb: self.gcp_disk_size_gb,
            service_account: self.gcp_service_account.clone().filter(|s| !s.is_empty()),
            admin_username: self.admin_username.clone(),
            poll_interval: self.poll_interval(),
        })
    }

    pub fn azure_settings(&self) -> Result<AzureSettings, ProviderError> {
        let image: ImageReference = self
            .azure_image
            .parse()
            .map_err(|e| ProviderError::Internal(anyhow::Error::new(e)))?;
        Ok(AzureSettings {
            subscription_id: required(&self.azure_subscription_id, "AZURE_SUBSCRIPTION_ID")?,
            resource_group: required(&self.azure_resource_group, "AZURE_RESOURCE_GROUP")?,
            location: self.azure_location.clone(),
            vm_size: self.azure_vm_size.clone(),
            image,
            disk_size_gb: self.azure_disk_size_gb,
            admin_username: self.admin_username.clone(),
            poll_interval: self.poll_interval(),
        })
    }

    /// Build the configured cloud adapter.
    pub fn provider(&self) -> Result<Provider, ProviderError> {
        let http = reqwest::Client::new();
        let token = |metadata: fn(reqwest::Client) -> MetadataToken| match &self.access_token {
            Some(token) if !token.is_empty() => TokenSource::Static(token.clone()),
            _ => TokenSource::Metadata(metadata(http.clone())),
        };
        Ok(match self.provider {
            ProviderKind::Gcp => Provider::Gcp(
                GcpProvider::new(self.gcp_settings()?, token(MetadataToken::gce))
                    .with_endpoint(self.gcp_compute_endpoint.trim_end_matches('/')),
            ),
            ProviderKind::Azure => Provider::Azure(
                AzureProvider::new(self.azure_settings()?, token(MetadataToken::azure_imds))
                    .with_endpoint(self.azure_arm_endpoint.trim_end_matches('/')),
            ),
        })
    }

    pub async fn secret_store(&self) -> Result<SecretStore, SecretError> {
        Ok(match self.secrets_backend {
            SecretsBackend::Env => SecretStore::Env(EnvSecrets),
            SecretsBackend::Kubernetes => {
                let client = Client::try_default().await?;
                SecretStore::Kubernetes(KubeSecrets::new(
                    client,
                    &self.secrets_namespace,
                    &self.secrets_object,
                ))
            }
        })
    }

    pub fn bootstrap(&self) -> BootstrapSource {
        BootstrapSource::File(self.bootstrap_path.clone())
    }
}
