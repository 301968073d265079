use std::collections::HashMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret {name} not found")]
    NotFound { name: String },

    #[error("secret {name} is not valid UTF-8")]
    InvalidEncoding { name: String },

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

/// Reads secrets from process environment variables, one variable per secret.
#[derive(Debug, Clone, Default)]
pub struct EnvSecrets;

impl EnvSecrets {
    fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        std::env::var(name).map_err(|e| match e {
            std::env::VarError::NotPresent => SecretError::NotFound { name: name.into() },
            std::env::VarError::NotUnicode(_) => SecretError::InvalidEncoding { name: name.into() },
        })
    }
}

/// Reads secrets as keys of a single Kubernetes `Secret` object.
#[derive(Clone)]
pub struct KubeSecrets {
    client: Client,
    namespace: String,
    object: String,
}

impl KubeSecrets {
    pub fn new(client: Client, namespace: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            object: object.into(),
        }
    }

    async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secret = api.get(&self.object).await?;
        debug!(namespace = %self.namespace, object = %self.object, key = name, "read secret");
        let bytes = secret
            .data
            .and_then(|mut data| data.remove(name))
            .ok_or_else(|| SecretError::NotFound { name: name.into() })?;
        String::from_utf8(bytes.0).map_err(|_| SecretError::InvalidEncoding { name: name.into() })
    }
}

/// Where the webhook HMAC key and the instance SSH key come from.
pub enum SecretStore {
    Env(EnvSecrets),
    Kubernetes(KubeSecrets),
    Static(HashMap<String, String>),
}

impl SecretStore {
    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self::Static(secrets)
    }

    pub async fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        match self {
            Self::Env(s) => s.get_secret(name),
            Self::Kubernetes(s) => s.get_secret(name).await,
            Self::Static(map) => map
                .get(name)
                .cloned()
                .ok_or_else(|| SecretError::NotFound { name: name.into() }),
        }
    }
}
