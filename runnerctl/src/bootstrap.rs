use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[error("failed to read bootstrap script {path:?}: {source}")]
pub struct BootstrapError {
    path: PathBuf,
    source: std::io::Error,
}

/// Source of the cloud-init script handed to every new runner as user data.
#[derive(Debug, Clone)]
pub enum BootstrapSource {
    /// Read from disk on every provisioning request, so edits apply without
    /// a restart.
    File(PathBuf),
    Inline(String),
}

impl BootstrapSource {
    pub async fn load(&self) -> Result<Vec<u8>, BootstrapError> {
        match self {
            Self::File(path) => tokio::fs::read(path).await.map_err(|source| BootstrapError {
                path: path.clone(),
                source,
            }),
            Self::Inline(script) => Ok(script.clone().into_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inline_script_is_returned_verbatim() {
        let source = BootstrapSource::Inline("#cloud-config\nruncmd: []\n".into());
        assert_eq!(source.load().await.unwrap(), b"#cloud-config\nruncmd: []\n");
    }

    #[tokio::test]
    async fn missing_file_names_the_path() {
        let source = BootstrapSource::File("/nonexistent/cloud-init.txt".into());
        let err = source.load().await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/cloud-init.txt"));
    }
}
