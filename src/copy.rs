use async_trait::async_trait;
use base64::Engine;
use std::path::Path;
use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::auth::Credential;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("failed to prepare registry auth config: {0}")]
    AuthConfig(#[source] std::io::Error),

    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Registry copy boundary: copy one tag from `src` to `dst`, authenticating
/// to the destination with `credential`. Copies are not transactional; a
/// copy that already committed cannot be rolled back.
#[async_trait]
pub trait RegistryCopier: Send + Sync {
    async fn copy(&self, src: &str, dst: &str, credential: &Credential) -> Result<(), CopyError>;
}

/// Copies tags with the `crane` CLI.
///
/// The credential is passed through a per-invocation `DOCKER_CONFIG`
/// directory so nothing is written to the ambient keychain and concurrent
/// copies cannot clobber each other's auth state.
pub struct CraneCopier {
    binary: String,
}

impl CraneCopier {
    pub fn new(binary: String) -> Self {
        Self { binary }
    }

    fn write_docker_config(
        dir: &Path,
        registry: &str,
        credential: &Credential,
    ) -> std::io::Result<()> {
        let auth = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", credential.principal, credential.secret));
        let config = serde_json::json!({
            "auths": { registry: { "auth": auth } }
        });
        std::fs::write(dir.join("config.json"), config.to_string())
    }
}

#[async_trait]
impl RegistryCopier for CraneCopier {
    async fn copy(&self, src: &str, dst: &str, credential: &Credential) -> Result<(), CopyError> {
        // The registry host is everything before the first path separator.
        let registry = dst.split('/').next().unwrap_or(dst);

        let config_dir = tempfile::tempdir().map_err(CopyError::AuthConfig)?;
        Self::write_docker_config(config_dir.path(), registry, credential)
            .map_err(CopyError::AuthConfig)?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("copy")
            .arg(src)
            .arg(dst)
            .env("DOCKER_CONFIG", config_dir.path())
            .kill_on_drop(true);

        debug!("Executing command: {:?}", cmd);

        let output = cmd.output().await.map_err(|source| CopyError::Spawn {
            command: self.binary.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(CopyError::Failed {
                command: self.binary.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}
