use anyhow::bail;
use clap::Parser;
use std::path::PathBuf;

/// Process configuration, read once at startup.
#[derive(Debug, Parser)]
#[command(author, version, about = "Mirrors scanned ImageRepository tags to a destination registry")]
pub struct Settings {
    /// Destination registry prefix to mirror images to
    /// (e.g. "europe-west4-docker.pkg.dev/my-project/my-repo").
    #[arg(long, env = "DESTINATION_REGISTRY")]
    pub destination_registry: String,

    /// Number of ImageRepository reconciles to run concurrently.
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Number of tag copies to run concurrently per reconcile.
    #[arg(long, env = "TAG_WORKERS", default_value_t = 4)]
    pub tag_workers: usize,

    /// Path to a kubeconfig file (defaults to in-cluster config or ~/.kube/config).
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Binary used for registry copies.
    #[arg(long, default_value = "crane")]
    pub crane_binary: String,
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.destination_registry.trim().is_empty() {
            bail!("--destination-registry must not be empty");
        }
        if self.destination_registry.ends_with('/') {
            bail!("--destination-registry must not end with '/'");
        }
        if self.workers == 0 || self.tag_workers == 0 {
            bail!("--workers and --tag-workers must be at least 1");
        }
        Ok(())
    }
}
