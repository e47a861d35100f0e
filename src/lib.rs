pub mod auth;
pub mod copy;
pub mod mirror;
pub mod predicate;
pub mod reconcile;
pub mod resources;
pub mod settings;
pub mod watch;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use auth::GcpTokenSource;
use copy::CraneCopier;
use mirror::TagMirrorer;
use reconcile::{KubeRepositoryStore, Reconciler};
use settings::Settings;

/// Wire up the controller and watch ImageRepository objects until shutdown.
pub async fn run(settings: Settings) -> Result<()> {
    // Install default CryptoProvider for rustls (required for kube-rs HTTPS connections)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let kube_config = match &settings.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?
        }
        None => kube::Config::infer().await?, // In-cluster or ~/.kube/config
    };
    let client = kube::Client::try_from(kube_config)?;

    let token_source = Arc::new(GcpTokenSource::new());
    let copier = Arc::new(CraneCopier::new(settings.crane_binary.clone()));
    let mirrorer = TagMirrorer::new(
        copier,
        settings.destination_registry.clone(),
        settings.tag_workers,
    );
    let store = Arc::new(KubeRepositoryStore::new(client.clone()));
    let reconciler = Arc::new(Reconciler::new(store, token_source, mirrorer));

    info!(
        "Starting mirror controller (destination: {}, workers: {}, tag workers: {})",
        settings.destination_registry, settings.workers, settings.tag_workers
    );
    watch::run(client, reconciler, settings.workers).await
}
