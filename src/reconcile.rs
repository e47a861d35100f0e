use async_trait::async_trait;
use kube::api::Api;
use kube::Client;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::auth::{AuthError, TokenSource};
use crate::mirror::TagMirrorer;
use crate::resources::ImageRepository;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to get registry credential: {0}")]
    Auth(#[from] AuthError),

    #[error("failed to fetch image repository {name}")]
    Fetch {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Read access to watched repositories, injected so tests can substitute an
/// in-memory store. `Ok(None)` means the object no longer exists.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<Option<ImageRepository>>;
}

pub struct KubeRepositoryStore {
    client: Client,
}

impl KubeRepositoryStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RepositoryStore for KubeRepositoryStore {
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<Option<ImageRepository>> {
        let api: Api<ImageRepository> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(repo) => Ok(Some(repo)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Runs one end-to-end reconciliation per admitted repository key.
///
/// Stateless across invocations; everything is re-derived from the fetched
/// object each time. Once mirroring has run the reconciliation always
/// reports success: per-tag copy failures are observational only and get
/// retried when a future scan changes the revision.
pub struct Reconciler {
    store: Arc<dyn RepositoryStore>,
    token_source: Arc<dyn TokenSource>,
    mirrorer: TagMirrorer,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RepositoryStore>,
        token_source: Arc<dyn TokenSource>,
        mirrorer: TagMirrorer,
    ) -> Self {
        Self {
            store,
            token_source,
            mirrorer,
        }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let key = format!("{namespace}/{name}");

        let Some(repo) = self
            .store
            .get(namespace, name)
            .await
            .map_err(|source| ReconcileError::Fetch {
                name: key.clone(),
                source,
            })?
        else {
            // Deleted between admission and fetch; nothing to mirror.
            return Ok(());
        };

        let status = repo.status.as_ref();
        let Some(scan) = status.and_then(|status| status.last_scan_result.as_ref()) else {
            warn!("Image repository {} was admitted without a scan result", key);
            return Ok(());
        };
        let Some(image) = status
            .and_then(|status| status.canonical_image_name.as_deref())
            .filter(|image| !image.is_empty())
        else {
            warn!("Image repository {} has no canonical image name", key);
            return Ok(());
        };

        info!(
            "New tags detected for {}: image={} tags={:?}",
            key, image, scan.latest_tags
        );

        let credential = match self.token_source.current_token().await {
            Ok(credential) => credential,
            Err(err) => {
                error!("Failed to obtain registry credential for {}: {}", key, err);
                return Err(err.into());
            }
        };

        self.mirrorer
            .mirror_all(image, &scan.latest_tags, credential)
            .await;

        Ok(())
    }
}
