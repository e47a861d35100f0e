use futures::future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::auth::Credential;
use crate::copy::RegistryCopier;

/// One tag to copy. Built at the start of a reconciliation and dropped when
/// the copy finishes, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTask {
    pub source: String,
    pub destination: String,
}

impl MirrorTask {
    /// The destination is flattened to `{root}/{basename(image)}:{tag}`; any
    /// upstream path prefix on the canonical image name is dropped.
    pub fn new(canonical_image: &str, destination_root: &str, tag: &str) -> Self {
        let basename = canonical_image.rsplit('/').next().unwrap_or(canonical_image);
        Self {
            source: format!("{canonical_image}:{tag}"),
            destination: format!("{destination_root}/{basename}:{tag}"),
        }
    }
}

/// Fans tag copies out over a bounded worker pool.
///
/// Per-tag failures are logged and isolated: a registry hiccup on one tag
/// must not block mirroring of the remaining tags. Failed tags get another
/// chance when a future scan changes the revision and re-admits the
/// repository.
pub struct TagMirrorer {
    copier: Arc<dyn RegistryCopier>,
    destination_root: String,
    tag_workers: usize,
}

impl TagMirrorer {
    pub fn new(copier: Arc<dyn RegistryCopier>, destination_root: String, tag_workers: usize) -> Self {
        Self {
            copier,
            destination_root,
            tag_workers: tag_workers.max(1),
        }
    }

    /// Copy every tag of `canonical_image` to the destination root, at most
    /// `tag_workers` at a time. Returns only once all copies have finished;
    /// per-tag outcomes are observational and not aggregated.
    pub async fn mirror_all(&self, canonical_image: &str, tags: &[String], credential: Credential) {
        let semaphore = Arc::new(Semaphore::new(self.tag_workers));
        let credential = Arc::new(credential);
        let mut handles = Vec::with_capacity(tags.len());

        for tag in tags {
            let task = MirrorTask::new(canonical_image, &self.destination_root, tag);
            let copier = Arc::clone(&self.copier);
            let credential = Arc::clone(&credential);
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                info!("Mirroring image {} -> {}", task.source, task.destination);
                match copier.copy(&task.source, &task.destination, &credential).await {
                    Ok(()) => info!("Mirrored successfully: {}", task.destination),
                    // Log and continue; a failed tag must not abort its siblings.
                    Err(err) => error!(
                        "Failed to mirror image {} -> {}: {}",
                        task.source, task.destination, err
                    ),
                }
            }));
        }

        for result in future::join_all(handles).await {
            if let Err(err) = result {
                error!("Mirror task panicked: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::CopyError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Copier that tracks concurrent entries and records destinations.
    struct InstrumentedCopier {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        destinations: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl InstrumentedCopier {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                destinations: Mutex::new(Vec::new()),
                fail_on: fail_on.map(String::from),
            }
        }

        fn destinations(&self) -> Vec<String> {
            let mut recorded = self.destinations.lock().unwrap().clone();
            recorded.sort();
            recorded
        }
    }

    #[async_trait]
    impl RegistryCopier for InstrumentedCopier {
        async fn copy(
            &self,
            _src: &str,
            dst: &str,
            _credential: &Credential,
        ) -> Result<(), CopyError> {
            let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(20)).await;
            self.destinations.lock().unwrap().push(dst.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match &self.fail_on {
                Some(needle) if dst.contains(needle.as_str()) => Err(CopyError::Spawn {
                    command: "fake".into(),
                    source: std::io::Error::other("registry hiccup"),
                }),
                _ => Ok(()),
            }
        }
    }

    fn credential() -> Credential {
        Credential {
            principal: "oauth2accesstoken".into(),
            secret: "token".into(),
        }
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn destination_drops_upstream_path_prefix() {
        let task = MirrorTask::new(
            "registry.example.com/org/sub/app",
            "dest.example.com/proj/mirror",
            "v1.2.3",
        );
        assert_eq!(task.source, "registry.example.com/org/sub/app:v1.2.3");
        assert_eq!(task.destination, "dest.example.com/proj/mirror/app:v1.2.3");
    }

    #[test]
    fn destination_handles_unprefixed_image() {
        let task = MirrorTask::new("app", "dest.example.com/mirror", "latest");
        assert_eq!(task.destination, "dest.example.com/mirror/app:latest");
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_tag_workers() {
        let copier = Arc::new(InstrumentedCopier::new(None));
        let mirrorer = TagMirrorer::new(copier.clone(), "dest.example.com/mirror".into(), 2);

        let tags = tags(&["v1", "v2", "v3", "v4", "v5", "v6", "v7", "v8"]);
        mirrorer
            .mirror_all("registry.example.com/org/app", &tags, credential())
            .await;

        assert_eq!(copier.destinations().len(), 8);
        assert!(copier.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn single_failure_does_not_abort_siblings() {
        let copier = Arc::new(InstrumentedCopier::new(Some(":v2")));
        let mirrorer = TagMirrorer::new(copier.clone(), "dest.example.com/mirror".into(), 4);

        mirrorer
            .mirror_all(
                "registry.example.com/org/app",
                &tags(&["v1", "v2", "v3"]),
                credential(),
            )
            .await;

        // All three copies were attempted despite the v2 failure.
        assert_eq!(
            copier.destinations(),
            vec![
                "dest.example.com/mirror/app:v1",
                "dest.example.com/mirror/app:v2",
                "dest.example.com/mirror/app:v3",
            ]
        );
    }

    #[tokio::test]
    async fn zero_workers_still_makes_progress() {
        let copier = Arc::new(InstrumentedCopier::new(None));
        let mirrorer = TagMirrorer::new(copier.clone(), "dest.example.com/mirror".into(), 0);

        mirrorer
            .mirror_all("registry.example.com/org/app", &tags(&["v1"]), credential())
            .await;

        assert_eq!(copier.destinations().len(), 1);
    }
}
