use crate::resources::ImageRepository;

/// Lifecycle events synthesized by the watch substrate. `Updated` carries
/// both snapshots so revision transitions are visible to the predicate.
#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    Created(ImageRepository),
    Updated {
        old: ImageRepository,
        new: ImageRepository,
    },
    Deleted(ImageRepository),
}

/// Decides whether an event represents new or removed tags (i.e. the scan
/// revision changed) and is worth a mirror reconciliation.
///
/// Pure function over the observed status; safe to call repeatedly for the
/// same event. Deletions never trigger mirroring, there is no registry-side
/// cleanup.
pub fn tags_changed(event: &RepositoryEvent) -> bool {
    match event {
        RepositoryEvent::Created(repo) => repo.scan_revision().is_some(),
        RepositoryEvent::Updated { old, new } => match (old.scan_revision(), new.scan_revision()) {
            (None, Some(_)) => true,
            (Some(previous), Some(current)) => previous != current,
            _ => false,
        },
        RepositoryEvent::Deleted(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ImageRepositorySpec, ImageRepositoryStatus, ScanResult};

    fn repo_with_revision(revision: Option<&str>) -> ImageRepository {
        let mut repo = ImageRepository::new("app", ImageRepositorySpec::default());
        repo.status = Some(ImageRepositoryStatus {
            canonical_image_name: Some("ghcr.io/org/app".into()),
            last_scan_result: revision.map(|revision| ScanResult {
                revision: revision.to_string(),
                tag_count: 1,
                latest_tags: vec!["v1".into()],
            }),
        });
        repo
    }

    #[test]
    fn create_admits_only_with_scanned_revision() {
        assert!(tags_changed(&RepositoryEvent::Created(repo_with_revision(
            Some("r1")
        ))));
        assert!(!tags_changed(&RepositoryEvent::Created(repo_with_revision(
            None
        ))));
        // A scan result with an empty revision is treated as no scan yet.
        assert!(!tags_changed(&RepositoryEvent::Created(repo_with_revision(
            Some("")
        ))));
    }

    #[test]
    fn update_admits_when_scan_appears() {
        let event = RepositoryEvent::Updated {
            old: repo_with_revision(None),
            new: repo_with_revision(Some("r1")),
        };
        assert!(tags_changed(&event));
    }

    #[test]
    fn update_admits_when_revision_changes() {
        let event = RepositoryEvent::Updated {
            old: repo_with_revision(Some("r1")),
            new: repo_with_revision(Some("r2")),
        };
        assert!(tags_changed(&event));
    }

    #[test]
    fn update_rejects_unchanged_revision() {
        let event = RepositoryEvent::Updated {
            old: repo_with_revision(Some("r1")),
            new: repo_with_revision(Some("r1")),
        };
        assert!(!tags_changed(&event));
    }

    #[test]
    fn update_rejects_when_both_unscanned() {
        let event = RepositoryEvent::Updated {
            old: repo_with_revision(None),
            new: repo_with_revision(None),
        };
        assert!(!tags_changed(&event));
    }

    #[test]
    fn update_rejects_when_scan_disappears() {
        let event = RepositoryEvent::Updated {
            old: repo_with_revision(Some("r1")),
            new: repo_with_revision(None),
        };
        assert!(!tags_changed(&event));
    }

    #[test]
    fn delete_never_admits() {
        assert!(!tags_changed(&RepositoryEvent::Deleted(repo_with_revision(
            Some("r1")
        ))));
    }
}
