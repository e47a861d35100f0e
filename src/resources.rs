use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec half of the upstream ImageRepository resource.
///
/// Scanning is owned by the upstream image reflector; this controller only
/// reads objects and never writes them back, so the spec is modeled loosely
/// with just the fields we care about.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "image.toolkit.fluxcd.io",
    version = "v1beta2",
    kind = "ImageRepository",
    namespaced,
    status = "ImageRepositoryStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ImageRepositorySpec {
    /// Image reference being scanned, e.g. "ghcr.io/org/app".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageRepositoryStatus {
    /// Fully expanded form of the scanned image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_image_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_result: Option<ScanResult>,
}

/// Outcome of the most recent tag scan, written by the upstream reflector.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// Changes exactly when the observed tag set changes.
    #[serde(default)]
    pub revision: String,

    #[serde(default)]
    pub tag_count: i64,

    #[serde(default)]
    pub latest_tags: Vec<String>,
}

impl ImageRepository {
    /// Revision of the last scan, if one has completed. An empty revision is
    /// treated as no scan at all.
    pub fn scan_revision(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .last_scan_result
            .as_ref()
            .map(|scan| scan.revision.as_str())
            .filter(|revision| !revision.is_empty())
    }
}
