//! Image manifest parsing (§4.C): schema-1 and schema-2 Docker manifests,
//! which may coexist in a single document.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::SysContainerError;

#[derive(Debug, Deserialize, Default)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize, Default)]
struct FsLayerSchema1 {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Debug, Deserialize, Default)]
struct ManifestSchema {
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default, rename = "fsLayers")]
    fs_layers: Vec<FsLayerSchema1>,
}

fn hex_suffix(digest: &str) -> String {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest).to_string()
}

/// Extract the ordered list of layer digests (hex only, no `sha256:` prefix)
/// from a manifest blob. Schema-2 `layers` come first, in document order;
/// then schema-1 `fsLayers`, reversed (schema-1 lists the top layer first).
pub fn layer_digests(manifest_json: &[u8]) -> Result<Vec<String>> {
    let schema: ManifestSchema = serde_json::from_slice(manifest_json)
        .map_err(|e| SysContainerError::BadManifest(e.to_string()))
        .context("parsing image manifest")?;

    let mut out: Vec<String> = schema.layers.iter().map(|d| hex_suffix(&d.digest)).collect();
    out.extend(schema.fs_layers.iter().rev().map(|l| hex_suffix(&l.blob_sum)));
    Ok(out)
}
