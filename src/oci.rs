//! Reading OCI image layouts: index walking, platform selection, and
//! manifest/config loading.
//!
//! Manifests and configs are kept as raw JSON documents rather than typed
//! models: the patcher must round-trip fields it does not understand, and
//! digests are computed over a canonical re-serialization.

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::media_types;
use crate::platform::Platform;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// A manifest reference found in an image index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRef {
    pub media_type: String,
    pub digest: String,
    pub platform: Option<PlatformRef>,
}

/// The platform fields of a manifest reference. Either may be absent, which
/// counts as a match.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRef {
    pub architecture: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexDoc {
    media_type: Option<String>,
    manifests: Vec<ManifestRef>,
}

/// The on-disk location of a blob: the colon of `<algo>:<hex>` becomes a
/// slash under `blobs/`.
pub fn blob_path(oci_dir: &Path, digest: &Digest) -> PathBuf {
    oci_dir.join(digest.as_blob_path())
}

/// Walk `index.json` and any nested indices, collecting manifest references.
pub fn manifest_refs(oci_dir: &Path) -> Result<Vec<ManifestRef>> {
    let mut refs = Vec::new();
    walk_index(oci_dir, &oci_dir.join("index.json"), &mut refs)?;
    Ok(refs)
}

fn walk_index(oci_dir: &Path, index_path: &Path, refs: &mut Vec<ManifestRef>) -> Result<()> {
    let index: IndexDoc = serde_json::from_reader(fs::File::open(index_path)?)?;
    if let Some(media_type) = &index.media_type {
        if !media_types::is_index(media_type) {
            return Err(Error::NotAnIndex {
                path: index_path.to_path_buf(),
                media_type: media_type.clone(),
            });
        }
    }
    for manifest_ref in index.manifests {
        if media_types::is_index(&manifest_ref.media_type) {
            let nested = blob_path(oci_dir, &Digest::new(&manifest_ref.digest)?);
            walk_index(oci_dir, &nested, refs)?;
        } else if media_types::is_manifest(&manifest_ref.media_type) {
            refs.push(manifest_ref);
        } else {
            return Err(Error::UnrecognisedManifestRef {
                path: index_path.to_path_buf(),
                digest: manifest_ref.digest,
                media_type: manifest_ref.media_type,
            });
        }
    }
    Ok(())
}

fn matches_platform(manifest_ref: &ManifestRef, desired: &Platform) -> bool {
    let Some(platform) = &manifest_ref.platform else {
        return true;
    };
    let arch_ok = platform
        .architecture
        .as_ref()
        .map_or(true, |a| *a == desired.arch.to_string());
    let os_ok = platform
        .os
        .as_ref()
        .map_or(true, |o| *o == desired.os.to_string());
    arch_ok && os_ok
}

/// Select the single manifest suiting `desired` and load it together with
/// its config. Zero or multiple candidates is a platform mismatch.
pub fn load_manifest_and_config(oci_dir: &Path, desired: &Platform) -> Result<(Value, Value)> {
    let mut matching: Vec<ManifestRef> = manifest_refs(oci_dir)?
        .into_iter()
        .filter(|r| matches_platform(r, desired))
        .collect();
    if matching.is_empty() {
        return Err(Error::NoMatchingManifest);
    }
    if matching.len() > 1 {
        return Err(Error::MultipleMatchingManifests);
    }
    let manifest_ref = matching.remove(0);

    let manifest_path = blob_path(oci_dir, &Digest::new(&manifest_ref.digest)?);
    let manifest: Value = serde_json::from_reader(fs::File::open(&manifest_path)?)?;
    let media_type = manifest.get("mediaType").and_then(Value::as_str).unwrap_or("");
    if !media_types::is_manifest(media_type) {
        return Err(Error::UnrecognisedManifest {
            path: manifest_path,
            media_type: media_type.to_string(),
        });
    }

    let config_digest = manifest
        .pointer("/config/digest")
        .and_then(Value::as_str)
        .ok_or(Error::MalformedDocument {
            field: "config.digest",
        })?;
    let config_path = blob_path(oci_dir, &Digest::new(config_digest)?);
    let config: Value = serde_json::from_reader(fs::File::open(&config_path)?)?;
    if config.pointer("/rootfs/type").and_then(Value::as_str) != Some("layers") {
        return Err(Error::WrongRootfsType { path: config_path });
    }

    Ok((manifest, config))
}
