//! Decompress every layer blob of an image, indexing the results by their
//! uncompressed digest.

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::media_types;
use crate::oci::{self, ManifestRef};
use crate::pipeline::Sha256Writer;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct ExtractDiffsAttrs {
    pub oci: PathBuf,
    pub outputs: ExtractDiffsOutputs,
}

#[derive(Debug, Deserialize)]
pub struct ExtractDiffsOutputs {
    pub out: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Gzip,
}

/// The `extract-diffs` sub-command. Every manifest in the image is visited,
/// with no platform filtering; layers shared between manifests are
/// decompressed once.
pub fn run(attrs: ExtractDiffsAttrs) -> Result<()> {
    let oci_dir = &attrs.oci;
    let out_dir = &attrs.outputs.out;

    let mut layers: BTreeMap<String, Compression> = BTreeMap::new();
    for manifest_ref in oci::manifest_refs(oci_dir)? {
        for (digest, compression) in manifest_layers(oci_dir, &manifest_ref)? {
            layers.insert(digest, compression);
        }
    }

    fs::create_dir_all(out_dir.join("sha256"))?;
    for (blob_digest, compression) in layers {
        let blob_path = oci::blob_path(oci_dir, &Digest::new(&blob_digest)?);
        let staging = out_dir.join("staging");
        let diff_digest = decompress_and_digest(&blob_path, &staging, compression)?;
        fs::rename(&staging, out_dir.join(diff_digest.as_path_fraction()))?;
    }
    Ok(())
}

fn manifest_layers(oci_dir: &Path, manifest_ref: &ManifestRef) -> Result<Vec<(String, Compression)>> {
    let manifest_path = oci::blob_path(oci_dir, &Digest::new(&manifest_ref.digest)?);
    let manifest: Value = serde_json::from_reader(fs::File::open(&manifest_path)?)?;
    let media_type = manifest.get("mediaType").and_then(Value::as_str).unwrap_or("");
    if !media_types::is_manifest(media_type) {
        return Err(Error::UnrecognisedManifest {
            path: manifest_path,
            media_type: media_type.to_string(),
        });
    }

    let mut layers = Vec::new();
    for layer in manifest
        .get("layers")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let media_type = layer.get("mediaType").and_then(Value::as_str).unwrap_or("");
        let digest = layer.get("digest").and_then(Value::as_str).ok_or(
            Error::MalformedDocument {
                field: "layers.digest",
            },
        )?;
        if media_types::is_gzip_layer(media_type) {
            layers.push((digest.to_string(), Compression::Gzip));
        } else if media_type == media_types::IN_TOTO {
            // This "layer" is some kind of metadata, not a diff. Do nothing.
        } else {
            return Err(Error::UnrecognisedLayer {
                path: manifest_path,
                digest: digest.to_string(),
                media_type: media_type.to_string(),
            });
        }
    }
    Ok(layers)
}

fn decompress_and_digest(
    blob_path: &Path,
    out_path: &Path,
    compression: Compression,
) -> Result<Digest> {
    let Compression::Gzip = compression;
    let mut decoder = GzDecoder::new(fs::File::open(blob_path)?);
    let mut writer = Sha256Writer::new(fs::File::create(out_path)?);
    io::copy(&mut decoder, &mut writer)?;
    let (digest, _file) = writer.finish();
    Ok(digest)
}
