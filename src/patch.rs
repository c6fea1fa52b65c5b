//! Rewrite an image: append layers, apply config overrides, and emit a fresh
//! index/manifest/config triple with recomputed digests.
//!
//! Blobs carried over from the base image are symlinked rather than copied;
//! only the documents that actually change are rewritten.

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::media_types;
use crate::oci;
use crate::platform::Platform;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOciAttrs {
    pub base: Option<PathBuf>,
    #[serde(default)]
    pub append_layers: Vec<NewLayerRef>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub outputs: PatchOciOutputs,
}

#[derive(Debug, Deserialize)]
pub struct PatchOciOutputs {
    pub out: PathBuf,
    pub manifest: PathBuf,
    pub config: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDiffsAttrs {
    pub base: Option<PathBuf>,
    pub base_diffs: Option<PathBuf>,
    #[serde(default)]
    pub append_layers: Vec<NewLayerRef>,
    pub outputs: PatchDiffsOutputs,
}

#[derive(Debug, Deserialize)]
pub struct PatchDiffsOutputs {
    pub out: PathBuf,
}

/// Pointers to an externally built layer pair, as named in the attribute
/// record. The digest fields are paths of files holding `sha256:<hex>`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLayerRef {
    pub diff_tarball: PathBuf,
    pub diff_digest: PathBuf,
    pub blob_tarball: PathBuf,
    pub blob_digest: PathBuf,
}

/// A new layer with its digests read and its blob size measured.
#[derive(Debug)]
struct NewLayer {
    diff_tarball: PathBuf,
    diff_digest: Digest,
    blob_tarball: PathBuf,
    blob_digest: Digest,
    blob_size: u64,
}

impl NewLayer {
    fn parse(reference: &NewLayerRef) -> Result<Self> {
        Ok(Self {
            diff_tarball: reference.diff_tarball.clone(),
            diff_digest: Digest::read_from_file(&reference.diff_digest)?,
            blob_tarball: reference.blob_tarball.clone(),
            blob_digest: Digest::read_from_file(&reference.blob_digest)?,
            blob_size: fs::metadata(&reference.blob_tarball)?.len(),
        })
    }
}

/// The `patch-oci` sub-command.
pub fn run_oci(attrs: PatchOciAttrs) -> Result<()> {
    let out = &attrs.outputs.out;
    fs::create_dir_all(out.join("blobs/sha256"))?;

    let (mut manifest, mut config) = match &attrs.base {
        Some(base) => {
            let (manifest, config) = oci::load_manifest_and_config(base, &Platform::current()?)?;
            symlink_base_layer_blobs(base, out, &manifest)?;
            (manifest, config)
        }
        None => empty_image()?,
    };

    let new_layers = attrs
        .append_layers
        .iter()
        .map(NewLayer::parse)
        .collect::<Result<Vec<_>>>()?;
    for layer in &new_layers {
        symlink(&layer.blob_tarball, out.join(layer.blob_digest.as_blob_path()))?;
    }

    for layer in &new_layers {
        append_layer(layer, &mut manifest, &mut config)?;
    }
    apply_env(&attrs.env, &mut config)?;
    apply_command_overrides(&attrs, &mut config)?;

    // The config must be written first: the manifest embeds its digest.
    let config_blob = canonical_json(&config)?;
    let config_digest = Digest::from_buf_sha256(&config_blob);
    fs::write(&attrs.outputs.config, &config_blob)?;
    symlink(&attrs.outputs.config, out.join(config_digest.as_blob_path()))?;

    let manifest_config = object_field(&mut manifest, "config")?;
    manifest_config.insert("digest".to_string(), json!(config_digest.to_string()));
    manifest_config.insert("size".to_string(), json!(config_blob.len()));
    let manifest_media_type = manifest
        .get("mediaType")
        .and_then(Value::as_str)
        .ok_or(Error::MalformedDocument { field: "mediaType" })?
        .to_string();
    let manifest_blob = canonical_json(&manifest)?;
    let manifest_digest = Digest::from_buf_sha256(&manifest_blob);
    fs::write(&attrs.outputs.manifest, &manifest_blob)?;
    symlink(&attrs.outputs.manifest, out.join(manifest_digest.as_blob_path()))?;

    let index = json!({
        "schemaVersion": 2,
        "mediaType": media_types::OCI_INDEX,
        "manifests": [{
            "mediaType": manifest_media_type,
            "digest": manifest_digest.to_string(),
            "size": manifest_blob.len(),
        }],
    });
    fs::write(out.join("index.json"), canonical_json(&index)?)?;
    fs::write(out.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)?;
    Ok(())
}

/// The `patch-diffs` sub-command: the uncompressed counterpart of
/// `patch-oci`, emitting a forest of symlinks indexed by diff digest.
pub fn run_diffs(attrs: PatchDiffsAttrs) -> Result<()> {
    let out = &attrs.outputs.out;
    fs::create_dir_all(out.join("sha256"))?;

    if let Some(base) = &attrs.base {
        let base_diffs = attrs.base_diffs.as_ref().ok_or(Error::MissingBaseDiffs)?;
        let (_, config) = oci::load_manifest_and_config(base, &Platform::current()?)?;
        for diff_id in config
            .pointer("/rootfs/diff_ids")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let diff_id = diff_id.as_str().ok_or(Error::MalformedDocument {
                field: "rootfs.diff_ids",
            })?;
            let rel = Digest::new(diff_id)?.as_path_fraction();
            symlink(base_diffs.join(&rel), out.join(&rel))?;
        }
    }

    for reference in &attrs.append_layers {
        let layer = NewLayer::parse(reference)?;
        symlink(&layer.diff_tarball, out.join(layer.diff_digest.as_path_fraction()))?;
    }
    Ok(())
}

/// Serialize a JSON document in the canonical form digests are computed
/// over: keys sorted, separators minimal.
pub fn canonical_json<T: Serialize>(document: &T) -> Result<Vec<u8>> {
    // serde_json's default object map is ordered by key, so re-serializing
    // through `Value` yields sorted keys; compact output is the default.
    let value = serde_json::to_value(document)?;
    Ok(serde_json::to_vec(&value)?)
}

fn append_layer(layer: &NewLayer, manifest: &mut Value, config: &mut Value) -> Result<()> {
    array_field(config, "rootfs", "diff_ids")?.push(json!(layer.diff_digest.to_string()));
    let history = object_entry(config, "history", || json!([]))?;
    history
        .as_array_mut()
        .ok_or(Error::MalformedDocument { field: "history" })?
        .push(json!({"created_by": "stamp.patch"}));

    let manifest_media_type = manifest
        .get("mediaType")
        .and_then(Value::as_str)
        .ok_or(Error::MalformedDocument { field: "mediaType" })?;
    let layer_media_type = media_types::gzip_layer_for_manifest(manifest_media_type)
        .ok_or_else(|| Error::NoLayerMediaType(manifest_media_type.to_string()))?;
    let layers = object_entry(manifest, "layers", || json!([]))?;
    layers
        .as_array_mut()
        .ok_or(Error::MalformedDocument { field: "layers" })?
        .push(json!({
            "mediaType": layer_media_type,
            "digest": layer.blob_digest.to_string(),
            "size": layer.blob_size,
        }));
    Ok(())
}

/// Apply environment overrides to `config.config.Env`: for each pair, any
/// existing entry with the same key is removed, then `NAME=value` is
/// appended. An empty map leaves the document untouched.
pub fn apply_env(overrides: &IndexMap<String, String>, config: &mut Value) -> Result<()> {
    if overrides.is_empty() {
        return Ok(());
    }
    let mut entries: Vec<String> = config
        .pointer("/config/Env")
        .and_then(Value::as_array)
        .map(|array| {
            array
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    for (name, value) in overrides {
        let prefix = format!("{name}=");
        entries.retain(|entry| !entry.starts_with(&prefix));
        entries.push(format!("{name}={value}"));
    }
    config_section(config)?.insert("Env".to_string(), json!(entries));
    Ok(())
}

fn apply_command_overrides(attrs: &PatchOciAttrs, config: &mut Value) -> Result<()> {
    if let Some(entrypoint) = &attrs.entrypoint {
        config_section(config)?.insert("Entrypoint".to_string(), json!(entrypoint));
    }
    if let Some(cmd) = &attrs.cmd {
        config_section(config)?.insert("Cmd".to_string(), json!(cmd));
    }
    if let Some(working_dir) = &attrs.working_dir {
        config_section(config)?.insert("WorkingDir".to_string(), json!(working_dir));
    }
    if let Some(user) = &attrs.user {
        config_section(config)?.insert("User".to_string(), json!(user));
    }
    Ok(())
}

fn empty_image() -> Result<(Value, Value)> {
    let platform = Platform::current()?;
    let config = json!({
        "architecture": platform.arch.to_string(),
        "os": platform.os.to_string(),
        "rootfs": {
            "type": "layers",
            "diff_ids": [],
        },
    });
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": media_types::OCI_MANIFEST,
        "config": {
            "mediaType": media_types::OCI_CONFIG,
            // digest and size are overwritten once the config is serialized
            "digest": Value::Null,
            "size": Value::Null,
        },
        "layers": [],
    });
    Ok((manifest, config))
}

fn symlink_base_layer_blobs(base: &Path, out: &Path, manifest: &Value) -> Result<()> {
    for layer in manifest
        .get("layers")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let digest = layer.get("digest").and_then(Value::as_str).ok_or(
            Error::MalformedDocument {
                field: "layers.digest",
            },
        )?;
        let rel = Digest::new(digest)?.as_blob_path();
        symlink(base.join(&rel), out.join(&rel))?;
    }
    Ok(())
}

/// `config.config`, created as an empty object when absent.
fn config_section(config: &mut Value) -> Result<&mut Map<String, Value>> {
    object_entry(config, "config", || json!({}))?
        .as_object_mut()
        .ok_or(Error::MalformedDocument { field: "config" })
}

fn object_entry<'a>(
    document: &'a mut Value,
    key: &'static str,
    default: impl FnOnce() -> Value,
) -> Result<&'a mut Value> {
    Ok(document
        .as_object_mut()
        .ok_or(Error::MalformedDocument { field: key })?
        .entry(key)
        .or_insert_with(default))
}

fn object_field<'a>(document: &'a mut Value, key: &'static str) -> Result<&'a mut Map<String, Value>> {
    document
        .pointer_mut(&format!("/{key}"))
        .and_then(Value::as_object_mut)
        .ok_or(Error::MalformedDocument { field: key })
}

fn array_field<'a>(
    document: &'a mut Value,
    outer: &'static str,
    inner: &'static str,
) -> Result<&'a mut Vec<Value>> {
    document
        .pointer_mut(&format!("/{outer}/{inner}"))
        .and_then(Value::as_array_mut)
        .ok_or(Error::MalformedDocument { field: inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::fixtures::{sample_config, write_image};

    struct LayerFixture {
        reference: NewLayerRef,
        diff_digest: Digest,
        blob_digest: Digest,
        blob_len: u64,
    }

    fn make_layer(dir: &Path) -> LayerFixture {
        fs::create_dir_all(dir).unwrap();
        let diff_bytes = b"layer one diff";
        let blob_bytes = b"layer one blob (pretend gzip)";
        let diff_digest = Digest::from_buf_sha256(diff_bytes);
        let blob_digest = Digest::from_buf_sha256(blob_bytes);
        fs::write(dir.join("diff.tar"), diff_bytes).unwrap();
        fs::write(dir.join("blob.tar.gz"), blob_bytes).unwrap();
        diff_digest.write_to_file(&dir.join("diff.tar.digest")).unwrap();
        blob_digest.write_to_file(&dir.join("blob.tar.gz.digest")).unwrap();
        LayerFixture {
            reference: NewLayerRef {
                diff_tarball: dir.join("diff.tar"),
                diff_digest: dir.join("diff.tar.digest"),
                blob_tarball: dir.join("blob.tar.gz"),
                blob_digest: dir.join("blob.tar.gz.digest"),
            },
            diff_digest,
            blob_digest,
            blob_len: blob_bytes.len() as u64,
        }
    }

    fn overrides() -> IndexMap<String, String> {
        IndexMap::from([
            ("NEWKEY".to_string(), "mockvalue".to_string()),
            ("PATH".to_string(), "mockpath".to_string()),
        ])
    }

    #[test]
    fn patch_oci_with_base() {
        let tmp = tempfile::tempdir().unwrap();
        let base_dir = tmp.path().join("base");
        fs::create_dir_all(&base_dir).unwrap();
        let (_, base_layer_digest) = write_image(&base_dir, &sample_config(), b"base layer blob");
        let layer = make_layer(&tmp.path().join("layer1"));

        let out = tmp.path().join("out");
        let manifest_path = tmp.path().join("manifest.json");
        let config_path = tmp.path().join("config.json");
        run_oci(PatchOciAttrs {
            base: Some(base_dir.clone()),
            append_layers: vec![layer.reference],
            env: overrides(),
            entrypoint: Some(vec!["mockentrypoint".to_string()]),
            cmd: Some(vec!["mockcmd".to_string()]),
            working_dir: Some("/mock/working/dir".to_string()),
            user: None,
            outputs: PatchOciOutputs {
                out: out.clone(),
                manifest: manifest_path.clone(),
                config: config_path.clone(),
            },
        })
        .unwrap();

        let config_bytes = fs::read(&config_path).unwrap();
        let config: Value = serde_json::from_slice(&config_bytes).unwrap();
        assert_eq!(
            config["rootfs"]["diff_ids"],
            json!([
                "sha256:6b40aa9e85fff948c00254614ad3e394b7232aa052d3ba7492f599bd0c01ff1b",
                layer.diff_digest.to_string(),
            ]),
        );
        // Pre-existing Env entries survive unless their key is overridden.
        assert_eq!(
            config["config"]["Env"],
            json!(["HOME=/root", "NEWKEY=mockvalue", "PATH=mockpath"]),
        );
        assert_eq!(config["config"]["Entrypoint"], json!(["mockentrypoint"]));
        assert_eq!(config["config"]["Cmd"], json!(["mockcmd"]));
        assert_eq!(config["config"]["WorkingDir"], json!("/mock/working/dir"));
        assert_eq!(config["config"]["Labels"]["io.buildah.version"], json!("1.37.3"));
        assert_eq!(config["history"].as_array().unwrap().len(), 2);
        assert_eq!(config["history"][1], json!({"created_by": "stamp.patch"}));

        let manifest_bytes = fs::read(&manifest_path).unwrap();
        let manifest: Value = serde_json::from_slice(&manifest_bytes).unwrap();
        let config_digest = Digest::from_buf_sha256(&config_bytes);
        assert_eq!(manifest["config"]["digest"], json!(config_digest.to_string()));
        assert_eq!(manifest["config"]["size"], json!(config_bytes.len()));
        let layers = manifest["layers"].as_array().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0]["digest"], json!(base_layer_digest.to_string()));
        assert_eq!(layers[1]["digest"], json!(layer.blob_digest.to_string()));
        assert_eq!(layers[1]["mediaType"], json!(media_types::OCI_LAYER_GZIP));
        assert_eq!(layers[1]["size"], json!(layer.blob_len));

        // Fields the patcher does not understand survive the rewrite.
        assert_eq!(
            manifest["annotations"]["org.opencontainers.image.base.digest"],
            json!(""),
        );

        let manifest_digest = Digest::from_buf_sha256(&manifest_bytes);
        let index: Value =
            serde_json::from_slice(&fs::read(out.join("index.json")).unwrap()).unwrap();
        assert_eq!(index["manifests"].as_array().unwrap().len(), 1);
        assert_eq!(index["manifests"][0]["digest"], json!(manifest_digest.to_string()));
        assert_eq!(index["manifests"][0]["mediaType"], json!(media_types::OCI_MANIFEST));
        assert_eq!(
            fs::read_to_string(out.join("oci-layout")).unwrap(),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        );

        // Blob forest: base layer and new layer as symlinks, plus the fresh
        // config and manifest.
        let blob = |digest: &Digest| out.join(digest.as_blob_path());
        assert_eq!(
            fs::read_link(blob(&base_layer_digest)).unwrap(),
            base_dir.join(base_layer_digest.as_blob_path()),
        );
        assert_eq!(
            fs::read_link(blob(&layer.blob_digest)).unwrap(),
            tmp.path().join("layer1/blob.tar.gz"),
        );
        assert_eq!(fs::read_link(blob(&config_digest)).unwrap(), config_path);
        assert_eq!(fs::read_link(blob(&manifest_digest)).unwrap(), manifest_path);
        // ... and nothing else.
        assert_eq!(fs::read_dir(out.join("blobs/sha256")).unwrap().count(), 4);
    }

    #[test]
    fn patch_oci_without_base() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = make_layer(&tmp.path().join("layer1"));

        let out = tmp.path().join("out");
        run_oci(PatchOciAttrs {
            base: None,
            append_layers: vec![layer.reference],
            env: overrides(),
            entrypoint: Some(vec!["mockentrypoint".to_string()]),
            cmd: Some(vec!["mockcmd".to_string()]),
            working_dir: Some("/mock/working/dir".to_string()),
            user: Some("65534:65534".to_string()),
            outputs: PatchOciOutputs {
                out: out.clone(),
                manifest: tmp.path().join("manifest.json"),
                config: tmp.path().join("config.json"),
            },
        })
        .unwrap();

        let config: Value =
            serde_json::from_slice(&fs::read(tmp.path().join("config.json")).unwrap()).unwrap();
        let platform = Platform::current().unwrap();
        assert_eq!(config["architecture"], json!(platform.arch.to_string()));
        assert_eq!(config["os"], json!(platform.os.to_string()));
        assert_eq!(config["rootfs"]["diff_ids"], json!([layer.diff_digest.to_string()]));
        assert_eq!(config["config"]["Env"], json!(["NEWKEY=mockvalue", "PATH=mockpath"]));
        assert_eq!(config["config"]["User"], json!("65534:65534"));
        assert_eq!(config["history"], json!([{"created_by": "stamp.patch"}]));

        let manifest: Value =
            serde_json::from_slice(&fs::read(tmp.path().join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["layers"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn patch_diffs_links_base_and_new() {
        let tmp = tempfile::tempdir().unwrap();
        let base_dir = tmp.path().join("base");
        fs::create_dir_all(&base_dir).unwrap();
        write_image(&base_dir, &sample_config(), b"base layer blob");

        let base_diff_id =
            Digest::new("sha256:6b40aa9e85fff948c00254614ad3e394b7232aa052d3ba7492f599bd0c01ff1b")
                .unwrap();
        let base_diffs = tmp.path().join("base-diffs");
        fs::create_dir_all(base_diffs.join("sha256")).unwrap();
        fs::write(base_diffs.join(base_diff_id.as_path_fraction()), b"base diff").unwrap();

        let layer = make_layer(&tmp.path().join("layer1"));

        let out = tmp.path().join("out");
        run_diffs(PatchDiffsAttrs {
            base: Some(base_dir),
            base_diffs: Some(base_diffs.clone()),
            append_layers: vec![layer.reference],
            outputs: PatchDiffsOutputs { out: out.clone() },
        })
        .unwrap();

        assert_eq!(
            fs::read_link(out.join(base_diff_id.as_path_fraction())).unwrap(),
            base_diffs.join(base_diff_id.as_path_fraction()),
        );
        assert_eq!(
            fs::read_link(out.join(layer.diff_digest.as_path_fraction())).unwrap(),
            tmp.path().join("layer1/diff.tar"),
        );
    }

    #[test]
    fn patch_diffs_requires_base_diffs() {
        let tmp = tempfile::tempdir().unwrap();
        let result = run_diffs(PatchDiffsAttrs {
            base: Some(tmp.path().join("base")),
            base_diffs: None,
            append_layers: vec![],
            outputs: PatchDiffsOutputs {
                out: tmp.path().join("out"),
            },
        });
        assert!(matches!(result, Err(Error::MissingBaseDiffs)));
    }

    #[test]
    fn apply_env_is_idempotent() {
        let mut config = sample_config();
        apply_env(&overrides(), &mut config).unwrap();
        let once = config.clone();
        apply_env(&overrides(), &mut config).unwrap();
        assert_eq!(config, once);
    }

    #[test]
    fn apply_env_empty_map_is_a_no_op() {
        let mut config = sample_config();
        let before = config.clone();
        apply_env(&IndexMap::new(), &mut config).unwrap();
        assert_eq!(config, before);
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let document = json!({"zeta": 1, "alpha": {"c": 3, "b": 2}});
        assert_eq!(
            canonical_json(&document).unwrap(),
            br#"{"alpha":{"b":2,"c":3},"zeta":1}"#,
        );
    }
}
