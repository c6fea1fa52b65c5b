use clap::Parser;
use serde::de::DeserializeOwned;
use stamp::error::{Error, Result};
use std::fs;
use std::path::PathBuf;

/// Environment variable naming the JSON attribute record for this
/// invocation.
const ATTRS_FILE_ENV: &str = "NIX_ATTRS_JSON_FILE";

#[derive(Debug, Parser)]
#[command(
    name = "stamp",
    about = "Compose, mutate, and repackage OCI container images from layer diffs"
)]
enum Command {
    /// Decompress every layer of an image, indexed by diff digest
    ExtractDiffs,
    /// Build a layer blob and diff directly from store paths
    Layer,
    /// Compress an existing diff into a layer blob
    LayerBlob,
    /// Build a layer diff from copy directives and scripts
    LayerDiff,
    /// Partition a store closure into size-bounded layer groups
    NixPackingPlan,
    /// Build an uncompressed layer diff from store paths
    NixStoreLayerDiff,
    /// Symlink a patched image's diffs by digest
    PatchDiffs,
    /// Append layers and config overrides to an image
    PatchOci,
}

fn main() -> Result<()> {
    env_logger::init();
    match Command::parse() {
        Command::ExtractDiffs => stamp::extract_diffs::run(read_attrs()?),
        Command::Layer => stamp::layer::run(read_attrs()?),
        Command::LayerBlob => stamp::pipeline::run(read_attrs()?),
        Command::LayerDiff => stamp::layer_diff::run(read_attrs()?),
        Command::NixPackingPlan => stamp::packing::run(read_attrs()?),
        Command::NixStoreLayerDiff => stamp::layer::run_store_diff(read_attrs()?),
        Command::PatchDiffs => stamp::patch::run_diffs(read_attrs()?),
        Command::PatchOci => stamp::patch::run_oci(read_attrs()?),
    }
}

fn read_attrs<T: DeserializeOwned>() -> Result<T> {
    let path = std::env::var_os(ATTRS_FILE_ENV)
        .map(PathBuf::from)
        .ok_or(Error::MissingEnv(ATTRS_FILE_ENV))?;
    Ok(serde_json::from_reader(fs::File::open(path)?)?)
}
