//! Layers built directly from immutable store paths, with no staging step.
//!
//! `layer` appends whole source trees into one deterministic tar (renaming
//! each to its in-image destination) and compresses it into a blob; the
//! diff-only variant just tars the named paths as they are.

use crate::archive::{Owner, TarWriter};
use crate::error::{Error, Result};
use crate::pipeline::{self, Sha256Writer};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerAttrs {
    #[serde(default)]
    pub copy: Vec<StoreCopyDirective>,
    pub outputs: LayerOutputs,
}

#[derive(Debug, Deserialize)]
pub struct LayerOutputs {
    /// Blob directory: `blob.tar.gz` + `digest`.
    pub out: PathBuf,
    /// Diff directory: `diff.tar` + `digest`.
    pub diff: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreCopyDirective {
    pub src: PathBuf,
    pub dest: PathBuf,
    pub owner: Option<u64>,
    pub group: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDiffAttrs {
    pub paths: Vec<PathBuf>,
    pub outputs: StoreDiffOutputs,
}

#[derive(Debug, Deserialize)]
pub struct StoreDiffOutputs {
    pub out: PathBuf,
}

/// The `layer` sub-command.
pub fn run(attrs: LayerAttrs) -> Result<()> {
    execute(&attrs, crate::source_date_epoch()?)
}

pub fn execute(attrs: &LayerAttrs, source_date_epoch: u64) -> Result<()> {
    fs::create_dir_all(&attrs.outputs.diff)?;
    let tar_path = attrs.outputs.diff.join("diff.tar");
    let mut writer = TarWriter::new(
        Sha256Writer::new(fs::File::create(&tar_path)?),
        source_date_epoch,
    );
    for directive in &attrs.copy {
        let owner = directive.owner.unwrap_or(0);
        let group = directive.group.unwrap_or(owner);
        writer.append_tree(
            &directive.src,
            &directive.dest,
            Owner::Fixed {
                uid: owner,
                gid: group,
            },
        )?;
    }
    let (diff_digest, _tar_file) = writer.into_inner()?.finish();
    diff_digest.write_to_file(&attrs.outputs.diff.join("digest"))?;

    pipeline::compress_blob(&tar_path, &attrs.outputs.out)?;
    Ok(())
}

/// The `nix-store-layer-diff` sub-command.
pub fn run_store_diff(attrs: StoreDiffAttrs) -> Result<()> {
    execute_store_diff(&attrs, crate::source_date_epoch()?)
}

pub fn execute_store_diff(attrs: &StoreDiffAttrs, source_date_epoch: u64) -> Result<()> {
    let mut paths = attrs.paths.clone();
    paths.sort();
    for path in &paths {
        if !path.is_absolute() {
            return Err(Error::NotAbsolute(path.clone()));
        }
    }

    fs::create_dir_all(&attrs.outputs.out)?;
    let tar_path = attrs.outputs.out.join("diff.tar");
    let mut writer = TarWriter::new(
        Sha256Writer::new(fs::File::create(&tar_path)?),
        source_date_epoch,
    );
    for path in &paths {
        writer.append_tree(path, path, Owner::Fixed { uid: 0, gid: 0 })?;
    }
    let (digest, _tar_file) = writer.into_inner()?.finish();
    digest.write_to_file(&attrs.outputs.out.join("digest"))
}
