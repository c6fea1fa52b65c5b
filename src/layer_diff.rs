//! Build one layer diff from copy directives and optional host-side or
//! in-container scripts.
//!
//! The three phases run strictly in order: copy, host script, container
//! script. Whatever ends up in the staging directory is packed into a
//! deterministic `diff.tar` with its digest alongside.

use crate::archive::{Owner, TarWriter};
use crate::error::{Error, Result};
use crate::oci;
use crate::pipeline::Sha256Writer;
use crate::platform::Platform;
use crate::runtime::Runtime;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{lchown, symlink};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDiffAttrs {
    #[serde(default)]
    pub copy: Vec<CopyDirective>,
    pub run_on_host: Option<String>,
    #[serde(rename = "runOnHostUID")]
    pub run_on_host_uid: Option<u32>,
    #[serde(rename = "runOnHostGID")]
    pub run_on_host_gid: Option<u32>,
    pub run_in_container: Option<String>,
    pub run_in_container_base: Option<PathBuf>,
    pub run_in_container_base_diffs: Option<PathBuf>,
    pub outputs: LayerDiffOutputs,
}

#[derive(Debug, Deserialize)]
pub struct LayerDiffOutputs {
    pub out: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyDirective {
    pub src: PathBuf,
    pub dest: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl CopyDirective {
    fn uid(&self) -> u32 {
        self.uid.unwrap_or(0)
    }

    fn gid(&self) -> u32 {
        self.gid.unwrap_or_else(|| self.uid())
    }
}

/// The `layer-diff` sub-command. Stages into `./content`, scratch space for
/// the container runtime under `./rt`.
pub fn run(attrs: LayerDiffAttrs) -> Result<()> {
    let epoch = crate::source_date_epoch()?;
    execute(&attrs, Path::new("."), epoch)
}

pub fn execute(attrs: &LayerDiffAttrs, work_dir: &Path, source_date_epoch: u64) -> Result<()> {
    execute_with(attrs, work_dir, source_date_epoch, UidHandling::detect(attrs)?)
}

fn execute_with(
    attrs: &LayerDiffAttrs,
    work_dir: &Path,
    source_date_epoch: u64,
    uid_handling: UidHandling,
) -> Result<()> {
    let mut runtime = Runtime::new(work_dir.join("rt"))?;

    let content_dir = work_dir.join("content");
    fs::create_dir(&content_dir)?;
    do_copy(&attrs.copy, &content_dir, &uid_handling)?;
    if let Some(script) = &attrs.run_on_host {
        run_on_host(script, &content_dir)?;
    }
    if let Some(script) = &attrs.run_in_container {
        run_in_container(attrs, script, &content_dir, &mut runtime, source_date_epoch)?;
    }

    pack(&content_dir, &attrs.outputs.out, &uid_handling, source_date_epoch)
}

fn do_copy(directives: &[CopyDirective], content_dir: &Path, uid_handling: &UidHandling) -> Result<()> {
    for directive in directives {
        let dest_rel = directive
            .dest
            .strip_prefix("/")
            .map_err(|_| Error::NotAbsolute(directive.dest.clone()))?;
        let dest = content_dir.join(dest_rel);
        let chown = uid_handling.copy_chown(directive.uid(), directive.gid());

        let meta = fs::symlink_metadata(&directive.src)?;
        if meta.is_dir() {
            copy_tree(&directive.src, &dest, chown)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_entry(&directive.src, &dest, chown)?;
        }
    }
    Ok(())
}

/// Recursively copy the *contents* of `src` into `dest`, preserving modes
/// and keeping symlinks as symlinks.
fn copy_tree(src: &Path, dest: &Path, chown: Option<(u32, u32)>) -> Result<()> {
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths beneath its root");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, fs::symlink_metadata(entry.path())?.permissions())?;
            if let Some((uid, gid)) = chown {
                lchown(&target, Some(uid), Some(gid))?;
            }
        } else {
            copy_entry(entry.path(), &target, chown)?;
        }
    }
    Ok(())
}

fn copy_entry(src: &Path, dest: &Path, chown: Option<(u32, u32)>) -> Result<()> {
    // Replace whatever is already there, like rsync would.
    if fs::symlink_metadata(dest).is_ok() {
        fs::remove_file(dest)?;
    }
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        symlink(fs::read_link(src)?, dest)?;
    } else {
        fs::copy(src, dest)?;
    }
    if let Some((uid, gid)) = chown {
        lchown(dest, Some(uid), Some(gid))?;
    }
    Ok(())
}

fn run_on_host(script: &str, content_dir: &Path) -> Result<()> {
    let mut child = Command::new("bash")
        .arg("-e")
        .current_dir(content_dir)
        .stdin(Stdio::piped())
        .spawn()?;
    let mut stdin = child.stdin.take().expect("stdin was requested above");
    stdin.write_all(script.as_bytes())?;
    drop(stdin);
    let status = child.wait()?;
    if !status.success() {
        return Err(Error::Subprocess {
            command: "bash -e".to_string(),
            status,
        });
    }
    Ok(())
}

fn run_in_container(
    attrs: &LayerDiffAttrs,
    script: &str,
    content_dir: &Path,
    runtime: &mut Runtime,
    source_date_epoch: u64,
) -> Result<()> {
    let base = match (&attrs.run_in_container_base, &attrs.run_in_container_base_diffs) {
        (Some(oci_dir), Some(diffs_dir)) => {
            let (_, config) = oci::load_manifest_and_config(oci_dir, &Platform::current()?)?;
            Some((config, diffs_dir.as_path()))
        }
        (Some(_), None) => return Err(Error::MissingBaseDiffs),
        (None, _) => None,
    };
    runtime.run(
        script,
        content_dir,
        base.as_ref().map(|(config, diffs)| (config, *diffs)),
        Some(source_date_epoch),
    )
}

fn pack(
    content_dir: &Path,
    out_dir: &Path,
    uid_handling: &UidHandling,
    source_date_epoch: u64,
) -> Result<()> {
    fs::create_dir_all(out_dir)?;
    let tar_file = fs::File::create(out_dir.join("diff.tar"))?;
    let mut writer = TarWriter::new(Sha256Writer::new(tar_file), source_date_epoch);
    writer.append_dir_contents(content_dir, uid_handling.pack_owner())?;
    let (digest, _tar_file) = writer.into_inner()?.finish();
    digest.write_to_file(&out_dir.join("digest"))
}

/// How file ownership is realised, chosen by privilege level.
#[derive(Debug, PartialEq, Eq)]
enum UidHandling {
    /// Running as root: chown staged files, pack ownership from the
    /// filesystem.
    Full,
    /// Unprivileged: ownership cannot be changed on disk, so every directive
    /// must agree on a single pair, stamped onto entries at pack time.
    Homogeneous { uid: u32, gid: u32 },
}

impl UidHandling {
    fn detect(attrs: &LayerDiffAttrs) -> Result<Self> {
        if nix::unistd::geteuid().is_root() {
            Ok(Self::Full)
        } else {
            Self::homogeneous(attrs)
        }
    }

    fn homogeneous(attrs: &LayerDiffAttrs) -> Result<Self> {
        let mut uids = BTreeSet::new();
        let mut gids = BTreeSet::new();
        for directive in &attrs.copy {
            uids.insert(directive.uid());
            gids.insert(directive.gid());
        }
        if attrs.run_on_host.is_some() {
            let uid = attrs.run_on_host_uid.unwrap_or(0);
            uids.insert(uid);
            gids.insert(attrs.run_on_host_gid.unwrap_or(uid));
        }
        if uids.len() > 1 {
            return Err(Error::ConflictingUids(uids.into_iter().collect()));
        }
        if gids.len() > 1 {
            return Err(Error::ConflictingGids(gids.into_iter().collect()));
        }
        Ok(Self::Homogeneous {
            uid: uids.into_iter().next().unwrap_or(0),
            gid: gids.into_iter().next().unwrap_or(0),
        })
    }

    /// Ownership applied to files as they are staged.
    fn copy_chown(&self, uid: u32, gid: u32) -> Option<(u32, u32)> {
        match self {
            Self::Full => Some((uid, gid)),
            // Already validated to match the single pair; stamped at pack
            // time instead.
            Self::Homogeneous { .. } => None,
        }
    }

    /// Ownership stamped on tar entries at pack time.
    fn pack_owner(&self) -> Owner {
        match self {
            Self::Full => Owner::FromSource,
            Self::Homogeneous { uid, gid } => Owner::Fixed {
                uid: u64::from(*uid),
                gid: u64::from(*gid),
            },
        }
    }
}
