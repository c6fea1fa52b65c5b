//! Sandboxed execution of a script inside an assembled image root.
//!
//! The base image's diffs are extracted lazily and stacked with overlayfs,
//! with the build's staging directory as the writable top layer. The script
//! then runs inside fresh namespaces, chrooted into the assembled root.

use crate::digest::Digest;
use crate::error::{Error, Result};
use nix::mount::{mount, umount, MsFlags};
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Overlayfs rejects mounts with more lower directories than this; found by
/// experimentation.
const MAX_LOWERDIRS_PER_OVERLAY: usize = 28;

pub struct Runtime {
    tmp_root: PathBuf,
    next_tmp: u64,
    diff_extract_dirs: HashMap<String, PathBuf>,
}

impl Runtime {
    pub fn new(tmp_root: PathBuf) -> Result<Self> {
        fs::create_dir(&tmp_root)?;
        Ok(Self {
            tmp_root,
            next_tmp: 0,
            diff_extract_dirs: HashMap::new(),
        })
    }

    fn next_tmp_dir(&mut self) -> Result<PathBuf> {
        let dir = self.tmp_root.join(self.next_tmp.to_string());
        self.next_tmp += 1;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Extract the diff named by `digest` into a scratch directory, at most
    /// once per runtime instance.
    pub fn extract_diff(&mut self, diffs_dir: &Path, digest: &str) -> Result<PathBuf> {
        if let Some(dir) = self.diff_extract_dirs.get(digest) {
            return Ok(dir.clone());
        }
        let tarball = diffs_dir.join(Digest::new(digest)?.as_path_fraction());
        let dir = self.next_tmp_dir()?;
        log::info!("extracting {} to {}", tarball.display(), dir.display());
        let mut archive = tar::Archive::new(fs::File::open(&tarball)?);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.unpack(&dir)?;
        self.diff_extract_dirs.insert(digest.to_string(), dir.clone());
        Ok(dir)
    }

    fn overlay_mounted(
        &mut self,
        cleanup: &mut CleanupStack,
        lowerdirs: &[PathBuf],
        upperdir: Option<&Path>,
        read_only: bool,
        volatile: bool,
    ) -> Result<PathBuf> {
        let mut data = OsString::from("lowerdir=");
        for (i, dir) in lowerdirs.iter().enumerate() {
            if i > 0 {
                data.push(":");
            }
            data.push(dir);
        }
        if let Some(upperdir) = upperdir {
            let workdir = self.next_tmp_dir()?;
            data.push(",upperdir=");
            data.push(upperdir);
            data.push(",workdir=");
            data.push(&workdir);
        }
        if volatile {
            data.push(",volatile");
        }
        let mut flags = MsFlags::empty();
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }

        let mountpoint = self.next_tmp_dir()?;
        log::info!(
            "mounting overlay at {} with options {}",
            mountpoint.display(),
            data.to_string_lossy(),
        );
        if let Err(errno) = mount(
            Some("overlay"),
            &mountpoint,
            Some("overlay"),
            flags,
            Some(data.as_os_str()),
        ) {
            // The interesting diagnostics for a refused overlay mount are
            // kernel-side.
            dump_kernel_ring_buffer();
            return Err(Error::Mount {
                mountpoint,
                source: errno.into(),
            });
        }
        cleanup.push_unmount(mountpoint.clone());
        Ok(mountpoint)
    }

    /// Assemble the image's layer stack (topmost layer first, as overlayfs
    /// orders its lower directories) under a single mountpoint, with
    /// `upperdir` as the writable top layer if given.
    ///
    /// When the stack exceeds the overlay arity cap, windows of layers are
    /// collapsed bottom-up into read-only intermediate mounts, which then
    /// stand in for their windows in the next round.
    pub fn mount_image(
        &mut self,
        cleanup: &mut CleanupStack,
        config: &Value,
        diffs_dir: &Path,
        upperdir: Option<&Path>,
    ) -> Result<PathBuf> {
        let diff_ids = config
            .pointer("/rootfs/diff_ids")
            .and_then(Value::as_array)
            .ok_or(Error::MalformedDocument {
                field: "rootfs.diff_ids",
            })?;
        let mut current_tier = Vec::with_capacity(diff_ids.len());
        for diff_id in diff_ids.iter().rev() {
            let diff_id = diff_id.as_str().ok_or(Error::MalformedDocument {
                field: "rootfs.diff_ids",
            })?;
            current_tier.push(self.extract_diff(diffs_dir, diff_id)?);
        }

        let mut next_tier: Vec<PathBuf> = Vec::new();
        while current_tier.len() + next_tier.len() > MAX_LOWERDIRS_PER_OVERLAY {
            let group_size = (MAX_LOWERDIRS_PER_OVERLAY + 1).min(current_tier.len());
            let window = current_tier.split_off(current_tier.len() - group_size);
            let (window_top, window_lowers) = window
                .split_first()
                .expect("group_size is at least one");
            if window_lowers.is_empty() {
                // A single-layer window needs no collapsing.
                next_tier.insert(0, window_top.clone());
            } else {
                let mountpoint = self.overlay_mounted(
                    cleanup,
                    window_lowers,
                    Some(window_top.as_path()),
                    true,
                    false,
                )?;
                next_tier.insert(0, mountpoint);
            }
            if current_tier.is_empty() {
                current_tier = std::mem::take(&mut next_tier);
            }
        }

        current_tier.extend(next_tier);
        self.overlay_mounted(
            cleanup,
            &current_tier,
            upperdir,
            upperdir.is_none(),
            upperdir.is_some(),
        )
    }

    /// Execute `script` in a root assembled from the base image (if any)
    /// with `layer_content_dir` as the writable top layer.
    pub fn run(
        &mut self,
        script: &str,
        layer_content_dir: &Path,
        base: Option<(&Value, &Path)>,
        source_date_epoch: Option<u64>,
    ) -> Result<()> {
        let mut cleanup = CleanupStack::default();
        let root_fs = match base {
            Some((config, diffs_dir)) => {
                self.mount_image(&mut cleanup, config, diffs_dir, Some(layer_content_dir))?
            }
            None => layer_content_dir.to_path_buf(),
        };

        for subdir in ["dev", "proc", "sys"] {
            let path = root_fs.join(subdir);
            if fs::symlink_metadata(&path).is_err() {
                fs::create_dir_all(&path)?;
                cleanup.push_remove_dir(path);
            }
        }

        let env = container_env(base.map(|(config, _)| config), source_date_epoch);
        let inner_script = namespaced_script(&root_fs, &env, script)?;

        let mut command = Command::new("unshare");
        command
            .arg("-imnpuf")
            .arg("--mount-proc")
            .arg("sh")
            .arg("-euc")
            .arg(&inner_script);
        log::info!("running {command:?}");
        let status = command.status()?;
        if !status.success() {
            return Err(Error::Subprocess {
                command: format!("unshare -imnpuf --mount-proc sh -euc {inner_script}"),
                status,
            });
        }
        Ok(())
    }
}

/// The environment for the containerised script: the image config's `Env`
/// entries, with explicitly forwarded variables in front.
fn container_env(config: Option<&Value>, source_date_epoch: Option<u64>) -> Vec<String> {
    let mut env: Vec<String> = config
        .and_then(|c| c.pointer("/config/Env"))
        .and_then(Value::as_array)
        .map(|array| {
            array
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if let Some(epoch) = source_date_epoch {
        env.insert(0, format!("SOURCE_DATE_EPOCH={epoch}"));
    }
    env
}

/// The shell snippet executed inside the fresh namespaces: rbind the host's
/// device and kernel filesystems into the new root, then chroot and run the
/// payload under `sh -euc` with a scrubbed environment.
fn namespaced_script(root_fs: &Path, env: &[String], script: &str) -> Result<String> {
    let root = quote(&root_fs.to_string_lossy())?;
    let env_words = env
        .iter()
        .map(|entry| quote(entry))
        .collect::<Result<Vec<String>>>()?
        .join(" ");
    let payload = quote(script)?;
    Ok(format!(
        "for x in dev proc sys; do mount --rbind /$x {root}/$x; done\n\
         exec env --ignore-environment {env_words} \"$(type -p chroot)\" {root} sh -euc {payload}",
    ))
}

fn quote(word: &str) -> Result<String> {
    Ok(shlex::try_quote(word)?.into_owned())
}

fn dump_kernel_ring_buffer() {
    match Command::new("dmesg").output() {
        Ok(output) => log::error!(
            "kernel ring buffer after failed mount:\n{}",
            String::from_utf8_lossy(&output.stdout),
        ),
        Err(e) => log::error!("failed to run dmesg: {e}"),
    }
}

/// Cleanup actions applied in LIFO order on every exit path.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<CleanupAction>,
}

enum CleanupAction {
    Unmount(PathBuf),
    RemoveDir(PathBuf),
}

impl CleanupStack {
    fn push_unmount(&mut self, mountpoint: PathBuf) {
        self.actions.push(CleanupAction::Unmount(mountpoint));
    }

    fn push_remove_dir(&mut self, path: PathBuf) {
        self.actions.push(CleanupAction::RemoveDir(path));
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        while let Some(action) = self.actions.pop() {
            match action {
                CleanupAction::Unmount(mountpoint) => {
                    if let Err(e) = umount(&mountpoint) {
                        log::error!("failed to unmount {}: {}", mountpoint.display(), e);
                    }
                }
                CleanupAction::RemoveDir(path) => {
                    if let Err(e) = fs::remove_dir(&path) {
                        log::debug!("failed to remove {}: {}", path.display(), e);
                    }
                }
            }
        }
    }
}
