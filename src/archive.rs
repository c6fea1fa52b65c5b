//! Deterministic tar archives.
//!
//! Given identical input trees and an identical mtime, the writer produces
//! bit-identical output: entries are sorted by name, owner and group are
//! numeric with blank name fields, and symbolic links are stored verbatim.

use crate::error::Result;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Ownership stamped on produced entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Entries carry the uid/gid of the source files.
    FromSource,
    /// Every entry is stamped with one numeric pair.
    Fixed { uid: u64, gid: u64 },
}

pub struct TarWriter<W: io::Write> {
    builder: tar::Builder<W>,
    mtime: u64,
}

impl<W: io::Write> TarWriter<W> {
    pub fn new(writer: W, mtime: u64) -> Self {
        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);
        Self { builder, mtime }
    }

    /// Append the tree at `src`, renaming its leading path component to
    /// `dest`. Both must be absolute; archive names are relative.
    pub fn append_tree(&mut self, src: &Path, dest: &Path, owner: Owner) -> Result<()> {
        let dest_rel = dest
            .strip_prefix("/")
            .map_err(|_| crate::error::Error::NotAbsolute(dest.to_path_buf()))?;
        for entry in WalkDir::new(src).sort_by_file_name() {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .expect("walkdir yields paths beneath its root");
            let name = if rel.as_os_str().is_empty() {
                dest_rel.to_path_buf()
            } else {
                dest_rel.join(rel)
            };
            self.append_path(entry.path(), &name, owner)?;
        }
        Ok(())
    }

    /// Append every entry beneath `dir`, named relative to it.
    pub fn append_dir_contents(&mut self, dir: &Path, owner: Owner) -> Result<()> {
        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            let name = entry
                .path()
                .strip_prefix(dir)
                .expect("walkdir yields paths beneath its root")
                .to_path_buf();
            self.append_path(entry.path(), &name, owner)?;
        }
        Ok(())
    }

    fn append_path(&mut self, fs_path: &Path, name: &Path, owner: Owner) -> Result<()> {
        let meta = fs::symlink_metadata(fs_path)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(self.mtime);
        header.set_mode(meta.permissions().mode() & 0o7777);
        let (uid, gid) = match owner {
            Owner::FromSource => (u64::from(meta.uid()), u64::from(meta.gid())),
            Owner::Fixed { uid, gid } => (uid, gid),
        };
        header.set_uid(uid);
        header.set_gid(gid);

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            let target = fs::read_link(fs_path)?;
            self.builder.append_link(&mut header, name, &target)?;
        } else if file_type.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            self.builder
                .append_data(&mut header, dir_name(name), io::empty())?;
        } else if meta.is_file() {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(meta.len());
            let file = fs::File::open(fs_path)?;
            self.builder.append_data(&mut header, name, file)?;
        } else {
            // FIFOs can legitimately appear in staged content.
            header.set_entry_type(tar::EntryType::Fifo);
            header.set_size(0);
            self.builder.append_data(&mut header, name, io::empty())?;
        }
        Ok(())
    }

    /// Write the trailing blocks and hand back the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.builder.finish()?;
        Ok(self.builder.into_inner()?)
    }
}

/// Directory entries conventionally carry a trailing slash.
fn dir_name(name: &Path) -> PathBuf {
    let mut s = OsString::from(name.as_os_str());
    s.push("/");
    PathBuf::from(s)
}
