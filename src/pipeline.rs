//! Streaming digest and compression plumbing.
//!
//! Diffs and blobs are digested while the bytes are produced. The gzip
//! stream embeds neither filename nor timestamp, keeping compressed output
//! reproducible across hosts.

use crate::digest::Digest;
use crate::error::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Writer adapter that hashes everything passing through it.
pub struct Sha256Writer<W> {
    inner: W,
    hasher: Sha256,
}

impl<W> Sha256Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Finish hashing, returning the digest and the underlying writer.
    pub fn finish(self) -> (Digest, W) {
        let hash = self.hasher.finalize();
        (Digest::from_sha256_hash(&hash), self.inner)
    }
}

impl<W: Write> Write for Sha256Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compress `diff_tar` into `<blob_dir>/blob.tar.gz`, writing the blob's
/// digest alongside it and returning it.
pub fn compress_blob(diff_tar: &Path, blob_dir: &Path) -> Result<Digest> {
    fs::create_dir_all(blob_dir)?;
    let blob_file = fs::File::create(blob_dir.join("blob.tar.gz"))?;
    let mut encoder = GzEncoder::new(Sha256Writer::new(blob_file), Compression::default());
    let mut input = fs::File::open(diff_tar)?;
    io::copy(&mut input, &mut encoder)?;
    let (digest, _blob_file) = encoder.finish()?.finish();
    digest.write_to_file(&blob_dir.join("digest"))?;
    Ok(digest)
}

/// Streaming sha256 of an existing file.
pub fn digest_file(path: &Path) -> Result<Digest> {
    let mut input = fs::File::open(path)?;
    let mut writer = Sha256Writer::new(io::sink());
    io::copy(&mut input, &mut writer)?;
    let (digest, _) = writer.finish();
    Ok(digest)
}

#[derive(Debug, Deserialize)]
pub struct LayerBlobAttrs {
    pub diff: PathBuf,
    pub outputs: LayerBlobOutputs,
}

#[derive(Debug, Deserialize)]
pub struct LayerBlobOutputs {
    pub out: PathBuf,
}

/// The `layer-blob` sub-command: compress an already-built diff.
pub fn run(attrs: LayerBlobAttrs) -> Result<()> {
    compress_blob(&attrs.diff.join("diff.tar"), &attrs.outputs.out)?;
    Ok(())
}
