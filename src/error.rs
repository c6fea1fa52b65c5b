use std::path::PathBuf;
use std::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid container image
    //
    #[error("document at {path} has unrecognised mediaType {media_type:?} (expected an index)")]
    NotAnIndex { path: PathBuf, media_type: String },
    #[error("blob {digest} referenced by index at {path} has unrecognised mediaType {media_type:?}")]
    UnrecognisedManifestRef {
        path: PathBuf,
        digest: String,
        media_type: String,
    },
    #[error("manifest at {path} has unrecognised mediaType {media_type:?}")]
    UnrecognisedManifest { path: PathBuf, media_type: String },
    #[error("blob {digest} referenced by manifest at {path} has unrecognised mediaType {media_type:?}")]
    UnrecognisedLayer {
        path: PathBuf,
        digest: String,
        media_type: String,
    },
    #[error("expected rootfs.type to be \"layers\" in {path}")]
    WrongRootfsType { path: PathBuf },
    #[error("missing or malformed {field:?} in image document")]
    MalformedDocument { field: &'static str },
    #[error("no gzip layer mediaType corresponds to manifest mediaType {0:?}")]
    NoLayerMediaType(String),
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    //
    // Platform selection
    //
    #[error("no manifest is suitable for desired platform")]
    NoMatchingManifest,
    #[error("multiple manifests are suitable for desired platform")]
    MultipleMatchingManifests,
    #[error("unsupported host machine type: {0}")]
    UnsupportedHostArch(&'static str),
    #[error("unsupported host operating system: {0}")]
    UnsupportedHostOs(&'static str),

    //
    // Inconsistent driver input
    //
    #[error("multiple UIDs referenced in copy/runOnHost arguments ({0:?}), but I am not running as root. This is an error in stamp's Nix logic.")]
    ConflictingUids(Vec<u32>),
    #[error("multiple GIDs referenced in copy/runOnHost arguments ({0:?}), but I am not running as root. This is an error in stamp's Nix logic.")]
    ConflictingGids(Vec<u32>),
    #[error("path {0} is not absolute")]
    NotAbsolute(PathBuf),
    #[error("a base image was given without its extracted diffs")]
    MissingBaseDiffs,
    #[error("dependency graph contains a cycle involving {0}")]
    DependencyCycle(String),
    #[error("{path} references {reference}, which is not part of the closure")]
    UnknownReference { path: String, reference: String },
    #[error("malformed registration data in {path}: {detail}")]
    MalformedRegistration { path: PathBuf, detail: String },

    //
    // Subprocess failure
    //
    #[error("command `{command}` exited with {status}")]
    Subprocess { command: String, status: ExitStatus },
    #[error(transparent)]
    Quote(#[from] shlex::QuoteError),

    //
    // System
    //
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("environment variable {0} is malformed")]
    MalformedEnv(&'static str),
    #[error("error mounting overlayfs at {mountpoint}: {source}")]
    Mount {
        mountpoint: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<walkdir::Error> for Error {
    fn from(e: walkdir::Error) -> Self {
        Self::Io(e.into())
    }
}
