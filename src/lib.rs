//! Build-time composition, mutation, and repackaging of OCI container
//! images from discrete layer diffs, in a fully reproducible way.
//!
//! stamp is driven by an outer build system that hands it a JSON attribute
//! record naming inputs and outputs; each invocation performs one closed
//! transformation:
//!
//! - [`packing`] partitions a store-path dependency graph into size-bounded
//!   layer groups.
//! - [`layer_diff`] materializes file trees from copy directives and
//!   host-side or containerised scripts into a deterministic diff tar.
//! - [`patch`] appends layers to an existing image and rewrites its
//!   index/manifest/config triple with fresh digests.
//! - [`runtime`] assembles a writable root from a stack of layer diffs with
//!   overlayfs and executes a script inside fresh namespaces.
//!
//! There is no inter-invocation state; everything an invocation produces
//! lands in its output directories.

pub mod archive;
pub mod error;
pub mod extract_diffs;
pub mod layer;
pub mod layer_diff;
pub mod media_types;
pub mod oci;
pub mod packing;
pub mod patch;
pub mod pipeline;
pub mod platform;
pub mod runtime;

mod digest;

pub use digest::Digest;

use crate::error::{Error, Result};

/// The timestamp stamped into every produced archive entry, taken from the
/// conventional `SOURCE_DATE_EPOCH` environment variable.
pub fn source_date_epoch() -> Result<u64> {
    let value =
        std::env::var("SOURCE_DATE_EPOCH").map_err(|_| Error::MissingEnv("SOURCE_DATE_EPOCH"))?;
    value
        .parse()
        .map_err(|_| Error::MalformedEnv("SOURCE_DATE_EPOCH"))
}
