//! The media types stamp recognises when reading and rewriting images.

pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// In-toto attestations masquerade as layers in some registries' manifests.
pub const IN_TOTO: &str = "application/vnd.in-toto+json";

pub fn is_index(media_type: &str) -> bool {
    media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
}

pub fn is_manifest(media_type: &str) -> bool {
    media_type == OCI_MANIFEST || media_type == DOCKER_MANIFEST
}

pub fn is_gzip_layer(media_type: &str) -> bool {
    media_type == OCI_LAYER_GZIP || media_type == DOCKER_LAYER_GZIP
}

/// The gzip layer mediaType belonging to the same family as a manifest's own
/// mediaType. Layer records appended to a manifest must match its flavour.
pub fn gzip_layer_for_manifest(manifest_media_type: &str) -> Option<&'static str> {
    match manifest_media_type {
        OCI_MANIFEST => Some(OCI_LAYER_GZIP),
        DOCKER_MANIFEST => Some(DOCKER_LAYER_GZIP),
        _ => None,
    }
}
