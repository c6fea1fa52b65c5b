use crate::error::{Error, Result};
use oci_spec::image::{Arch, Os};

/// The host platform in OCI nomenclature.
///
/// stamp stamps a single host architecture per invocation; synthesising
/// images for foreign platforms is not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub arch: Arch,
    pub os: Os,
}

impl Platform {
    pub fn current() -> Result<Self> {
        let arch = match std::env::consts::ARCH {
            "x86_64" => Arch::Amd64,
            other => return Err(Error::UnsupportedHostArch(other)),
        };
        let os = match std::env::consts::OS {
            "linux" => Os::Linux,
            other => return Err(Error::UnsupportedHostOs(other)),
        };
        Ok(Self { arch, os })
    }
}
