//! Target-platform descriptor for the module under transformation.
//!
//! Transforms consult the triple to decide which detection steps apply: the
//! inline-hook detector only runs for AArch64, the inlined trap response only
//! for Darwin on AArch64, and the Objective-C method verification only for
//! Apple-vendor targets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instruction-set family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Arch {
    Aarch64,
    X86_64,
    #[default]
    Unknown,
}

/// Platform vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Vendor {
    Apple,
    Pc,
    #[default]
    Unknown,
}

/// Operating-system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Os {
    /// Darwin-derived systems (macOS, iOS and friends).
    Darwin,
    Linux,
    Windows,
    #[default]
    Unknown,
}

/// An `arch-vendor-os` target triple.
///
/// Parsing is permissive the way linker triples are: unrecognized components
/// map to `Unknown` rather than failing, and detection steps that depend on
/// them simply do not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Triple {
    pub arch: Arch,
    pub vendor: Vendor,
    pub os: Os,
}

impl Triple {
    pub const fn new(arch: Arch, vendor: Vendor, os: Os) -> Self {
        Self { arch, vendor, os }
    }

    pub const fn is_aarch64(&self) -> bool {
        matches!(self.arch, Arch::Aarch64)
    }

    pub const fn is_darwin(&self) -> bool {
        matches!(self.os, Os::Darwin)
    }

    pub const fn is_apple_vendor(&self) -> bool {
        matches!(self.vendor, Vendor::Apple)
    }

    /// Short architecture name used for cache keying and logging.
    pub const fn arch_name(&self) -> &'static str {
        match self.arch {
            Arch::Aarch64 => "aarch64",
            Arch::X86_64 => "x86_64",
            Arch::Unknown => "unknown",
        }
    }

    /// Short OS name used for cache keying and logging.
    pub const fn os_name(&self) -> &'static str {
        match self.os {
            Os::Darwin => "darwin",
            Os::Linux => "linux",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        }
    }
}

impl FromStr for Triple {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let arch = match parts.next().unwrap_or("") {
            "aarch64" | "arm64" => Arch::Aarch64,
            "x86_64" | "amd64" => Arch::X86_64,
            _ => Arch::Unknown,
        };
        let vendor = match parts.next().unwrap_or("") {
            "apple" => Vendor::Apple,
            "pc" => Vendor::Pc,
            _ => Vendor::Unknown,
        };
        let os = match parts.next().unwrap_or("") {
            s if s.starts_with("darwin") || s.starts_with("macos") || s.starts_with("ios") => {
                Os::Darwin
            }
            s if s.starts_with("linux") => Os::Linux,
            s if s.starts_with("windows") => Os::Windows,
            _ => Os::Unknown,
        };
        Ok(Self { arch, vendor, os })
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vendor = match self.vendor {
            Vendor::Apple => "apple",
            Vendor::Pc => "pc",
            Vendor::Unknown => "unknown",
        };
        write!(f, "{}-{}-{}", self.arch_name(), vendor, self.os_name())
    }
}
