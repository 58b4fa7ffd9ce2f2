//! Architecture descriptor for emulated firmware.
//!
//! The descriptor is produced outside this crate (ELF inspection of the
//! extracted rootfs) and only consumed here: it picks the emulator binary,
//! board model, kernel and instrumentation binaries, and the byte order used
//! to decode kernel log words.

use crate::error::Error;
use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuFamily {
    MipsEl,
    MipsEb,
    Arm,
}

impl CpuFamily {
    /// Suffix used by the prebuilt kernel and instrumentation binaries.
    pub fn tag(self) -> &'static str {
        match self {
            CpuFamily::MipsEl => "mipsel",
            CpuFamily::MipsEb => "mipseb",
            CpuFamily::Arm => "arm",
        }
    }

    pub fn is_mips(self) -> bool {
        matches!(self, CpuFamily::MipsEl | CpuFamily::MipsEb)
    }
}

/// Immutable `{family, endianness}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Arch {
    family: CpuFamily,
    endianness: Endianness,
}

impl Arch {
    /// MIPS families carry their byte order in the name, so a mismatch is
    /// rejected. ARM accepts either.
    pub fn new(family: CpuFamily, endianness: Endianness) -> Result<Self> {
        let consistent = match family {
            CpuFamily::MipsEl => endianness == Endianness::Little,
            CpuFamily::MipsEb => endianness == Endianness::Big,
            CpuFamily::Arm => true,
        };
        if !consistent {
            return Err(Error::UnsupportedArch(format!("{}/{:?}", family.tag(), endianness)).into());
        }
        Ok(Self { family, endianness })
    }

    pub fn family(&self) -> CpuFamily {
        self.family
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn qemu_binary(&self) -> &'static str {
        match self.family {
            CpuFamily::MipsEl => "qemu-system-mipsel",
            CpuFamily::MipsEb => "qemu-system-mips",
            CpuFamily::Arm => "qemu-system-arm",
        }
    }

    pub fn board(&self) -> &'static str {
        if self.family.is_mips() {
            "malta"
        } else {
            "virt"
        }
    }

    pub fn kernel_name(&self) -> String {
        if self.family.is_mips() {
            format!("vmlinux.{}", self.family.tag())
        } else {
            format!("zImage.{}", self.family.tag())
        }
    }

    pub fn console_name(&self) -> String {
        format!("console.{}", self.family.tag())
    }

    pub fn nvram_name(&self) -> String {
        format!("libnvram.so.{}", self.family.tag())
    }
}

impl FromStr for Arch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (family, endianness) = match s.trim().to_ascii_lowercase().as_str() {
            "mipsel" => (CpuFamily::MipsEl, Endianness::Little),
            "mipseb" | "mips" => (CpuFamily::MipsEb, Endianness::Big),
            "arm" | "armel" => (CpuFamily::Arm, Endianness::Little),
            "armeb" => (CpuFamily::Arm, Endianness::Big),
            _ => return Err(Error::UnsupportedArch(s.to_string()).into()),
        };
        Arch::new(family, endianness)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family.tag())
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endianness::Big => f.write_str("big"),
            Endianness::Little => f.write_str("little"),
        }
    }
}

/// Architecture detection collaborator.
///
/// Implementations inspect the extracted root filesystem archive and return
/// `Ok(None)` when nothing conclusive was found.
pub trait ArchDetector {
    fn detect(&self, rootfs_archive: &Path) -> Result<Option<Arch>>;
}

/// Detector for callers that already know the architecture.
pub struct FixedArch(pub Arch);

impl ArchDetector for FixedArch {
    fn detect(&self, _rootfs_archive: &Path) -> Result<Option<Arch>> {
        Ok(Some(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        let arch: Arch = "mipsel".parse().unwrap();
        assert_eq!(arch.family(), CpuFamily::MipsEl);
        assert_eq!(arch.endianness(), Endianness::Little);

        let arch: Arch = "mipseb".parse().unwrap();
        assert_eq!(arch.endianness(), Endianness::Big);
        assert_eq!(arch.qemu_binary(), "qemu-system-mips");

        let arch: Arch = "arm".parse().unwrap();
        assert_eq!(arch.board(), "virt");
        assert!("sparc".parse::<Arch>().is_err());
    }

    #[test]
    fn test_binary_names_follow_family() {
        let mips: Arch = "mipseb".parse().unwrap();
        assert_eq!(mips.kernel_name(), "vmlinux.mipseb");
        assert_eq!(mips.console_name(), "console.mipseb");
        assert_eq!(mips.nvram_name(), "libnvram.so.mipseb");

        let arm: Arch = "arm".parse().unwrap();
        assert_eq!(arm.kernel_name(), "zImage.arm");
        assert_eq!(arm.board(), "virt");
    }

    #[test]
    fn test_mips_endianness_must_match_family() {
        assert!(Arch::new(CpuFamily::MipsEl, Endianness::Big).is_err());
        assert!(Arch::new(CpuFamily::MipsEb, Endianness::Big).is_ok());
        assert!(Arch::new(CpuFamily::Arm, Endianness::Big).is_ok());
    }
}
