//! Preflight checks for host tools.
//!
//! Each session operation shells out to a handful of host programs. Checking
//! them up front turns a half-built image into a clear "install X" message.
//!
//! # Example
//!
//! ```rust,ignore
//! use fw_emulator::preflight::{check_required_tools, IMAGE_TOOLS};
//!
//! if let Err(e) = check_required_tools(IMAGE_TOOLS) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::arch::{Arch, CpuFamily};
use crate::process;
use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Tools used to build and edit images.
///
/// Each tuple is (command_name, package_name).
pub const IMAGE_TOOLS: &[(&str, &str)] = &[
    ("fdisk", "fdisk"),
    ("kpartx", "kpartx"),
    ("losetup", "util-linux"),
    ("mkfs.ext2", "e2fsprogs"),
    ("mount", "mount"),
    ("umount", "mount"),
    ("chown", "coreutils"),
    ("chroot", "coreutils"),
];

/// Tools used to create and remove TAP/VLAN devices.
pub const NETWORK_TOOLS: &[(&str, &str)] = &[("tunctl", "uml-utilities"), ("ip", "iproute2")];

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool with its package.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// The emulator binary for `arch`.
pub fn check_emulator(arch: &Arch) -> Result<()> {
    let package = match arch.family() {
        CpuFamily::MipsEl | CpuFamily::MipsEb => "qemu-system-mips",
        CpuFamily::Arm => "qemu-system-arm",
    };
    check_required_tools(&[(arch.qemu_binary(), package)])
}

pub fn check_image_tools() -> Result<()> {
    check_required_tools(IMAGE_TOOLS)
}

pub fn check_network_tools() -> Result<()> {
    check_required_tools(NETWORK_TOOLS)
}
