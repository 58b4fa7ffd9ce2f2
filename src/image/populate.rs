//! Filling a mounted image: rootfs, instrumentation, guest-side fix-ups.

use crate::archive::RootfsArchive;
use crate::arch::Arch;
use crate::config::{require_asset, Config};
use crate::process::Cmd;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const FIRMADYNE_DIR: &str = "firmadyne";
pub const CONSOLE_GUEST_PATH: &str = "firmadyne/console";
pub const NVRAM_GUEST_PATH: &str = "firmadyne/libnvram.so";
pub const PRE_INIT_GUEST_PATH: &str = "firmadyne/preInit.sh";

const FIRMADYNE_DIRS: &[&str] = &[
    FIRMADYNE_DIR,
    "firmadyne/libnvram",
    "firmadyne/libnvram.override",
];

const BUSYBOX_STAGED: &str = "busybox";
const FIX_SCRIPT_STAGED: &str = "fixImage.sh";

/// Executable for every principal, still readable.
pub const GUEST_EXEC_MODE: u32 = 0o755;

/// Host-side instrumentation artifacts for one architecture.
#[derive(Debug, Clone)]
pub struct Instrumentation {
    pub console: PathBuf,
    pub nvram: PathBuf,
    pub pre_init: PathBuf,
}

impl Instrumentation {
    pub fn from_config(config: &Config, arch: &Arch) -> Result<Self> {
        let inst = Self {
            console: config.console_path(arch),
            nvram: config.nvram_path(arch),
            pre_init: config.pre_init_script(),
        };
        for asset in [&inst.console, &inst.nvram, &inst.pre_init] {
            require_asset(asset)?;
        }
        Ok(inst)
    }
}

/// Extract the rootfs and create the firmadyne directories.
pub fn populate(root: &Path, archive: &dyn RootfsArchive) -> Result<()> {
    archive.extract_to(root)?;
    make_firmadyne_dirs(root)
}

/// Idempotent.
pub fn make_firmadyne_dirs(root: &Path) -> Result<()> {
    for dir in FIRMADYNE_DIRS {
        fs::create_dir_all(root.join(dir))?;
    }
    Ok(())
}

/// Copy `src` to `root/guest_path` and mark it executable.
pub fn install_executable(root: &Path, src: &Path, guest_path: &str) -> Result<PathBuf> {
    let dst = root.join(guest_path.trim_start_matches('/'));
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, &dst)
        .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    fs::set_permissions(&dst, fs::Permissions::from_mode(GUEST_EXEC_MODE))?;
    Ok(dst)
}

pub fn inject_instrumentation(root: &Path, inst: &Instrumentation) -> Result<()> {
    install_executable(root, &inst.console, CONSOLE_GUEST_PATH)?;
    install_executable(root, &inst.nvram, NVRAM_GUEST_PATH)?;
    install_executable(root, &inst.pre_init, PRE_INIT_GUEST_PATH)?;
    Ok(())
}

/// Run the fix-up script inside the guest root via `chroot`.
pub fn patch_filesystem(root: &Path, busybox: &Path, fix_script: &Path) -> Result<()> {
    patch_filesystem_with(root, busybox, fix_script, |root| {
        Cmd::new("chroot")
            .arg_path(root)
            .args([
                format!("/{}", BUSYBOX_STAGED),
                "ash".to_string(),
                format!("/{}", FIX_SCRIPT_STAGED),
            ])
            .sudo()
            .error_msg("fixImage.sh failed inside the guest root")
            .run()?;
        Ok(())
    })
}

/// Stage busybox and the fix-up script, run `fix`, then remove both staged
/// files whatever the outcome.
pub fn patch_filesystem_with<F>(
    root: &Path,
    busybox: &Path,
    fix_script: &Path,
    fix: F,
) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let mut staged = Staged::default();
    staged.push(install_executable(root, busybox, BUSYBOX_STAGED)?);
    staged.push(install_executable(root, fix_script, FIX_SCRIPT_STAGED)?);

    debug!("running guest fix-up in {}", root.display());
    fix(root)
}

/// Removes staged files on drop.
#[derive(Default)]
struct Staged(Vec<PathBuf>);

impl Staged {
    fn push(&mut self, path: PathBuf) {
        self.0.push(path);
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        for path in &self.0 {
            if let Err(e) = fs::remove_file(path) {
                warn!("removing staged {}: {}", path.display(), e);
            }
        }
    }
}
