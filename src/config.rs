//! Emulator configuration.
//!
//! Read from TOML, resolved in this order: explicit path, `FW_EMULATOR_CONFIG`,
//! `<config dir>/fw-emulator/config.toml`, built-in defaults. The assets
//! directory can always be overridden with `FW_EMULATOR_ASSETS`.
//!
//! ```toml
//! assets_dir = "/opt/fw-emulator"
//! image_size_mib = 1024
//! probe_timeout_secs = 60
//! memory_mib = 1024
//! tap_index_base = 0
//! busybox = "/usr/bin/busybox"
//! ```

use crate::arch::Arch;
use crate::error::Error;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "FW_EMULATOR_CONFIG";
pub const ASSETS_ENV: &str = "FW_EMULATOR_ASSETS";

const DEFAULT_IMAGE_SIZE_MIB: u64 = 1024;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MEMORY_MIB: u32 = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root holding `binaries/` and `scripts/`.
    pub assets_dir: PathBuf,
    pub image_size_bytes: u64,
    pub probe_timeout: Duration,
    pub memory_mib: u32,
    /// First TAP index handed out; concurrent sessions need disjoint ranges.
    pub tap_index_base: u32,
    pub busybox: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    assets_dir: Option<PathBuf>,
    image_size_mib: Option<u64>,
    probe_timeout_secs: Option<u64>,
    memory_mib: Option<u32>,
    tap_index_base: Option<u32>,
    busybox: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("."),
            image_size_bytes: DEFAULT_IMAGE_SIZE_MIB * 1024 * 1024,
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            memory_mib: DEFAULT_MEMORY_MIB,
            tap_index_base: 0,
            busybox: None,
        }
    }
}

impl Config {
    /// Load the configuration, falling back to defaults when no file exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .or_else(|| {
                    dirs::config_dir()
                        .map(|dir| dir.join("fw-emulator").join("config.toml"))
                        .filter(|path| path.is_file())
                }),
        };

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(assets) = env::var_os(ASSETS_ENV) {
            config.assets_dir = PathBuf::from(assets);
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config '{}'", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Failed to parse config '{}'", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text)?;
        let defaults = Self::default();

        let config = Self {
            assets_dir: parsed.assets_dir.unwrap_or(defaults.assets_dir),
            image_size_bytes: parsed
                .image_size_mib
                .map(|mib| mib * 1024 * 1024)
                .unwrap_or(defaults.image_size_bytes),
            probe_timeout: parsed
                .probe_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_timeout),
            memory_mib: parsed.memory_mib.unwrap_or(defaults.memory_mib),
            tap_index_base: parsed.tap_index_base.unwrap_or(defaults.tap_index_base),
            busybox: parsed.busybox,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image_size_bytes == 0 {
            bail!("image_size_mib must be greater than zero");
        }
        if self.probe_timeout.is_zero() {
            bail!("probe_timeout_secs must be greater than zero");
        }
        if self.memory_mib == 0 {
            bail!("memory_mib must be greater than zero");
        }
        Ok(())
    }

    pub fn binaries_dir(&self) -> PathBuf {
        self.assets_dir.join("binaries")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.assets_dir.join("scripts")
    }

    pub fn kernel_path(&self, arch: &Arch) -> PathBuf {
        self.binaries_dir().join(arch.kernel_name())
    }

    pub fn console_path(&self, arch: &Arch) -> PathBuf {
        self.binaries_dir().join(arch.console_name())
    }

    pub fn nvram_path(&self, arch: &Arch) -> PathBuf {
        self.binaries_dir().join(arch.nvram_name())
    }

    pub fn pre_init_script(&self) -> PathBuf {
        self.scripts_dir().join("preInit.sh")
    }

    pub fn fix_image_script(&self) -> PathBuf {
        self.scripts_dir().join("fixImage.sh")
    }

    pub fn force_network_script(&self) -> PathBuf {
        self.scripts_dir().join("force_network.sh")
    }

    /// Statically linked busybox staged into the guest for the fix-up chroot.
    pub fn busybox_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.busybox {
            return Ok(path.clone());
        }
        which::which("busybox")
            .map_err(|_| Error::MissingAsset(PathBuf::from("busybox")).into())
    }
}

/// Fail early with a typed error when an asset file is missing.
pub fn require_asset(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(Error::MissingAsset(path.to_path_buf()).into());
    }
    Ok(())
}
