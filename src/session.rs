//! One emulation session: the image, its architecture, the discovered
//! network and the work directory they live in.
//!
//! A session starts empty and becomes configured once an image and an
//! architecture are known, either by building an image with
//! [`Session::make_image`] or by adopting an existing one. Every operation
//! that needs an image fails with [`Error::NoImage`] before that.

use crate::arch::{Arch, ArchDetector, Endianness};
use crate::archive::RootfsArchive;
use crate::config::{require_asset, Config};
use crate::emulator::{EmulatorSnapshot, Hypervisor, Qemu, QemuBuilder};
use crate::error::{kind_of, Error, ErrorKind, Stage};
use crate::export::{self, ExportOptions};
use crate::image::{self, edit, ImageRecipe, Instrumentation, IMAGE_NAME};
use crate::mount::MountManager;
use crate::network::{CommandRunner, HostRunner, NetworkPlan, TapBinding};
use crate::preflight;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Deleted before the second probe so the guest cannot reboot itself out of
/// the capture window.
pub const REBOOT_GUEST_PATH: &str = "/sbin/reboot";

/// Host-facing collaborators of a session.
pub struct Backends {
    pub mounts: MountManager,
    pub runner: Box<dyn CommandRunner>,
    pub hypervisor: Box<dyn Hypervisor>,
    /// Check host tools before each operation.
    pub preflight: bool,
}

impl Backends {
    pub fn host() -> Self {
        Self {
            mounts: MountManager::host(),
            runner: Box::new(HostRunner),
            hypervisor: Box::new(Qemu),
            preflight: true,
        }
    }
}

/// Result of [`Session::ensure_network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOutcome {
    /// Found on the first probe.
    Discovered,
    /// Found after forcing networking in the image.
    Forced,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub arch: Option<String>,
    pub endianness: Option<Endianness>,
    pub image: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    pub mount_point: Option<PathBuf>,
    pub forced_network: bool,
    pub network: Vec<TapBinding>,
    pub work_dir: PathBuf,
}

impl SessionStatus {
    pub fn guest_ips(&self) -> Vec<Ipv4Addr> {
        self.network.iter().map(|b| b.guest_ip).collect()
    }
}

pub struct Session {
    config: Config,
    // declared before work_dir: mounts live inside it and must go first
    mounts: MountManager,
    runner: Box<dyn CommandRunner>,
    hypervisor: Box<dyn Hypervisor>,
    preflight: bool,
    arch: Option<Arch>,
    image: Option<PathBuf>,
    network: NetworkPlan,
    forced_network: bool,
    work_dir: TempDir,
}

impl Session {
    /// Session against the host's block devices, network tools and QEMU.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_backends(config, Backends::host())
    }

    pub fn with_backends(config: Config, backends: Backends) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("fw-emulator-")
            .tempdir()
            .context("Failed to create session work directory")?;
        debug!("session work directory {}", work_dir.path().display());

        Ok(Self {
            config,
            mounts: backends.mounts,
            runner: backends.runner,
            hypervisor: backends.hypervisor,
            preflight: backends.preflight,
            arch: None,
            image: None,
            network: NetworkPlan::default(),
            forced_network: false,
            work_dir,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn arch(&self) -> Option<Arch> {
        self.arch
    }

    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    pub fn network(&self) -> &NetworkPlan {
        &self.network
    }

    pub fn forced_network(&self) -> bool {
        self.forced_network
    }

    fn configured(&self) -> Result<(Arch, PathBuf)> {
        match (self.arch, &self.image) {
            (Some(arch), Some(image)) => Ok((arch, image.clone())),
            _ => Err(Error::NoImage.into()),
        }
    }

    fn image_path(&self) -> Result<PathBuf> {
        self.image.clone().ok_or_else(|| Error::NoImage.into())
    }

    /// Extract `archive` into a fresh image and make it the session image.
    pub fn make_image(
        &mut self,
        archive: &dyn RootfsArchive,
        detector: &dyn ArchDetector,
    ) -> Result<PathBuf> {
        if self.preflight {
            preflight::check_image_tools()?;
        }

        let arch = detector
            .detect(archive.source())
            .map_err(|e| Error::pipeline(Stage::DetectArch, e))?
            .ok_or_else(|| {
                Error::pipeline(
                    Stage::DetectArch,
                    anyhow!("no architecture found in {}", archive.source().display()),
                )
            })?;
        info!("architecture: {} ({} endian)", arch, arch.endianness());

        require_asset(&self.config.kernel_path(&arch))?;
        let fix_script = self.config.fix_image_script();
        require_asset(&fix_script)?;
        let recipe = ImageRecipe {
            archive,
            instrumentation: Instrumentation::from_config(&self.config, &arch)?,
            busybox: self.config.busybox_path()?,
            fix_script,
            size_bytes: self.config.image_size_bytes,
        };

        // the rebuild overwrites the previous image, so it stops being usable here
        self.mounts.release_all();
        self.clear_image();
        let image = self.work_dir.path().join(IMAGE_NAME);
        image::build_image(&mut self.mounts, &recipe, &image, self.work_dir.path())?;

        self.arch = Some(arch);
        self.image = Some(image.clone());
        Ok(image)
    }

    fn clear_image(&mut self) {
        self.arch = None;
        self.image = None;
        self.network = NetworkPlan::default();
        self.forced_network = false;
    }

    /// Use an image built earlier.
    pub fn adopt_image(&mut self, image: &Path, arch: Arch) -> Result<()> {
        if !image.is_file() {
            return Err(Error::MissingLocalFile(image.to_path_buf()).into());
        }
        self.mounts.release_all();
        self.arch = Some(arch);
        self.image = Some(image.to_path_buf());
        self.network = NetworkPlan::default();
        self.forced_network = false;
        info!("using image {} ({})", image.display(), arch);
        Ok(())
    }

    fn emulator(&self, arch: Arch, image: &Path) -> QemuBuilder {
        QemuBuilder::new(arch, &self.config.kernel_path(&arch), image)
            .memory_mib(self.config.memory_mib)
    }

    fn run_snapshot(&self) -> Result<EmulatorSnapshot> {
        let (arch, image) = self.configured()?;
        Ok(self
            .emulator(arch, &image)
            .taps(self.network.bindings().iter().map(|b| b.tap.clone()))
            .interactive()
            .build())
    }

    /// Booting a mounted image would write to a filesystem the host also
    /// has open.
    fn ensure_unmounted(&self, image: &Path) -> Result<()> {
        match self.mounts.handle(image) {
            Some(handle) => Err(Error::AlreadyMounted {
                image: image.to_path_buf(),
                mount_point: handle.mount_point.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Probe the guest's boot and derive TAP bindings from its kernel log.
    ///
    /// Returns `false` when no interface was found; the previous plan is
    /// kept in that case.
    pub fn setup_network(&mut self) -> Result<bool> {
        let (arch, image) = self.configured()?;
        self.ensure_unmounted(&image)?;
        if self.preflight {
            preflight::check_emulator(&arch)?;
        }
        require_asset(&self.config.kernel_path(&arch))?;

        let probe = self
            .emulator(arch, &image)
            .headless(self.work_dir.path())
            .build();
        let transcript = self.hypervisor.probe(&probe, self.config.probe_timeout)?;

        let plan = NetworkPlan::from_transcript(
            &transcript,
            arch.endianness(),
            self.config.tap_index_base,
        );
        if plan.is_empty() {
            info!("no network interface found in {} log lines", transcript.len());
            return Ok(false);
        }
        for binding in plan.bindings() {
            info!(
                "found {} at {} (host {} on {})",
                binding.guest_device,
                binding.guest_ip,
                binding.host_ip,
                binding.host_net_dev()
            );
        }
        self.network = plan;
        Ok(true)
    }

    /// Make the guest configure its interfaces at boot.
    pub fn force_network(&mut self) -> Result<()> {
        let script = self.config.force_network_script();
        require_asset(&script)?;
        let touched = self.edit(|root| edit::force_networking(root, &script))?;
        debug!("force_network.sh launched from pre-init and {} rcS files", touched);
        self.forced_network = true;
        Ok(())
    }

    /// Probe; if nothing is found, force networking, drop the guest's
    /// reboot binary and probe once more.
    pub fn ensure_network(&mut self) -> Result<NetworkOutcome> {
        if self.setup_network()? {
            return Ok(NetworkOutcome::Discovered);
        }

        info!("initial network discovery failed, forcing networking");
        self.force_network()?;
        match self.del_file(REBOOT_GUEST_PATH) {
            Ok(()) => {}
            Err(e) if kind_of(&e) == ErrorKind::OperatorInput => {
                debug!("{}", e);
            }
            Err(e) => return Err(e),
        }

        if self.setup_network()? {
            Ok(NetworkOutcome::Forced)
        } else {
            Ok(NetworkOutcome::Failed)
        }
    }

    /// Bring the network up, run the guest on this terminal, tear down.
    pub fn run(&mut self) -> Result<()> {
        let (arch, image) = self.configured()?;
        self.ensure_unmounted(&image)?;
        if self.preflight {
            preflight::check_emulator(&arch)?;
            if !self.network.is_empty() {
                preflight::check_network_tools()?;
            }
        }
        let emulator = self.run_snapshot()?;

        if self.network.is_empty() {
            warn!("no network configured; attaching socket NICs only");
        }
        self.network.start(self.runner.as_mut())?;
        let _network = NetworkUp {
            plan: &self.network,
            runner: self.runner.as_mut(),
        };
        let _sigint = SigintShield::install();

        self.hypervisor.run(&emulator)
    }

    /// Run `body` on the image's root: the live mount when one exists,
    /// otherwise a scoped mount.
    fn edit<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let image = self.image_path()?;
        if let Some(handle) = self.mounts.handle(&image) {
            let root = handle.mount_point.clone();
            return body(&root);
        }
        self.mounts
            .with_mount(&image, self.work_dir.path(), |handle| body(&handle.mount_point))
    }

    pub fn add_file(&mut self, local: &Path, target: &str) -> Result<()> {
        if !local.exists() {
            return Err(Error::MissingLocalFile(local.to_path_buf()).into());
        }
        self.edit(|root| edit::add_file(root, local, target))?;
        Ok(())
    }

    pub fn del_file(&mut self, target: &str) -> Result<()> {
        self.edit(|root| edit::del_file(root, target))
    }

    /// Returns the number of files rewritten.
    pub fn remove_root_passwd(&mut self) -> Result<usize> {
        self.edit(edit::remove_root_passwd)
    }

    /// Returns the number of inittab files rewritten.
    pub fn force_tty_login(&mut self) -> Result<usize> {
        self.edit(edit::replace_tty_login)
    }

    /// Add a TAP binding by hand.
    pub fn add_network(
        &mut self,
        guest_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
        guest_device: &str,
        vlan_id: Option<u16>,
    ) -> Result<TapBinding> {
        self.configured()?;
        if let Some(existing) = self.network.bindings().iter().find(|b| b.guest_ip == guest_ip) {
            warn!("{} is already bound to {}", guest_ip, existing.tap);
        }
        let index = self.network.next_index(self.config.tap_index_base);
        let binding = TapBinding::new(index, guest_device, guest_ip, host_ip, vlan_id);
        info!("added {} for {} (host {})", binding.tap, guest_ip, host_ip);
        self.network.push(binding.clone());
        Ok(binding)
    }

    /// Write a standalone runner script into `dir`.
    pub fn export(&self, dir: &Path, options: &ExportOptions) -> Result<PathBuf> {
        let emulator = self.run_snapshot()?;
        if !options.script_only {
            require_asset(emulator.kernel())?;
        }
        export::export(&emulator, &self.network, dir, options)
    }

    /// Mount the image until [`Session::unmount`]; returns the mount point.
    pub fn mount(&mut self) -> Result<PathBuf> {
        let image = self.image_path()?;
        if self.preflight {
            preflight::check_image_tools()?;
        }
        let handle = self.mounts.mount(&image, self.work_dir.path())?;
        info!("{} mounted at {}", image.display(), handle.mount_point.display());
        Ok(handle.mount_point)
    }

    pub fn unmount(&mut self) -> Result<()> {
        let image = self.image_path()?;
        self.mounts.unmount(&image)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            arch: self.arch.map(|a| a.to_string()),
            endianness: self.arch.map(|a| a.endianness()),
            image: self.image.clone(),
            kernel: self.arch.map(|a| self.config.kernel_path(&a)),
            mount_point: self
                .image
                .as_deref()
                .and_then(|image| self.mounts.handle(image))
                .map(|h| h.mount_point.clone()),
            forced_network: self.forced_network,
            network: self.network.bindings().to_vec(),
            work_dir: self.work_dir.path().to_path_buf(),
        }
    }
}

/// Tears the network down when the run ends, however it ends.
struct NetworkUp<'a> {
    plan: &'a NetworkPlan,
    runner: &'a mut dyn CommandRunner,
}

impl Drop for NetworkUp<'_> {
    fn drop(&mut self) {
        info!("stopping network");
        self.plan.stop(self.runner);
    }
}

extern "C" fn on_sigint(_: libc::c_int) {}

/// Keeps Ctrl-C from killing the controller while the guest owns the
/// terminal. A caught signal reverts to the default in exec'd children, so
/// the emulator still sees it.
struct SigintShield {
    previous: libc::sighandler_t,
}

impl SigintShield {
    fn install() -> Self {
        let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: the handler is async-signal-safe (it does nothing).
        let previous = unsafe { libc::signal(libc::SIGINT, handler) };
        Self { previous }
    }
}

impl Drop for SigintShield {
    fn drop(&mut self) {
        if self.previous != libc::SIG_ERR {
            // SAFETY: restores the disposition saved by `install`.
            unsafe {
                libc::signal(libc::SIGINT, self.previous);
            }
        }
    }
}
