//! Loop device and mount lifecycle.
//!
//! A disk image is only ever touched between `attach` + `mount` and the
//! matching `unmount` + `detach`. [`MountManager::with_mount`] pairs the two
//! structurally: the release runs when the body returns, fails or panics.
//!
//! Each image has at most one live mount. The manager keeps an in-process
//! table of handles and an exclusive lock file beside the image, so a second
//! process trying to mount the same image gets `AlreadyMounted` too.

use crate::error::{kind_of, Error, ErrorKind, Stage};
use crate::image;
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Mount point name under the session work directory.
pub const MOUNT_DIR_NAME: &str = "file_system";

const RELEASE_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Host primitives for mapping and mounting an image.
pub trait BlockDevices {
    /// Map the image's partitions; returns the first partition's device.
    fn attach(&mut self, image: &Path) -> Result<PathBuf>;
    fn detach(&mut self, image: &Path) -> Result<()>;
    /// Create a fresh filesystem on a mapped partition.
    fn format(&mut self, device: &Path) -> Result<()>;
    fn mount(&mut self, device: &Path, mount_point: &Path) -> Result<()>;
    fn unmount(&mut self, mount_point: &Path) -> Result<()>;
    /// Hand `dir` back to the invoking user.
    fn grant_access(&mut self, dir: &Path) -> Result<()>;
    /// Host mappings still referencing `image`, one description per entry.
    fn attached(&mut self, image: &Path) -> Result<Vec<String>>;
}

/// `kpartx`, `mount`, `umount`, `chown` and `losetup` on the host.
#[derive(Debug, Default)]
pub struct HostBlockDevices;

impl HostBlockDevices {
    fn busy_or_fail(cmd: Cmd, device: &Path, what: &str) -> Result<()> {
        let result = cmd.allow_fail().run()?;
        if result.success() {
            return Ok(());
        }
        if result.stderr.contains("busy") {
            return Err(Error::DeviceBusy {
                device: device.display().to_string(),
            }
            .into());
        }
        bail!("{} failed: {}", what, result.stderr.trim());
    }
}

impl BlockDevices for HostBlockDevices {
    fn attach(&mut self, image: &Path) -> Result<PathBuf> {
        let result = Cmd::new("kpartx")
            .args(["-a", "-s", "-v"])
            .arg_path(image)
            .sudo()
            .error_msg("kpartx failed to map image partitions")
            .run()?;
        parse_kpartx_device(&result.stdout)
            .with_context(|| format!("no partition mapped for {}", image.display()))
    }

    fn detach(&mut self, image: &Path) -> Result<()> {
        let cmd = Cmd::new("kpartx").arg("-d").arg_path(image).sudo();
        Self::busy_or_fail(cmd, image, "kpartx -d")
    }

    fn format(&mut self, device: &Path) -> Result<()> {
        image::format_partition(device)
    }

    fn mount(&mut self, device: &Path, mount_point: &Path) -> Result<()> {
        Cmd::new("mount")
            .arg_path(device)
            .arg_path(mount_point)
            .sudo()
            .error_msg("mount failed")
            .run()?;
        Ok(())
    }

    fn unmount(&mut self, mount_point: &Path) -> Result<()> {
        let cmd = Cmd::new("umount").arg_path(mount_point).sudo();
        Self::busy_or_fail(cmd, mount_point, "umount")
    }

    fn grant_access(&mut self, dir: &Path) -> Result<()> {
        // SAFETY: getuid/getgid have no preconditions and cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Cmd::new("chown")
            .arg("-R")
            .arg(format!("{}:{}", uid, gid))
            .arg_path(dir)
            .sudo()
            .error_msg("chown of work directory failed")
            .run()?;
        Ok(())
    }

    fn attached(&mut self, image: &Path) -> Result<Vec<String>> {
        let result = Cmd::new("losetup")
            .arg("-j")
            .arg_path(image)
            .sudo()
            .allow_fail()
            .run()?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

/// `add map loop0p1 (253:0): 0 2095104 linear 7:0 2048` → `/dev/mapper/loop0p1`
fn parse_kpartx_device(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .find_map(|line| line.split_whitespace().nth(2))
        .map(|name| Path::new("/dev/mapper").join(name))
}

/// A live mapping and mount of one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub image: PathBuf,
    pub device: PathBuf,
    pub mount_point: PathBuf,
}

/// Exclusive lock file beside the image, holding the mount point.
#[derive(Debug)]
struct ImageLock {
    file: File,
    path: PathBuf,
}

impl ImageLock {
    fn path_for(image: &Path) -> PathBuf {
        let mut name = image
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        image.with_file_name(name)
    }

    fn acquire(image: &Path, mount_point: &Path) -> Result<Self> {
        let path = Self::path_for(image);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            return Err(Error::AlreadyMounted {
                image: image.to_path_buf(),
                mount_point: if holder.is_empty() {
                    PathBuf::from("<another process>")
                } else {
                    PathBuf::from(holder)
                },
            }
            .into());
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", mount_point.display())?;
        Ok(Self { file, path })
    }
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

struct LiveMount {
    handle: MountHandle,
    _lock: ImageLock,
}

/// Tracks every live mount and guarantees its release.
pub struct MountManager {
    devices: Box<dyn BlockDevices>,
    live: BTreeMap<PathBuf, LiveMount>,
    retry_delay: Duration,
}

impl MountManager {
    pub fn new(devices: Box<dyn BlockDevices>) -> Self {
        Self {
            devices,
            live: BTreeMap::new(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn host() -> Self {
        Self::new(Box::new(HostBlockDevices))
    }

    /// Delay between release attempts; multiplied by the attempt number.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn is_mounted(&self, image: &Path) -> bool {
        self.live.contains_key(image)
    }

    pub fn handle(&self, image: &Path) -> Option<&MountHandle> {
        self.live.get(image).map(|live| &live.handle)
    }

    /// Run `body` with the image mounted, releasing it on every exit path.
    pub fn with_mount<T, F>(&mut self, image: &Path, work_dir: &Path, body: F) -> Result<T>
    where
        F: FnOnce(&MountHandle) -> Result<T>,
    {
        self.scoped(image, work_dir, false, body)
    }

    /// Like [`MountManager::with_mount`], formatting the partition first.
    pub fn with_fresh_mount<T, F>(&mut self, image: &Path, work_dir: &Path, body: F) -> Result<T>
    where
        F: FnOnce(&MountHandle) -> Result<T>,
    {
        self.scoped(image, work_dir, true, body)
    }

    fn scoped<T, F>(&mut self, image: &Path, work_dir: &Path, format: bool, body: F) -> Result<T>
    where
        F: FnOnce(&MountHandle) -> Result<T>,
    {
        let handle = self.acquire(image, work_dir, format)?;
        let mut guard = MountGuard {
            manager: self,
            image: handle.image.clone(),
            armed: true,
        };

        let outcome = body(&handle);
        let released = guard.release();

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("releasing {} after failure: {:#}", image.display(), release_err);
                Err(e)
            }
        }
    }

    /// Mount until [`MountManager::unmount`] is called.
    pub fn mount(&mut self, image: &Path, work_dir: &Path) -> Result<MountHandle> {
        self.acquire(image, work_dir, false)
    }

    pub fn unmount(&mut self, image: &Path) -> Result<()> {
        if !self.live.contains_key(image) {
            return Err(Error::NotMounted(image.to_path_buf()).into());
        }
        self.release(image)
    }

    /// Release every live mount, logging failures.
    pub fn release_all(&mut self) {
        let images: Vec<PathBuf> = self.live.keys().cloned().collect();
        for image in images {
            if let Err(e) = self.release(&image) {
                warn!("failed to release {}: {:#}", image.display(), e);
            }
        }
    }

    fn acquire(&mut self, image: &Path, work_dir: &Path, format: bool) -> Result<MountHandle> {
        if let Some(live) = self.live.get(image) {
            return Err(Error::AlreadyMounted {
                image: image.to_path_buf(),
                mount_point: live.handle.mount_point.clone(),
            }
            .into());
        }

        let mount_point = work_dir.join(MOUNT_DIR_NAME);
        let lock = ImageLock::acquire(image, &mount_point)?;
        fs::create_dir_all(&mount_point)
            .with_context(|| format!("Failed to create mount point {}", mount_point.display()))?;

        let device = self.devices.attach(image)?;
        debug!("{} mapped to {}", image.display(), device.display());

        if format {
            if let Err(e) = self.devices.format(&device) {
                self.detach_quietly(image);
                return Err(Error::pipeline(Stage::Format, e).into());
            }
        }

        if let Err(e) = self.devices.mount(&device, &mount_point) {
            self.detach_quietly(image);
            return Err(e);
        }
        if let Err(e) = self.devices.grant_access(work_dir) {
            if let Err(unmount_err) = self.devices.unmount(&mount_point) {
                warn!("unmounting {}: {:#}", mount_point.display(), unmount_err);
            }
            self.detach_quietly(image);
            return Err(e);
        }

        let handle = MountHandle {
            image: image.to_path_buf(),
            device,
            mount_point,
        };
        info!("mounted {} at {}", image.display(), handle.mount_point.display());
        self.live.insert(
            image.to_path_buf(),
            LiveMount {
                handle: handle.clone(),
                _lock: lock,
            },
        );
        Ok(handle)
    }

    fn detach_quietly(&mut self, image: &Path) {
        if let Err(e) = self.devices.detach(image) {
            warn!("detaching {}: {:#}", image.display(), e);
        }
    }

    fn release(&mut self, image: &Path) -> Result<()> {
        let Some(live) = self.live.remove(image) else {
            return Ok(());
        };
        let handle = &live.handle;

        let unmounted = self.retry_transient(|devices| devices.unmount(&handle.mount_point));
        let detached = self.retry_transient(|devices| devices.detach(&handle.image));

        match self.devices.attached(image) {
            Ok(leftover) if !leftover.is_empty() => {
                warn!(
                    "{} still has host mappings after release: {}",
                    image.display(),
                    leftover.join("; ")
                );
            }
            Ok(_) => debug!("released {}", image.display()),
            Err(e) => debug!("could not query mappings for {}: {:#}", image.display(), e),
        }

        unmounted.and(detached)
    }

    fn retry_transient<F>(&mut self, mut op: F) -> Result<()>
    where
        F: FnMut(&mut dyn BlockDevices) -> Result<()>,
    {
        let mut attempt = 1;
        loop {
            match op(self.devices.as_mut()) {
                Ok(()) => return Ok(()),
                Err(e) if kind_of(&e) == ErrorKind::Transient && attempt < RELEASE_ATTEMPTS => {
                    debug!("attempt {} failed: {:#}; retrying", attempt, e);
                    thread::sleep(self.retry_delay * attempt);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Releases the scoped mount if the body unwinds.
struct MountGuard<'a> {
    manager: &'a mut MountManager,
    image: PathBuf,
    armed: bool,
}

impl MountGuard<'_> {
    fn release(&mut self) -> Result<()> {
        self.armed = false;
        self.manager.release(&self.image)
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            if let Err(e) = self.manager.release(&self.image) {
                warn!("failed to release {}: {:#}", self.image.display(), e);
            }
        }
    }
}
