//! QEMU invocation for an instrumented firmware image.
//!
//! [`QemuBuilder`] collects the session's choices and produces an
//! [`EmulatorSnapshot`]: an owned, immutable launch configuration that can be
//! executed, probed or exported as a script.

use crate::arch::Arch;
use crate::network::Transcript;
use crate::probe;
use crate::process::{shell_quote, Cmd};
use anyhow::Result;
use log::debug;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SERIAL_LOG_NAME: &str = "qemu.initial.serial.log";
pub const AUDIO_ENV: (&str, &str) = ("QEMU_AUDIO_DRV", "none");

/// Ports of the socket NICs attached when no TAP device is bound.
pub const SOCKET_PORTS: [u16; 4] = [2000, 2001, 2002, 2003];

const NAND_PARTS: &str = "64,64,64,64,64,64,64,64,64,64";

/// How the guest is attached to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Console on the controlling terminal.
    Interactive,
    /// No display; serial and monitor go to files/sockets in `log_dir`.
    Headless { log_dir: PathBuf },
}

/// Builder for emulator launches.
#[derive(Debug, Clone)]
pub struct QemuBuilder {
    arch: Arch,
    kernel: PathBuf,
    image: PathBuf,
    memory_mib: u32,
    taps: Vec<String>,
    mode: LaunchMode,
}

impl QemuBuilder {
    pub fn new(arch: Arch, kernel: &Path, image: &Path) -> Self {
        Self {
            arch,
            kernel: kernel.to_path_buf(),
            image: image.to_path_buf(),
            memory_mib: 1024,
            taps: Vec::new(),
            mode: LaunchMode::Interactive,
        }
    }

    pub fn memory_mib(mut self, memory_mib: u32) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    /// Attach one NIC per TAP device instead of the socket NICs.
    pub fn taps<I, S>(mut self, taps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.taps = taps.into_iter().map(Into::into).collect();
        self
    }

    pub fn headless(mut self, log_dir: &Path) -> Self {
        self.mode = LaunchMode::Headless {
            log_dir: log_dir.to_path_buf(),
        };
        self
    }

    pub fn interactive(mut self) -> Self {
        self.mode = LaunchMode::Interactive;
        self
    }

    pub fn build(self) -> EmulatorSnapshot {
        EmulatorSnapshot {
            arch: self.arch,
            kernel: self.kernel,
            image: self.image,
            memory_mib: self.memory_mib,
            taps: self.taps,
            mode: self.mode,
        }
    }
}

/// Owned launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmulatorSnapshot {
    arch: Arch,
    kernel: PathBuf,
    image: PathBuf,
    memory_mib: u32,
    taps: Vec<String>,
    mode: LaunchMode,
}

impl EmulatorSnapshot {
    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn kernel(&self) -> &Path {
        &self.kernel
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn mode(&self) -> &LaunchMode {
        &self.mode
    }

    pub fn taps(&self) -> &[String] {
        &self.taps
    }

    /// Serial log written by a headless launch.
    pub fn serial_log(&self) -> Option<PathBuf> {
        match &self.mode {
            LaunchMode::Headless { log_dir } => Some(log_dir.join(SERIAL_LOG_NAME)),
            LaunchMode::Interactive => None,
        }
    }

    /// Copy with bare kernel and image file names, launched interactively.
    pub fn for_export(&self) -> Self {
        let bare = |p: &Path| p.file_name().map(PathBuf::from).unwrap_or_else(|| p.to_path_buf());
        Self {
            kernel: bare(&self.kernel),
            image: bare(&self.image),
            mode: LaunchMode::Interactive,
            ..self.clone()
        }
    }

    fn net_groups(&self) -> Vec<Vec<String>> {
        let mips = self.arch.family().is_mips();
        let mut groups = Vec::new();

        if self.taps.is_empty() {
            for (i, port) in SOCKET_PORTS.iter().enumerate() {
                if mips {
                    groups.push(flag("-net", format!("nic,vlan={}", i)));
                    groups.push(flag("-net", format!("socket,vlan={},listen=:{}", i, port)));
                } else {
                    groups.push(flag("-device", format!("virtio-net-device,netdev=net{}", i)));
                    groups.push(flag("-netdev", format!("socket,listen=:{},id=net{}", port, i)));
                }
            }
        } else {
            for (i, tap) in self.taps.iter().enumerate() {
                if mips {
                    groups.push(flag("-net", format!("nic,vlan={}", i)));
                    groups.push(flag(
                        "-net",
                        format!("tap,vlan={},id=net{},ifname={},script=no", i, i, tap),
                    ));
                } else {
                    groups.push(flag("-device", format!("virtio-net-device,netdev=net{}", i)));
                    groups.push(flag(
                        "-netdev",
                        format!("tap,id=net{},ifname={},script=no", i, tap),
                    ));
                }
            }
        }
        groups
    }

    fn drive_groups(&self) -> Vec<Vec<String>> {
        let image = self.image.display();
        if self.arch.family().is_mips() {
            vec![flag("-drive", format!("if=ide,format=raw,file={}", image))]
        } else {
            vec![
                flag("-drive", format!("if=none,file={},format=raw,id=rootfs", image)),
                flag("-device", "virtio-blk-device,drive=rootfs"),
            ]
        }
    }

    fn kernel_cmdline(&self) -> String {
        let syscall = match self.mode {
            LaunchMode::Interactive => 0,
            LaunchMode::Headless { .. } => 1,
        };
        format!(
            "firmadyne.syscall={} root=/dev/sda1 console=ttyS0 nandsim.parts={} \
             rdinit=/firmadyne/preInit.sh rw debug ignore_loglevel print-fatal-signals=1",
            syscall, NAND_PARTS
        )
    }

    /// Arguments grouped per flag, in launch order.
    pub fn arg_groups(&self) -> Vec<Vec<String>> {
        let mut groups = vec![flag("-M", self.arch.board())];
        groups.extend(self.net_groups());
        groups.push(flag("-kernel", self.kernel.display().to_string()));
        groups.extend(self.drive_groups());
        groups.push(flag("-append", self.kernel_cmdline()));
        groups.push(flag("-m", self.memory_mib.to_string()));

        match &self.mode {
            LaunchMode::Interactive => groups.push(vec!["-nographic".to_string()]),
            LaunchMode::Headless { log_dir } => {
                let dir = log_dir.display();
                groups.push(flag("-serial", format!("file:{}/{}", dir, SERIAL_LOG_NAME)));
                groups.push(flag("-serial", format!("unix:{}/serial.S1,server,nowait", dir)));
                groups.push(flag("-monitor", format!("unix:{}/monitor,server,nowait", dir)));
                groups.push(flag("-display", "none"));
            }
        }
        groups
    }

    pub fn args(&self) -> Vec<String> {
        self.arg_groups().into_iter().flatten().collect()
    }

    /// TAP devices belong to root, so a TAP launch runs privileged.
    pub fn command(&self) -> Cmd {
        let cmd = Cmd::new(self.arch.qemu_binary())
            .env(AUDIO_ENV.0, AUDIO_ENV.1)
            .args(self.args());
        if self.taps.is_empty() && matches!(self.mode, LaunchMode::Headless { .. }) {
            cmd
        } else {
            cmd.sudo()
        }
    }

    /// The privileged launch as a multi-line shell command, one flag per line.
    pub fn script_lines(&self) -> String {
        let head = format!(
            "sudo {}={} {}",
            AUDIO_ENV.0,
            AUDIO_ENV.1,
            self.arch.qemu_binary()
        );
        let mut lines = vec![head];
        for group in self.arg_groups() {
            lines.push(
                group
                    .iter()
                    .map(|w| shell_quote(w))
                    .collect::<Vec<_>>()
                    .join(" "),
            );
        }
        lines.join(" \\\n    ")
    }
}

/// Launches emulator snapshots.
pub trait Hypervisor {
    /// Bounded headless boot; returns the captured kernel log.
    fn probe(&mut self, emulator: &EmulatorSnapshot, timeout: Duration) -> Result<Transcript>;

    /// Run attached to the terminal until the guest stops.
    fn run(&mut self, emulator: &EmulatorSnapshot) -> Result<()>;
}

/// The host's QEMU.
#[derive(Debug, Default)]
pub struct Qemu;

impl Hypervisor for Qemu {
    fn probe(&mut self, emulator: &EmulatorSnapshot, timeout: Duration) -> Result<Transcript> {
        probe::capture_boot_log(emulator, timeout)
    }

    fn run(&mut self, emulator: &EmulatorSnapshot) -> Result<()> {
        // any way the guest stops counts as a finished run
        let status = emulator.command().allow_fail().run_interactive()?;
        debug!("emulator exited: {}", status);
        Ok(())
    }
}

fn flag(name: &str, value: impl Into<String>) -> Vec<String> {
    vec![name.to_string(), value.into()]
}
