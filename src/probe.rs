//! Bounded boot used to capture the guest's kernel log.

use crate::emulator::EmulatorSnapshot;
use crate::network::Transcript;
use crate::process::Cmd;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The parts of a running process the deadline loop needs.
trait Supervised {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> std::io::Result<()>;
    fn wait(&mut self) -> std::io::Result<ExitStatus>;
}

impl Supervised for Child {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        Child::kill(self)
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        Child::wait(self)
    }
}

/// Run `cmd` for at most `timeout`, killing it at the deadline.
///
/// Returns the exit status if the process ended by itself, `None` if it was
/// killed.
pub fn run_bounded(cmd: &Cmd, timeout: Duration) -> Result<Option<ExitStatus>> {
    let mut child = cmd
        .spawn_detached()
        .with_context(|| format!("Failed to start {}", cmd.program()))?;
    supervise(&mut child, cmd.program(), timeout)
}

fn supervise(
    child: &mut dyn Supervised,
    program: &str,
    timeout: Duration,
) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {}
            Err(e) => {
                stop(child, program);
                return Err(e).with_context(|| format!("Failed to poll {}", program));
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }

    stop(child, program);
    Ok(None)
}

fn stop(child: &mut dyn Supervised, program: &str) {
    if let Err(e) = child.kill() {
        debug!("killing {}: {}", program, e);
    }
    if let Err(e) = child.wait() {
        debug!("reaping {}: {}", program, e);
    }
}

/// Lossy read of a serial log; a missing log is an empty transcript.
pub fn read_transcript(path: &Path) -> Result<Transcript> {
    match fs::read(path) {
        Ok(bytes) => Ok(Transcript::from_text(&String::from_utf8_lossy(&bytes))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("no serial log at {}", path.display());
            Ok(Transcript::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Boot `emulator` headless for at most `timeout` and return its kernel log.
pub fn capture_boot_log(emulator: &EmulatorSnapshot, timeout: Duration) -> Result<Transcript> {
    let Some(log_path) = emulator.serial_log() else {
        bail!("boot probe needs a headless emulator");
    };
    if log_path.exists() {
        fs::remove_file(&log_path)
            .with_context(|| format!("Failed to remove stale {}", log_path.display()))?;
    }

    info!("probing boot for {}s", timeout.as_secs());
    match run_bounded(&emulator.command(), timeout)? {
        None => debug!("probe deadline reached, guest stopped"),
        Some(status) => debug!("emulator exited before the deadline: {}", status),
    }

    let transcript = read_transcript(&log_path)?;
    debug!("captured {} log lines", transcript.len());
    Ok(transcript)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::QemuBuilder;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn test_deadline_kills_process() {
        let start = Instant::now();
        let status = run_bounded(&Cmd::new("sleep").arg("30"), Duration::from_millis(300)).unwrap();
        assert!(status.is_none());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_early_exit_is_reported() {
        let status = run_bounded(&Cmd::new("false"), Duration::from_secs(10)).unwrap();
        assert!(!status.unwrap().success());
    }

    #[derive(Default)]
    struct Unpollable {
        killed: bool,
        reaped: bool,
    }

    impl Supervised for Unpollable {
        fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
            Err(std::io::Error::new(ErrorKind::Other, "wait failed"))
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.killed = true;
            Ok(())
        }

        fn wait(&mut self) -> std::io::Result<ExitStatus> {
            self.reaped = true;
            Command::new("true").status()
        }
    }

    #[test]
    fn test_poll_error_still_kills_process() {
        let mut child = Unpollable::default();
        let err = supervise(&mut child, "qemu-system-mips", Duration::from_secs(10)).unwrap_err();
        assert!(err.to_string().contains("qemu-system-mips"), "{}", err);
        assert!(child.killed);
        assert!(child.reaped);
    }

    #[test]
    fn test_spawn_failure_is_error() {
        let cmd = Cmd::new("definitely_not_a_real_emulator_12345");
        assert!(run_bounded(&cmd, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_read_transcript_lossy_and_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("serial.log");
        fs::write(&path, b"[0.1] firmadyne: ok\n\xff\xfegarbage\n").unwrap();
        let t = read_transcript(&path).unwrap();
        assert_eq!(t.lines().next(), Some("ok"));

        let missing = read_transcript(&temp.path().join("none.log")).unwrap();
        assert_eq!(missing.len(), 0);
    }

    #[test]
    fn test_probe_requires_headless() {
        let snap = QemuBuilder::new(
            "arm".parse().unwrap(),
            Path::new("zImage.arm"),
            Path::new("image.raw"),
        )
        .build();
        assert!(capture_boot_log(&snap, Duration::from_secs(1)).is_err());
    }
}
