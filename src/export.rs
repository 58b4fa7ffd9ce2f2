//! Standalone reproduction scripts.
//!
//! The script brings the network up, runs the emulator on the terminal and
//! tears the network down again. Kernel and image are referenced by bare file
//! name, so the script is run from the directory holding them.

use crate::emulator::{EmulatorSnapshot, AUDIO_ENV};
use crate::network::NetworkPlan;
use anyhow::{Context, Result};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

pub const DEFAULT_SCRIPT_NAME: &str = "runner.sh";
pub const CHECKSUMS_NAME: &str = "SHA256SUMS";

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub script_name: String,
    /// Only write the script; kernel and image are not copied.
    pub script_only: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            script_only: false,
        }
    }
}

/// `<firmware file name>_runner_[forced_].sh`, written next to the firmware by
/// the one-shot workflow.
pub fn runner_script_name(firmware: &Path, forced: bool) -> String {
    let name = firmware
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firmware".to_string());
    format!("{}_runner_{}.sh", name, if forced { "forced_" } else { "" })
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn push_commands(out: &mut String, lines: impl IntoIterator<Item = String>) {
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
}

/// Render the script for `emulator` (already converted with
/// [`EmulatorSnapshot::for_export`]).
pub fn render_script(emulator: &EmulatorSnapshot, plan: &NetworkPlan) -> String {
    let mut out = String::from("#!/bin/bash\n");
    out.push_str(&format!("# Generated by fw-emulator {}\n", timestamp()));
    out.push_str("cd \"$(dirname \"$0\")\" || exit 1\n");

    out.push_str("\n# Networking\n");
    push_commands(&mut out, plan.bring_up_commands().iter().map(|c| c.shell_line()));

    out.push_str("\n# Emulating\n");
    out.push_str(&format!("export {}={}\n", AUDIO_ENV.0, AUDIO_ENV.1));
    out.push_str(&emulator.script_lines());
    out.push('\n');

    out.push_str("\n# Stop networking\n");
    push_commands(&mut out, plan.tear_down_commands().iter().map(|c| c.shell_line()));
    out
}

fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// True when `dst` already is `src`, e.g. exporting into the work directory.
fn same_file(src: &Path, dst: &Path) -> Result<bool> {
    if !dst.exists() {
        return Ok(false);
    }
    let src = fs::canonicalize(src)
        .with_context(|| format!("Failed to resolve {}", src.display()))?;
    let dst = fs::canonicalize(dst)
        .with_context(|| format!("Failed to resolve {}", dst.display()))?;
    Ok(src == dst)
}

fn copy_artifacts(emulator: &EmulatorSnapshot, dir: &Path) -> Result<()> {
    let mut sums = String::new();
    for src in [emulator.kernel(), emulator.image()] {
        let name = src
            .file_name()
            .with_context(|| format!("{} has no file name", src.display()))?;
        let dst = dir.join(name);
        if same_file(src, &dst)? {
            debug!("{} already in {}", src.display(), dir.display());
        } else {
            fs::copy(src, &dst).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), dir.display())
            })?;
        }
        sums.push_str(&format!("{}  {}\n", sha256_file(&dst)?, name.to_string_lossy()));
    }
    fs::write(dir.join(CHECKSUMS_NAME), sums)?;
    Ok(())
}

/// Write the script (and optionally kernel, image and checksums) to `dir`.
pub fn export(
    emulator: &EmulatorSnapshot,
    plan: &NetworkPlan,
    dir: &Path,
    options: &ExportOptions,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    if !options.script_only {
        copy_artifacts(emulator, dir)?;
    }

    let script = dir.join(&options.script_name);
    fs::write(&script, render_script(&emulator.for_export(), plan))
        .with_context(|| format!("Failed to write {}", script.display()))?;
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

    info!("exported runner to {}", script.display());
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::QemuBuilder;
    use crate::network::TapBinding;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn fixture(dir: &Path) -> (EmulatorSnapshot, NetworkPlan) {
        let kernel = dir.join("vmlinux.mipseb");
        let image = dir.join("work/image.raw");
        fs::create_dir_all(dir.join("work")).unwrap();
        fs::write(&kernel, b"kernel").unwrap();
        fs::write(&image, b"image").unwrap();

        let plan = NetworkPlan::new(vec![TapBinding::new(
            0,
            "eth0",
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
            None,
        )]);
        let snap = QemuBuilder::new("mipseb".parse().unwrap(), &kernel, &image)
            .taps(["tap_0"])
            .headless(&dir.join("work"))
            .build();
        (snap, plan)
    }

    #[test]
    fn test_sections_in_order_with_bare_names() {
        let temp = TempDir::new().unwrap();
        let (snap, plan) = fixture(temp.path());

        let script = render_script(&snap.for_export(), &plan);
        let net = script.find("# Networking").unwrap();
        let emu = script.find("# Emulating").unwrap();
        let stop = script.find("# Stop networking").unwrap();
        assert!(net < emu && emu < stop);

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("-kernel vmlinux.mipseb"));
        assert!(script.contains("file=image.raw"));
        assert!(!script.contains(&temp.path().display().to_string()));
        assert!(script[net..emu].contains("sudo tunctl -t tap_0 -u root"));
        assert!(script[stop..].contains("sudo tunctl -d tap_0"));
        assert!(script.contains("-nographic"));
    }

    #[test]
    fn test_export_copies_artifacts_with_checksums() {
        let temp = TempDir::new().unwrap();
        let (snap, plan) = fixture(temp.path());
        let out = temp.path().join("export");

        let script = export(&snap, &plan, &out, &ExportOptions::default()).unwrap();

        assert_eq!(script, out.join(DEFAULT_SCRIPT_NAME));
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(out.join("image.raw").is_file());
        let sums = fs::read_to_string(out.join(CHECKSUMS_NAME)).unwrap();
        assert!(sums.contains("  vmlinux.mipseb\n"));
        assert!(sums.contains("  image.raw\n"));
    }

    #[test]
    fn test_script_only_export() {
        let temp = TempDir::new().unwrap();
        let (snap, _plan) = fixture(temp.path());
        let out = temp.path().join("export");
        let options = ExportOptions {
            script_name: "fw_runner_forced_.sh".into(),
            script_only: true,
        };

        let script = export(&snap, &NetworkPlan::default(), &out, &options).unwrap();
        assert!(script.ends_with("fw_runner_forced_.sh"));
        assert!(!out.join("image.raw").exists());

        let text = fs::read_to_string(script).unwrap();
        assert!(text.contains("# Networking\n\n# Emulating"));
    }

    #[test]
    fn test_export_into_image_directory_keeps_image() {
        let temp = TempDir::new().unwrap();
        let (snap, plan) = fixture(temp.path());
        let work = temp.path().join("work");

        export(&snap, &plan, &work, &ExportOptions::default()).unwrap();

        assert_eq!(fs::read(work.join("image.raw")).unwrap(), b"image");
        assert_eq!(fs::read(work.join("vmlinux.mipseb")).unwrap(), b"kernel");
        assert_eq!(fs::read(temp.path().join("vmlinux.mipseb")).unwrap(), b"kernel");
        let sums = fs::read_to_string(work.join(CHECKSUMS_NAME)).unwrap();
        assert!(sums.contains(&format!("{}  image.raw\n", sha256_file(snap.image()).unwrap())));
    }

    #[test]
    fn test_runner_script_name() {
        let fw = Path::new("/fw/DIR320A1_FW121WWB03.bin");
        assert_eq!(runner_script_name(fw, false), "DIR320A1_FW121WWB03.bin_runner_.sh");
        assert_eq!(
            runner_script_name(fw, true),
            "DIR320A1_FW121WWB03.bin_runner_forced_.sh"
        );
    }
}
