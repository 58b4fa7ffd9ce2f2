use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use fw_emulator::arch::FixedArch;
use fw_emulator::archive::{RootfsArchive, TarArchive};
use fw_emulator::export::{runner_script_name, ExportOptions};
use fw_emulator::session::NetworkOutcome;
use fw_emulator::{Arch, Config, Session};

const FAILED_MARKER: &str = "failed";
const FAILED_TEXT: &str = "Failed to emulate";

/// Build, discover the network (forcing it if needed) and leave a runner
/// script next to the archive.
pub(crate) fn emulate(config: Config, archive: &Path, arch: &str) -> Result<()> {
    let arch: Arch = arch.parse()?;
    let archive = TarArchive::open(archive)?;
    let output_dir = archive
        .source()
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let mut session = Session::new(config)?;
    println!("[emulate] building image from {}", archive.source().display());
    session.make_image(&archive, &FixedArch(arch))?;

    println!("[emulate] probing network");
    let forced = match session.ensure_network()? {
        NetworkOutcome::Discovered => false,
        NetworkOutcome::Forced => {
            println!("[emulate] network found after forcing it");
            true
        }
        NetworkOutcome::Failed => {
            let marker = output_dir.join(FAILED_MARKER);
            fs::write(&marker, FAILED_TEXT)
                .with_context(|| format!("Failed to write {}", marker.display()))?;
            bail!(
                "network emulation failed for {}; marker at {}",
                archive.source().display(),
                marker.display()
            );
        }
    };

    for binding in session.network().bindings() {
        println!(
            "[emulate] {} ({}) reachable via {}",
            binding.guest_ip, binding.guest_device, binding.tap
        );
    }

    let options = ExportOptions {
        script_name: runner_script_name(archive.source(), forced),
        script_only: true,
    };
    let script = session.export(&output_dir, &options)?;
    println!("[emulate] runner written to {}", script.display());
    Ok(())
}
