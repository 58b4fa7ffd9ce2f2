use anyhow::Result;
use fw_emulator::config::require_asset;
use fw_emulator::{preflight, Arch, Config};

/// Verify host tools and, for `arch`, the prebuilt assets.
pub(crate) fn check(config: &Config, arch: Option<&str>) -> Result<()> {
    preflight::check_image_tools()?;
    preflight::check_network_tools()?;
    println!("[check] host tools present");

    let busybox = config.busybox_path()?;
    println!("[check] busybox: {}", busybox.display());
    for script in [
        config.pre_init_script(),
        config.fix_image_script(),
        config.force_network_script(),
    ] {
        require_asset(&script)?;
    }
    println!("[check] scripts in {}", config.scripts_dir().display());

    if let Some(arch) = arch {
        let arch: Arch = arch.parse()?;
        preflight::check_emulator(&arch)?;
        for asset in [
            config.kernel_path(&arch),
            config.console_path(&arch),
            config.nvram_path(&arch),
        ] {
            require_asset(&asset)?;
        }
        println!("[check:{}] emulator and binaries present", arch);
    }
    Ok(())
}
