use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use fw_emulator::Config;

mod workflows;

fn usage() -> &'static str {
    "Usage:\n  fw-emulator [--config <file>] emulate <rootfs-archive> --arch <mipsel|mipseb|arm>\n  fw-emulator [--config <file>] shell\n  fw-emulator [--config <file>] check [--arch <mipsel|mipseb|arm>]"
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(&mut args)?;

    match args.as_slice() {
        [emulate, archive, flag, arch] if emulate == "emulate" && flag == "--arch" => {
            workflows::emulate(config, &PathBuf::from(archive), arch)
        }
        [shell] if shell == "shell" => workflows::shell(config),
        [check] if check == "check" => workflows::check(&config, None),
        [check, flag, arch] if check == "check" && flag == "--arch" => {
            workflows::check(&config, Some(arch))
        }
        _ => bail!(usage()),
    }
}

/// Strip a leading `--config <file>` and load the configuration.
fn load_config(args: &mut Vec<String>) -> Result<Config> {
    let explicit = match args.first().map(String::as_str) {
        Some("--config") => {
            if args.len() < 2 {
                bail!(usage());
            }
            let path = PathBuf::from(args.remove(1));
            args.remove(0);
            Some(path)
        }
        _ => None,
    };
    Config::load(explicit.as_deref()).context("Failed to load configuration")
}
