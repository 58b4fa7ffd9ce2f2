//! Line-oriented session commands.
//!
//! One command per line, words separated by whitespace. Parsing failures are
//! [`Error::Usage`] so a front end can report them and keep going.

use crate::arch::{Arch, FixedArch};
use crate::archive::TarArchive;
use crate::error::Error;
use crate::export::ExportOptions;
use crate::session::{Session, SessionStatus};
use anyhow::{bail, Result};
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub const HELP: &str = "\
make_image <rootfs-archive> <arch>       build an image (arch: mipsel, mipseb, arm)
use_image <image> <arch>                 use an image built earlier
setup_network                            probe the boot and configure TAP devices
force_network                            make the guest bring up its interfaces
run                                      run the guest on this terminal
add_file <local> <guest-path>            copy a file or directory into the image
del_file <guest-path>                    delete a file from the image
remove_root_passwd                       blank root's password
force_tty_login                          spawn a shell on ttyS0 instead of a login
add_network <guest-ip> <host-ip> <dev> [vlan]
                                         add a TAP binding by hand
export <dir> [script-name] [--script-only]
                                         write a standalone runner script
mount | unmount                          keep the image mounted between commands
info [--json]                            show the session state
help | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ShellCommand {
    MakeImage { archive: PathBuf, arch: Arch },
    UseImage { image: PathBuf, arch: Arch },
    SetupNetwork,
    ForceNetwork,
    Run,
    AddFile { local: PathBuf, target: String },
    DelFile { target: String },
    RemoveRootPasswd,
    ForceTtyLogin,
    AddNetwork {
        guest_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
        device: String,
        vlan_id: Option<u16>,
    },
    Export {
        dir: PathBuf,
        script_name: Option<String>,
        script_only: bool,
    },
    Mount,
    Unmount,
    Info { json: bool },
    Help,
    Quit,
}

fn usage(text: &str) -> anyhow::Error {
    Error::Usage(text.to_string()).into()
}

fn parse_arch(word: &str) -> Result<Arch> {
    word.parse()
        .map_err(|_| usage("arch must be one of mipsel, mipseb, arm"))
}

fn parse_ip(word: &str) -> Result<Ipv4Addr> {
    word.parse()
        .map_err(|_| usage(&format!("'{}' is not an IPv4 address", word)))
}

/// Parse one line. Blank lines and `#` comments yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ShellCommand>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&name, rest)) = words.split_first() else {
        return Ok(None);
    };
    if name.starts_with('#') {
        return Ok(None);
    }

    let command = match (name, rest) {
        ("make_image", [archive, arch]) => ShellCommand::MakeImage {
            archive: PathBuf::from(archive),
            arch: parse_arch(arch)?,
        },
        ("make_image", _) => return Err(usage("make_image <rootfs-archive> <arch>")),
        ("use_image", [image, arch]) => ShellCommand::UseImage {
            image: PathBuf::from(image),
            arch: parse_arch(arch)?,
        },
        ("use_image", _) => return Err(usage("use_image <image> <arch>")),
        ("setup_network", []) => ShellCommand::SetupNetwork,
        ("force_network", []) => ShellCommand::ForceNetwork,
        ("run", []) => ShellCommand::Run,
        ("add_file", [local, target]) => ShellCommand::AddFile {
            local: PathBuf::from(local),
            target: target.to_string(),
        },
        ("add_file", _) => return Err(usage("add_file <local> <guest-path>")),
        ("del_file", [target]) => ShellCommand::DelFile {
            target: target.to_string(),
        },
        ("del_file", _) => return Err(usage("del_file <guest-path>")),
        ("remove_root_passwd", []) => ShellCommand::RemoveRootPasswd,
        ("force_tty_login", []) => ShellCommand::ForceTtyLogin,
        ("add_network", [guest, host, device, vlan @ ..]) if vlan.len() <= 1 => {
            let vlan_id = match vlan.first() {
                Some(v) => Some(
                    v.parse::<u16>()
                        .map_err(|_| usage(&format!("'{}' is not a VLAN id", v)))?,
                ),
                None => None,
            };
            ShellCommand::AddNetwork {
                guest_ip: parse_ip(guest)?,
                host_ip: parse_ip(host)?,
                device: device.to_string(),
                vlan_id,
            }
        }
        ("add_network", _) => return Err(usage("add_network <guest-ip> <host-ip> <dev> [vlan]")),
        ("export", [dir, tail @ ..]) => parse_export(dir, tail)?,
        ("export", _) => return Err(usage("export <dir> [script-name] [--script-only]")),
        ("mount", []) => ShellCommand::Mount,
        ("unmount", []) => ShellCommand::Unmount,
        ("info", []) => ShellCommand::Info { json: false },
        ("info", ["--json"]) => ShellCommand::Info { json: true },
        ("help", _) => ShellCommand::Help,
        ("quit" | "exit", []) => ShellCommand::Quit,
        (
            "setup_network" | "force_network" | "run" | "remove_root_passwd"
            | "force_tty_login" | "mount" | "unmount" | "info" | "quit" | "exit",
            _,
        ) => return Err(usage(&format!("{} takes no arguments", name))),
        _ => return Err(usage(&format!("unknown command '{}'; try help", name))),
    };
    Ok(Some(command))
}

fn parse_export(dir: &str, tail: &[&str]) -> Result<ShellCommand> {
    let mut script_name = None;
    let mut script_only = false;
    for word in tail {
        match *word {
            "--script-only" => script_only = true,
            flag if flag.starts_with("--") => {
                return Err(usage(&format!("unknown export flag '{}'", flag)))
            }
            name if script_name.is_none() => script_name = Some(name.to_string()),
            _ => return Err(usage("export <dir> [script-name] [--script-only]")),
        }
    }
    Ok(ShellCommand::Export {
        dir: PathBuf::from(dir),
        script_name,
        script_only,
    })
}

/// Run `command` against `session` and describe the outcome.
///
/// `Quit` is left to the caller.
pub fn execute(session: &mut Session, command: ShellCommand) -> Result<String> {
    let message = match command {
        ShellCommand::MakeImage { archive, arch } => {
            let archive = TarArchive::open(&archive)?;
            let image = session.make_image(&archive, &FixedArch(arch))?;
            format!("image built at {} ({})", image.display(), arch)
        }
        ShellCommand::UseImage { image, arch } => {
            session.adopt_image(&image, arch)?;
            format!("using {} ({})", image.display(), arch)
        }
        ShellCommand::SetupNetwork => {
            if !session.setup_network()? {
                bail!("no network interface found during boot; try force_network");
            }
            describe_network(&session.status())
        }
        ShellCommand::ForceNetwork => {
            session.force_network()?;
            "networking forced; run setup_network again".to_string()
        }
        ShellCommand::Run => {
            session.run()?;
            "emulation finished".to_string()
        }
        ShellCommand::AddFile { local, target } => {
            session.add_file(&local, &target)?;
            format!("added {} as {}", local.display(), target)
        }
        ShellCommand::DelFile { target } => {
            session.del_file(&target)?;
            format!("deleted {}", target)
        }
        ShellCommand::RemoveRootPasswd => {
            let n = session.remove_root_passwd()?;
            format!("root password removed in {} files", n)
        }
        ShellCommand::ForceTtyLogin => {
            let n = session.force_tty_login()?;
            format!("ttyS0 login replaced in {} files", n)
        }
        ShellCommand::AddNetwork {
            guest_ip,
            host_ip,
            device,
            vlan_id,
        } => {
            let binding = session.add_network(guest_ip, host_ip, &device, vlan_id)?;
            format!("{} bound to {} via {}", guest_ip, host_ip, binding.host_net_dev())
        }
        ShellCommand::Export {
            dir,
            script_name,
            script_only,
        } => {
            let mut options = ExportOptions {
                script_only,
                ..ExportOptions::default()
            };
            if let Some(name) = script_name {
                options.script_name = name;
            }
            let script = session.export(&dir, &options)?;
            format!("exported to {}", script.display())
        }
        ShellCommand::Mount => {
            let mount_point = session.mount()?;
            format!("mounted at {}", mount_point.display())
        }
        ShellCommand::Unmount => {
            session.unmount()?;
            "unmounted".to_string()
        }
        ShellCommand::Info { json } => {
            let status = session.status();
            if json {
                serde_json::to_string_pretty(&status)?
            } else {
                render_status(&status)
            }
        }
        ShellCommand::Help => HELP.to_string(),
        ShellCommand::Quit => String::new(),
    };
    Ok(message)
}

fn describe_network(status: &SessionStatus) -> String {
    let ips: Vec<String> = status.guest_ips().iter().map(|ip| ip.to_string()).collect();
    format!("network found: {}", ips.join(", "))
}

fn or_unset<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Plain-text rendering of [`SessionStatus`].
pub fn render_status(status: &SessionStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "arch:        {}", or_unset(status.arch.as_ref()));
    let _ = writeln!(out, "endianness:  {}", or_unset(status.endianness));
    let _ = writeln!(
        out,
        "image:       {}",
        or_unset(status.image.as_ref().map(|p| p.display()))
    );
    let _ = writeln!(
        out,
        "kernel:      {}",
        or_unset(status.kernel.as_ref().map(|p| p.display()))
    );
    let _ = writeln!(
        out,
        "mounted at:  {}",
        or_unset(status.mount_point.as_ref().map(|p| p.display()))
    );
    let _ = writeln!(out, "forced net:  {}", status.forced_network);
    let _ = writeln!(out, "work dir:    {}", status.work_dir.display());
    if status.network.is_empty() {
        let _ = write!(out, "network:     -");
    }
    for (i, binding) in status.network.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(
            out,
            "network:     {} ({}) <-> {} on {}",
            binding.guest_ip,
            binding.guest_device,
            binding.host_ip,
            binding.host_net_dev()
        );
    }
    out
}
