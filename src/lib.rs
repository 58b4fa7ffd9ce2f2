//! Turn an extracted embedded-Linux root filesystem into a bootable QEMU
//! image, discover the guest's network configuration from its kernel log,
//! and run or export it with matching host TAP/VLAN devices.
//!
//! # Architecture
//!
//! ```text
//! session::Session
//!     │
//!     ├── image     create → partition → mount → populate → instrument → patch
//!     │     └── mount     kpartx/mount lifecycle, released on every exit path
//!     ├── probe     bounded headless boot, serial log → Transcript
//!     ├── network   Transcript → events → endpoints → TAP bindings → commands
//!     ├── emulator  per-architecture QEMU argument vectors
//!     └── export    standalone runner script
//! ```
//!
//! Host programs are driven through [`process::Cmd`] argument vectors;
//! privileged steps go through `sudo`.
//!
//! # Example
//!
//! ```rust,ignore
//! use fw_emulator::arch::FixedArch;
//! use fw_emulator::archive::TarArchive;
//! use fw_emulator::config::Config;
//! use fw_emulator::session::Session;
//!
//! let mut session = Session::new(Config::load(None)?)?;
//! let archive = TarArchive::open("rootfs.tar.gz".as_ref())?;
//! session.make_image(&archive, &FixedArch("mipsel".parse()?))?;
//! if session.setup_network()? {
//!     session.run()?;
//! }
//! ```

pub mod arch;
pub mod archive;
pub mod config;
pub mod emulator;
pub mod error;
pub mod export;
pub mod image;
pub mod mount;
pub mod network;
pub mod preflight;
pub mod probe;
pub mod process;
pub mod session;
pub mod shell;

pub use arch::{Arch, ArchDetector, Endianness};
pub use config::Config;
pub use error::{kind_of, Error, ErrorKind};
pub use session::Session;
