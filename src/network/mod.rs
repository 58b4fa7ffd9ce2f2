//! Guest network discovery and host-side plumbing.
//!
//! transcript → events → endpoints → TAP bindings → bring-up/tear-down.

mod commands;
mod events;
mod topology;
mod transcript;

pub use commands::{bindings_for, host_ip, TapBinding};
pub use events::{decode_ip, decode_mac, parse_line, MacAddr, NetworkEvent};
pub use topology::{extract_endpoints, NetworkEndpoint};
pub use transcript::{strip_line, Transcript};

use crate::arch::Endianness;
use crate::process::Cmd;
use anyhow::{Context, Result};
use log::{info, warn};

/// Executes host commands; swapped out in tests.
pub trait CommandRunner {
    fn run(&mut self, cmd: &Cmd) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&mut self, cmd: &Cmd) -> Result<()> {
        cmd.run()?;
        Ok(())
    }
}

/// TAP bindings for a session, with their command sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPlan {
    bindings: Vec<TapBinding>,
}

impl NetworkPlan {
    pub fn new(bindings: Vec<TapBinding>) -> Self {
        Self { bindings }
    }

    pub fn from_transcript(transcript: &Transcript, endianness: Endianness, tap_base: u32) -> Self {
        let endpoints = extract_endpoints(transcript, endianness);
        Self::new(bindings_for(&endpoints, tap_base))
    }

    pub fn bindings(&self) -> &[TapBinding] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn push(&mut self, binding: TapBinding) {
        self.bindings.push(binding);
    }

    /// Next unused TAP index at or above `base`.
    pub fn next_index(&self, base: u32) -> u32 {
        self.bindings
            .iter()
            .filter_map(|b| b.tap.strip_prefix("tap_")?.parse::<u32>().ok())
            .map(|i| i + 1)
            .max()
            .unwrap_or(base)
            .max(base)
    }

    pub fn bring_up_commands(&self) -> Vec<Cmd> {
        self.bindings.iter().flat_map(TapBinding::bring_up).collect()
    }

    pub fn tear_down_commands(&self) -> Vec<Cmd> {
        self.bindings.iter().flat_map(TapBinding::tear_down).collect()
    }

    /// Bring every binding up in order. If one fails, the bindings already
    /// touched are torn down before the error is returned.
    pub fn start(&self, runner: &mut dyn CommandRunner) -> Result<()> {
        for (i, binding) in self.bindings.iter().enumerate() {
            info!("device available on {}", binding.guest_ip);
            for cmd in binding.bring_up() {
                if let Err(e) = runner.run(&cmd) {
                    Self::tear_down_bindings(&self.bindings[..=i], runner);
                    return Err(e)
                        .with_context(|| format!("Failed to bring up {}", binding.tap));
                }
            }
        }
        Ok(())
    }

    /// Best effort; failures are logged.
    pub fn stop(&self, runner: &mut dyn CommandRunner) {
        Self::tear_down_bindings(&self.bindings, runner);
    }

    fn tear_down_bindings(bindings: &[TapBinding], runner: &mut dyn CommandRunner) {
        for binding in bindings.iter().rev() {
            for cmd in binding.tear_down() {
                if let Err(e) = runner.run(&cmd) {
                    warn!("tear-down step '{}' failed: {:#}", cmd.shell_line(), e);
                }
            }
        }
    }
}
