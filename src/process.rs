//! Structured host command descriptors.
//!
//! Every external tool the emulator drives (partitioning, kpartx, mount,
//! tunctl, ip, qemu) goes through [`Cmd`]: an argument vector rather than an
//! interpolated shell string. A `Cmd` can be executed directly, or rendered as
//! a quoted shell line for the export script.
//!
//! ```rust,ignore
//! use fw_emulator::process::Cmd;
//!
//! Cmd::new("ip")
//!     .args(["link", "set", "tap_0", "up"])
//!     .sudo()
//!     .error_msg("failed to bring tap_0 up")
//!     .run()?;
//! ```

use anyhow::{bail, Context, Result};
use log::debug;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

/// A host command: program, arguments, environment and execution policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    sudo: bool,
    stdin: Option<Vec<u8>>,
    error_msg: Option<String>,
    allow_fail: bool,
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            sudo: false,
            stdin: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    /// Set an environment variable for the child.
    ///
    /// For privileged commands the assignment is passed through `sudo`, which
    /// otherwise scrubs the environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run through `sudo` (skipped when already running as root).
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Feed these bytes to the child's stdin.
    pub fn stdin_bytes(mut self, input: &[u8]) -> Self {
        self.stdin = Some(input.to_vec());
        self
    }

    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn is_privileged(&self) -> bool {
        self.sudo
    }

    /// Reject descriptors that cannot be executed faithfully.
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            bail!("refusing to run a command with an empty program name");
        }
        let fields = std::iter::once(&self.program)
            .chain(self.args.iter())
            .chain(self.env.iter().flat_map(|(k, v)| [k, v]));
        for field in fields {
            if field.contains('\0') {
                bail!("command '{}' contains a NUL byte", self.program);
            }
        }
        for (key, _) in &self.env {
            if key.is_empty() || key.contains('=') {
                bail!("invalid environment variable name '{}'", key);
            }
        }
        Ok(())
    }

    /// Build the `std::process::Command` this descriptor stands for.
    pub fn to_command(&self) -> Command {
        if self.sudo && !running_as_root() {
            let mut cmd = Command::new("sudo");
            for (key, value) in &self.env {
                cmd.arg(format!("{}={}", key, value));
            }
            cmd.arg(&self.program).args(&self.args);
            cmd
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args);
            for (key, value) in &self.env {
                cmd.env(key, value);
            }
            cmd
        }
    }

    /// Run to completion, capturing stdout and stderr.
    pub fn run(&self) -> Result<CommandResult> {
        self.validate()?;
        debug!("running: {}", self.shell_line());

        let mut cmd = self.to_command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute {}", self.program))?;

        if let Some(input) = &self.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input)
                    .with_context(|| format!("Failed to write stdin of {}", self.program))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            bail!(
                "{}\n  Command: {}\n  Exit code: {}\n  stderr: {}",
                self.error_msg
                    .as_deref()
                    .unwrap_or("Command failed"),
                self.shell_line(),
                result.status.code().unwrap_or(-1),
                result.stderr.trim()
            );
        }

        Ok(result)
    }

    /// Run attached to the current terminal.
    pub fn run_interactive(&self) -> Result<ExitStatus> {
        self.validate()?;
        debug!("running interactively: {}", self.shell_line());

        let status = self
            .to_command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to execute {}", self.program))?;

        if !status.success() && !self.allow_fail {
            bail!(
                "{} (exit code {})",
                self.error_msg
                    .as_deref()
                    .unwrap_or("Command failed"),
                status.code().unwrap_or(-1)
            );
        }
        Ok(status)
    }

    /// Spawn without waiting; output is discarded.
    pub fn spawn_detached(&self) -> Result<Child> {
        self.validate()?;
        debug!("spawning: {}", self.shell_line());

        self.to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))
    }

    /// Words of the command as a script would spell them, `sudo` included.
    pub fn words(&self) -> Vec<String> {
        let mut words = Vec::new();
        if self.sudo {
            words.push("sudo".to_string());
            for (key, value) in &self.env {
                words.push(format!("{}={}", key, value));
            }
        }
        words.push(self.program.clone());
        words.extend(self.args.iter().cloned());
        words
    }

    /// Render as a single quoted shell line.
    pub fn shell_line(&self) -> String {
        let line = self
            .words()
            .iter()
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ");
        if self.sudo || self.env.is_empty() {
            line
        } else {
            let env = self
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{} {}", env, line)
        }
    }
}

/// Quote a word for POSIX sh, leaving plain words untouched.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | ',' | '=' | '+' | '@')
        });
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Check whether a program is available in PATH.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain_and_special() {
        assert_eq!(shell_quote("tap_0"), "tap_0");
        assert_eq!(shell_quote("10.0.0.4/24"), "10.0.0.4/24");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_words_include_sudo_and_env() {
        let cmd = Cmd::new("qemu-system-arm")
            .env("QEMU_AUDIO_DRV", "none")
            .args(["-M", "virt"])
            .sudo();
        assert_eq!(
            cmd.words(),
            vec!["sudo", "QEMU_AUDIO_DRV=none", "qemu-system-arm", "-M", "virt"]
        );
    }

    #[test]
    fn test_shell_line_quotes_arguments() {
        let cmd = Cmd::new("qemu-system-mips").args(["-append", "root=/dev/sda1 rw"]);
        assert_eq!(cmd.shell_line(), "qemu-system-mips -append 'root=/dev/sda1 rw'");
    }

    #[test]
    fn test_validate_rejects_nul_and_empty() {
        assert!(Cmd::new("").validate().is_err());
        assert!(Cmd::new("ip").arg("bad\0arg").validate().is_err());
        assert!(Cmd::new("ip").env("A=B", "x").validate().is_err());
        assert!(Cmd::new("ip").args(["link", "show"]).validate().is_ok());
    }

    #[test]
    fn test_run_captures_output() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_feeds_stdin() {
        let result = Cmd::new("cat").stdin_bytes(b"o\nn\n").run().unwrap();
        assert_eq!(result.stdout, "o\nn\n");
    }

    #[test]
    fn test_run_failure_reports_error_msg() {
        let err = Cmd::new("false").error_msg("false failed").run().unwrap_err();
        assert!(err.to_string().contains("false failed"));

        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn test_exists() {
        assert!(exists("sh"));
        assert!(!exists("definitely_not_a_real_command_12345"));
    }
}
