//! External process execution.
//!
//! Every side effect the engine performs on the host (mount, umount, swapon,
//! cryptsetup, fsck, blockdev) goes through [`ProcessRunner`], so the whole
//! mount sequence can be replayed against a scripted runner in tests.
//!
//! [`Cmd`] is the builder used by [`SystemRunner`] and by the few helpers that
//! talk to the host directly.

use anyhow::{bail, Context, Result};
use log::debug;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use zeroize::Zeroizing;

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Output with a given exit code and empty streams.
    pub fn with_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    /// stderr and stdout joined for user-facing error messages.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        match (stderr.is_empty(), stdout.is_empty()) {
            (true, true) => format!("exit code {}", self.exit_code),
            (false, true) => stderr.to_string(),
            (true, false) => stdout.to_string(),
            (false, false) => format!("{stderr}\n{stdout}"),
        }
    }
}

/// Process-runner collaborator.
///
/// Non-zero exits are returned as data, not errors. `Err` means the program
/// could not be spawned at all.
pub trait ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run with `input` written to the child's stdin (passphrases).
    fn run_with_input(&self, program: &str, args: &[String], input: &str)
        -> Result<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        Cmd::new(program).args(args).allow_fail().run()
    }

    fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: &str,
    ) -> Result<CommandOutput> {
        Cmd::new(program).args(args).stdin(input).allow_fail().run()
    }
}

/// Programs from `required` that are not in PATH.
pub fn missing_programs<'a>(required: &[&'a str]) -> Vec<&'a str> {
    required
        .iter()
        .copied()
        .filter(|program| which::which(program).is_err())
        .collect()
}

/// Builder for a single synchronous command invocation.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    /// Passphrases pass through here; wiped on drop.
    input: Option<Zeroizing<String>>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Write `input` to the child's stdin, then close it.
    pub fn stdin(mut self, input: &str) -> Self {
        self.input = Some(Zeroizing::new(input.to_string()));
        self
    }

    /// Message used when the command exits non-zero.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return non-zero exits as `Ok` instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn run(self) -> Result<CommandOutput> {
        let resolved = resolve_program(&self.program)?;
        debug!(
            "exec: {} {}",
            self.program,
            self.args
                .iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut command = Command::new(&resolved);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if self.input.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to run {}", self.program))?;

        if let Some(input) = &self.input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .with_context(|| format!("Failed to write stdin of {}", self.program))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", self.program))?;

        let result = CommandOutput {
            // Killed by a signal has no code.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("{} failed", self.program));
            bail!("{}: {}", msg, result.diagnostics());
        }

        Ok(result)
    }
}

fn resolve_program(program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    which::which(program).with_context(|| format!("{program} not found in PATH"))
}
