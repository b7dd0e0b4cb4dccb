//! Native command execution.
//!
//! Backends that drive a CLI (VBoxManage, PowerShell, virsh, qemu-img) go
//! through [`CommandRunner`] so tests can script native responses and count
//! invocations. Also holds the pid helpers used to supervise a hypervisor
//! process we no longer hold a child handle for.

use crate::error::{Error, Result};
use std::process::Command;
use std::time::{Duration, Instant};

/// Captured result of one native command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The most useful diagnostic text: stderr, else stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs native commands.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// An `Err` means the program could not be executed at all; a nonzero
    /// exit is reported through [`CommandOutput::code`].
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run and require success, returning stdout.
    fn run_checked(&self, program: &str, args: &[String]) -> Result<String> {
        let output = self.run(program, args)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::command_failed(
                format!("{} {}", program, args.first().map(String::as_str).unwrap_or("")),
                output.diagnostic(),
            ))
        }
    }
}

/// [`CommandRunner`] backed by `std::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        tracing::debug!(program = %program, args = ?args, "running native command");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::command_failed(program, e.to_string()))?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            tracing::error!(
                program = %program,
                code = ?result.code,
                stderr = %result.stderr.trim(),
                "native command failed"
            );
        }
        Ok(result)
    }
}

/// Build an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Check whether a process exists.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Returns `true` if the process had to be killed.
pub fn terminate(pid: u32, grace: Duration) -> Result<bool> {
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| Error::command_failed("kill", format!("invalid pid {}", pid)))?;

    // SAFETY: plain signal delivery to a pid we recorded.
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        // Already gone.
        return Ok(false);
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_alive(pid) {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::warn!(pid, ?grace, "process ignored SIGTERM, sending SIGKILL");
    // SAFETY: as above.
    unsafe { libc::kill(raw, libc::SIGKILL) };
    Ok(true)
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// [`CommandRunner`] double answering from a script of
    /// `(substring, output)` rules and recording every invocation.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer commands whose joined command line contains `pattern`.
        ///
        /// Several outputs for one pattern are returned in order; the last
        /// one repeats.
        pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
            let mut rules = self.rules.lock();
            if let Some((_, queue)) = rules.iter_mut().find(|(p, _)| p == pattern) {
                queue.push_back(output);
            } else {
                rules.push((pattern.to_string(), VecDeque::from([output])));
            }
            self
        }

        /// All command lines run so far.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        /// Number of command lines containing `pattern`.
        pub fn count(&self, pattern: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.contains(pattern)).count()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            let line = std::iter::once(program.to_string())
                .chain(args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().push(line.clone());

            let mut rules = self.rules.lock();
            // Longest matching pattern wins.
            let best = rules
                .iter_mut()
                .filter(|(p, _)| line.contains(p.as_str()))
                .max_by_key(|(p, _)| p.len());

            match best {
                Some((_, queue)) if queue.len() > 1 => Ok(queue.pop_front().unwrap_or_default()),
                Some((_, queue)) => Ok(queue.front().cloned().unwrap_or_default()),
                None => Ok(CommandOutput::ok("")),
            }
        }
    }
}
