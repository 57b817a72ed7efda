//! Sidecar process spawning and I/O.
//!
//! The child runs in a login shell. Background threads turn its stdout and
//! stderr into line events and watch for exit; everything arrives on one
//! channel so a single reader can consume it in order of arrival.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::shell::{build_login_shell_command, ChildExit};

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Empty shell prefix")]
    EmptyShellPrefix,

    #[error("Cannot quote command element: {0:?}")]
    InvalidCommand(String),

    #[error("Failed to spawn sidecar: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to capture sidecar {0}")]
    MissingPipe(&'static str),
}

/// Output of a running sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One line of stdout, without the newline.
    Stdout(String),
    /// One line of stderr, without the newline.
    Stderr(String),
    /// Stdout reached EOF. No further `Stdout` events follow.
    StdoutClosed,
    /// The process exited.
    Exit(ChildExit),
}

/// How to start the sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    pub binary_path: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    /// Custom shell prefix (e.g. `/bin/zsh -l -c`).
    pub shell_prefix: Option<String>,
}

impl SpawnConfig {
    pub fn new(binary_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args,
            working_dir: None,
            shell_prefix: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }
}

/// A running sidecar process.
pub struct SidecarProcess {
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    event_receiver: Option<Receiver<ProcessEvent>>,
}

impl SidecarProcess {
    /// Spawn the process and start its reader and exit-watcher threads.
    pub fn spawn(config: &SpawnConfig) -> Result<Self, SpawnError> {
        let mut cmd = build_login_shell_command(
            &config.binary_path,
            &config.args,
            config.working_dir.as_deref(),
            config.shell_prefix.as_deref(),
        )?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        log::info!(
            "Spawned sidecar {} (pid {})",
            config.binary_path,
            child.id()
        );

        let (tx, rx) = mpsc::channel();
        let child_arc = Arc::new(Mutex::new(Some(child)));
        let stdin_arc = Arc::new(Mutex::new(Some(stdin)));

        let tx_stdout = tx.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines().map_while(Result::ok) {
                if tx_stdout.send(ProcessEvent::Stdout(line)).is_err() {
                    return;
                }
            }
            let _ = tx_stdout.send(ProcessEvent::StdoutClosed);
        });

        let tx_stderr = tx.clone();
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                if tx_stderr.send(ProcessEvent::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        let child_exit = Arc::clone(&child_arc);
        let stdin_exit = Arc::clone(&stdin_arc);
        thread::spawn(move || loop {
            let mut guard = child_exit.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(child) = guard.as_mut() else {
                // Reaped by stop() or kill().
                let _ = tx.send(ProcessEvent::Exit(ChildExit {
                    code: -1,
                    signal: None,
                }));
                break;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    let _ = tx.send(ProcessEvent::Exit(ChildExit::from_status(status)));
                    guard.take();
                    stdin_exit
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Failed to poll sidecar status: {e}");
                    guard.take();
                    stdin_exit
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    let _ = tx.send(ProcessEvent::Exit(ChildExit {
                        code: -1,
                        signal: None,
                    }));
                    break;
                }
            }
            drop(guard);
            thread::sleep(Duration::from_millis(100));
        });

        Ok(Self {
            child: child_arc,
            stdin: stdin_arc,
            event_receiver: Some(rx),
        })
    }

    /// Write raw data to stdin and flush. The caller supplies the newline.
    pub fn write_raw(&self, data: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        let stdin = guard.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sidecar stdin is closed")
        })?;
        stdin.write_all(data.as_bytes())?;
        stdin.flush()
    }

    /// Take ownership of the event receiver. Returns `None` the second time.
    pub fn take_receiver(&mut self) -> Option<Receiver<ProcessEvent>> {
        self.event_receiver.take()
    }

    pub fn is_running(&self) -> bool {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Close stdin, send SIGINT, wait up to 3 seconds, then kill.
    pub fn stop(&self) {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = guard.as_mut() else {
            return;
        };

        #[cfg(unix)]
        {
            // SAFETY: plain signal delivery to a pid we spawned and still own.
            unsafe {
                libc::kill(child.id() as i32, libc::SIGINT);
            }
            for _ in 0..30 {
                thread::sleep(Duration::from_millis(100));
                match child.try_wait() {
                    Ok(Some(_)) => {
                        guard.take();
                        return;
                    }
                    Ok(None) => continue,
                    Err(_) => break,
                }
            }
        }

        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Kill immediately.
    pub fn kill(&self) {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
