//! Process creation behind a trait, so the adapter can be driven by a real
//! child or by an in-memory one.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::protocol::{Command, Event};
use crate::shell::ChildExit;
use crate::spawn::{ProcessEvent, SidecarProcess, SpawnConfig, SpawnError};

/// Write half of a sidecar connection.
pub trait LineWriter: Send {
    /// Write one newline-terminated line and flush it.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Stop the child. Called once, on adapter shutdown.
    fn shutdown(&mut self);
}

/// A freshly launched child: where to write and what it emits.
pub struct SidecarLink {
    pub writer: Box<dyn LineWriter>,
    pub events: Receiver<ProcessEvent>,
}

pub trait SidecarLauncher: Send + Sync {
    fn launch(&self) -> Result<SidecarLink, SpawnError>;

    /// Short description for diagnostics and transcript names.
    fn describe(&self) -> String;
}

/// Spawns the configured binary in the user's login shell.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: SpawnConfig,
}

impl ProcessLauncher {
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }
}

impl SidecarLauncher for ProcessLauncher {
    fn launch(&self) -> Result<SidecarLink, SpawnError> {
        let mut process = SidecarProcess::spawn(&self.config)?;
        let events = process
            .take_receiver()
            .ok_or(SpawnError::MissingPipe("event receiver"))?;
        Ok(SidecarLink {
            writer: Box::new(ProcessWriter { process }),
            events,
        })
    }

    fn describe(&self) -> String {
        self.config.binary_path.clone()
    }
}

struct ProcessWriter {
    process: SidecarProcess,
}

impl LineWriter for ProcessWriter {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.process.write_raw(line)
    }

    fn shutdown(&mut self) {
        self.process.stop();
    }
}

/// In-memory sidecar for tests and embedding.
///
/// Every `launch` creates a [`MemoryChild`] that records what the adapter
/// writes and lets the caller emit stdout lines or simulate an exit.
#[derive(Clone, Default)]
pub struct MemoryLauncher {
    state: Arc<Mutex<LauncherState>>,
}

#[derive(Default)]
struct LauncherState {
    children: Vec<MemoryChild>,
    failures_pending: usize,
}

impl MemoryLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` launches fail.
    pub fn fail_next_launches(&self, count: usize) {
        self.lock().failures_pending = count;
    }

    /// Number of successful launches so far.
    pub fn launches(&self) -> usize {
        self.lock().children.len()
    }

    /// The child of the `index`-th successful launch.
    pub fn child(&self, index: usize) -> Option<MemoryChild> {
        self.lock().children.get(index).cloned()
    }

    /// Poll until the `index`-th child exists.
    pub fn wait_for_child(&self, index: usize, timeout: Duration) -> Option<MemoryChild> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(child) = self.child(index) {
                return Some(child);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SidecarLauncher for MemoryLauncher {
    fn launch(&self) -> Result<SidecarLink, SpawnError> {
        let mut state = self.lock();
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(SpawnError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "memory launcher told to fail",
            )));
        }

        let (tx, rx) = mpsc::channel();
        let child = MemoryChild {
            inner: Arc::new(ChildInner {
                tx: Mutex::new(Some(tx)),
                written: Mutex::new(Vec::new()),
                alive: AtomicBool::new(true),
            }),
        };
        state.children.push(child.clone());

        Ok(SidecarLink {
            writer: Box::new(MemoryWriter { child }),
            events: rx,
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Handle on one in-memory child.
#[derive(Clone)]
pub struct MemoryChild {
    inner: Arc<ChildInner>,
}

struct ChildInner {
    tx: Mutex<Option<Sender<ProcessEvent>>>,
    written: Mutex<Vec<String>>,
    alive: AtomicBool,
}

impl MemoryChild {
    /// Emit one raw stdout line.
    pub fn emit(&self, line: &str) {
        self.send(ProcessEvent::Stdout(line.to_string()));
    }

    /// Emit one encoded event.
    pub fn emit_event(&self, event: &Event) {
        match serde_json::to_string(event) {
            Ok(line) => self.emit(&line),
            Err(e) => log::error!("Failed to encode test event: {e}"),
        }
    }

    pub fn emit_stderr(&self, line: &str) {
        self.send(ProcessEvent::Stderr(line.to_string()));
    }

    /// Close stdout and exit with `code`.
    pub fn exit(&self, code: i32) {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.send(ProcessEvent::StdoutClosed);
        self.send(ProcessEvent::Exit(ChildExit { code, signal: None }));
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Make further writes fail without exiting.
    pub fn close_stdin(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Every line the adapter wrote, without trailing newlines.
    pub fn written(&self) -> Vec<String> {
        self.inner
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Written lines decoded as commands.
    pub fn written_commands(&self) -> Vec<Command> {
        self.written()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn send(&self, event: ProcessEvent) {
        if let Some(tx) = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            let _ = tx.send(event);
        }
    }
}

struct MemoryWriter {
    child: MemoryChild,
}

impl LineWriter for MemoryWriter {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if !self.child.is_alive() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "child has exited"));
        }
        self.child
            .inner
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.trim_end_matches('\n').to_string());
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.child.is_alive() {
            self.child.exit(0);
        }
    }
}
