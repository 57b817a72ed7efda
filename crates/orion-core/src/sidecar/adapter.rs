//! The sidecar adapter: one child, many concurrent requests.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use super::hub::{EventHub, Subscription};
use super::launcher::{LineWriter, SidecarLauncher, SidecarLink};
use super::{CommandDispatcher, SidecarError};
use crate::ids::RequestId;
use crate::logging::{self, Direction, LogHandle};
use crate::protocol::{encode_command, Command, Event, LineDecoder};
use crate::shell::ChildExit;
use crate::spawn::ProcessEvent;

/// How long to wait for the other half of a shutdown (stdout EOF vs exit).
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Restart behaviour after the child dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive restarts allowed before giving up. A completed request
    /// resets the count.
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RestartPolicy {
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }

    /// Delay before restart number `attempt` (1-based): exponential, capped,
    /// plus jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    pub restart: RestartPolicy,
    /// Unread partial chunks an [`observe`](SidecarAdapter::observe)
    /// subscriber may hold before newer ones are shed. 0 disables shedding.
    pub max_pending_partials: usize,
    /// Where to write the wire transcript. `None` disables it.
    pub transcript_dir: Option<PathBuf>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::default(),
            max_pending_partials: 256,
            transcript_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    Running,
    Restarting,
    /// Gave up restarting, or shut down. Terminal.
    Unavailable,
}

struct AdapterState {
    status: AdapterStatus,
    generation: u64,
    in_flight: HashSet<RequestId>,
    interrupted: HashSet<RequestId>,
    consecutive_restarts: u32,
    last_pong: Option<DateTime<Utc>>,
    shutting_down: bool,
}

struct WriterSlot {
    generation: u64,
    writer: Box<dyn LineWriter>,
}

struct Shared {
    launcher: Arc<dyn SidecarLauncher>,
    restart: RestartPolicy,
    hub: EventHub,
    transcript: LogHandle,
    // Lock order: `state` before `writer`.
    state: Mutex<AdapterState>,
    writer: Mutex<Option<WriterSlot>>,
}

/// Handle on the running sidecar. Cheap to clone.
#[derive(Clone)]
pub struct SidecarAdapter {
    shared: Arc<Shared>,
}

impl SidecarAdapter {
    /// Launch the child. Fails if the first launch fails.
    pub fn start(
        launcher: Arc<dyn SidecarLauncher>,
        options: AdapterOptions,
    ) -> Result<Self, SidecarError> {
        let log_id = format!("sidecar-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let transcript = logging::open_log_file(options.transcript_dir.as_deref(), &log_id);

        let link = launcher.launch()?;
        log::info!("Sidecar started ({})", launcher.describe());

        let shared = Arc::new(Shared {
            launcher,
            restart: options.restart,
            hub: EventHub::new(options.max_pending_partials),
            transcript,
            state: Mutex::new(AdapterState {
                status: AdapterStatus::Restarting,
                generation: 0,
                in_flight: HashSet::new(),
                interrupted: HashSet::new(),
                consecutive_restarts: 0,
                last_pong: None,
                shutting_down: false,
            }),
            writer: Mutex::new(None),
        });
        shared.attach(link);

        Ok(Self { shared })
    }

    /// Encode and write one command. Queries are registered as in flight
    /// before the write.
    pub fn submit(&self, command: Command) -> Result<(), SidecarError> {
        let line = encode_command(&command)?;
        let query_id = match &command {
            Command::Query { request_id, .. } => Some(request_id.clone()),
            _ => None,
        };

        let generation = {
            let mut state = self.shared.lock_state();
            check_running(state.status)?;
            if let Some(id) = &query_id {
                state.in_flight.insert(id.clone());
            }
            state.generation
        };

        if let Err(err) = self.shared.write(generation, &line) {
            if let Some(id) = &query_id {
                self.shared.lock_state().in_flight.remove(id);
            }
            log::warn!("Failed to submit {}: {err}", command.kind());
            return Err(err);
        }
        Ok(())
    }

    /// Ask the child to stop a request. Only the first interrupt of an
    /// in-flight request is written; anything else is a no-op.
    pub fn interrupt(&self, request_id: &RequestId) -> Result<bool, SidecarError> {
        let generation = {
            let mut state = self.shared.lock_state();
            if !state.in_flight.contains(request_id) {
                log::debug!("Ignoring interrupt for {request_id}: not in flight");
                return Ok(false);
            }
            if !state.interrupted.insert(request_id.clone()) {
                log::debug!("Ignoring interrupt for {request_id}: already sent");
                return Ok(false);
            }
            state.generation
        };

        let line = encode_command(&Command::Interrupt {
            request_id: request_id.clone(),
        })?;
        if let Err(err) = self.shared.write(generation, &line) {
            self.shared.lock_state().interrupted.remove(request_id);
            return Err(err);
        }
        Ok(true)
    }

    /// Health check. The answer shows up in [`last_pong`](Self::last_pong).
    pub fn ping(&self) -> Result<(), SidecarError> {
        self.submit(Command::Ping)
    }

    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.shared.lock_state().last_pong
    }

    pub fn status(&self) -> AdapterStatus {
        self.shared.lock_state().status
    }

    pub fn in_flight(&self) -> Vec<RequestId> {
        self.shared.lock_state().in_flight.iter().cloned().collect()
    }

    pub fn is_in_flight(&self, request_id: &RequestId) -> bool {
        self.shared.lock_state().in_flight.contains(request_id)
    }

    /// Every decoded event, pong included, in emission order. Lossless:
    /// this is the feed session routing consumes.
    pub fn events(&self) -> Subscription {
        self.shared.hub.subscribe()
    }

    /// Like [`events`](Self::events), but partial chunks beyond
    /// `max_pending_partials` unread are shed for this subscriber.
    pub fn observe(&self) -> Subscription {
        self.shared.hub.subscribe_observer()
    }

    /// Events of one request, ending after its terminal event. Subscribe
    /// before submitting, or early events may be missed.
    pub fn subscribe_request(&self, request_id: RequestId) -> Subscription {
        self.shared.hub.subscribe_request(request_id)
    }

    /// Stop the child and never restart it. In-flight requests fail with
    /// `child_exited`.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock_state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.status = AdapterStatus::Unavailable;
        }
        log::info!("Shutting down sidecar");

        let slot = self.shared.lock_writer().take();
        if let Some(mut slot) = slot {
            slot.writer.shutdown();
        }
    }
}

impl CommandDispatcher for SidecarAdapter {
    fn submit(&self, command: Command) -> Result<(), SidecarError> {
        SidecarAdapter::submit(self, command)
    }

    fn interrupt(&self, request_id: &RequestId) -> Result<bool, SidecarError> {
        SidecarAdapter::interrupt(self, request_id)
    }
}

fn check_running(status: AdapterStatus) -> Result<(), SidecarError> {
    match status {
        AdapterStatus::Running => Ok(()),
        AdapterStatus::Restarting => Err(SidecarError::Restarting),
        AdapterStatus::Unavailable => Err(SidecarError::Unavailable),
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<WriterSlot>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write to the child of `generation`. Fails if that child is gone.
    fn write(&self, generation: u64, line: &str) -> Result<(), SidecarError> {
        let written = {
            let mut slot = self.lock_writer();
            match slot.as_mut() {
                Some(current) if current.generation == generation => {
                    Some(current.writer.write_line(line))
                }
                _ => None,
            }
        };

        match written {
            Some(Ok(())) => {
                logging::log_line(&self.transcript, Direction::Stdin, line);
                Ok(())
            }
            Some(Err(e)) => Err(SidecarError::Write(e)),
            None => match self.lock_state().status {
                AdapterStatus::Unavailable => Err(SidecarError::Unavailable),
                _ => Err(SidecarError::Restarting),
            },
        }
    }

    /// Install a new child and start reading from it.
    fn attach(self: &Arc<Self>, link: SidecarLink) {
        let SidecarLink { writer, events } = link;

        let generation = {
            let mut state = self.lock_state();
            if state.shutting_down {
                drop(state);
                let mut writer = writer;
                writer.shutdown();
                return;
            }
            let generation = state.generation + 1;
            *self.lock_writer() = Some(WriterSlot { generation, writer });
            state.generation = generation;
            state.status = AdapterStatus::Running;
            generation
        };

        let shared = Arc::clone(self);
        thread::spawn(move || shared.read_child(generation, events));
    }

    fn read_child(self: Arc<Self>, generation: u64, events: Receiver<ProcessEvent>) {
        let mut decoder = LineDecoder::new();
        let mut stdout_closed = false;
        let mut exit: Option<ChildExit> = None;

        loop {
            let event = if stdout_closed || exit.is_some() {
                match events.recv_timeout(DRAIN_GRACE) {
                    Ok(event) => event,
                    Err(_) => break,
                }
            } else {
                match events.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            };

            match event {
                ProcessEvent::Stdout(line) => {
                    logging::log_line(&self.transcript, Direction::Stdout, &line);
                    for event in decoder.feed(&format!("{line}\n")) {
                        self.deliver(event);
                    }
                }
                ProcessEvent::Stderr(line) => {
                    log::warn!("sidecar stderr: {line}");
                    logging::log_line(&self.transcript, Direction::Stderr, &line);
                }
                ProcessEvent::StdoutClosed => {
                    for event in decoder.flush() {
                        self.deliver(event);
                    }
                    stdout_closed = true;
                    if exit.is_some() {
                        break;
                    }
                }
                ProcessEvent::Exit(status) => {
                    exit = Some(status);
                    if stdout_closed {
                        break;
                    }
                }
            }
        }

        for event in decoder.flush() {
            self.deliver(event);
        }
        self.on_child_gone(generation, exit);
    }

    /// Update bookkeeping, then publish.
    fn deliver(&self, event: Event) {
        {
            let mut state = self.lock_state();
            match &event {
                Event::Pong => state.last_pong = Some(Utc::now()),
                Event::Complete { request_id, .. } => {
                    state.in_flight.remove(request_id);
                    state.interrupted.remove(request_id);
                    state.consecutive_restarts = 0;
                }
                Event::Error { request_id, .. } => {
                    state.in_flight.remove(request_id);
                    state.interrupted.remove(request_id);
                }
                _ => {}
            }
        }
        self.hub.publish(&event);
    }

    fn on_child_gone(self: &Arc<Self>, generation: u64, exit: Option<ChildExit>) {
        let detail = match &exit {
            Some(exit) => format!("Sidecar exited ({exit})"),
            None => "Sidecar closed its output".to_string(),
        };

        let stale = {
            let mut slot = self.lock_writer();
            if slot.as_ref().is_some_and(|s| s.generation == generation) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(mut slot) = stale {
            slot.writer.shutdown();
        }

        let (orphans, next_attempt, shutting_down) = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            let orphans: Vec<RequestId> = state.in_flight.drain().collect();
            state.interrupted.clear();

            let next_attempt = if state.shutting_down
                || state.consecutive_restarts >= self.restart.max_restarts
            {
                state.status = AdapterStatus::Unavailable;
                None
            } else {
                state.consecutive_restarts += 1;
                state.status = AdapterStatus::Restarting;
                Some(state.consecutive_restarts)
            };
            (orphans, next_attempt, state.shutting_down)
        };

        if shutting_down {
            log::info!("{detail}");
        } else {
            log::warn!("{detail}; failing {} in-flight request(s)", orphans.len());
        }
        for request_id in orphans {
            self.hub.publish(&Event::child_exited(request_id, detail.clone()));
        }

        match next_attempt {
            Some(attempt) => self.restart_from(attempt),
            None if !shutting_down => log::error!(
                "Sidecar unavailable after {} restart(s); giving up",
                self.restart.max_restarts
            ),
            None => {}
        }
    }

    fn restart_from(self: &Arc<Self>, mut attempt: u32) {
        loop {
            let delay = self.restart.delay_for(attempt);
            log::warn!(
                "Restarting sidecar in {delay:?} (attempt {attempt} of {})",
                self.restart.max_restarts
            );
            thread::sleep(delay);

            if self.lock_state().shutting_down {
                return;
            }

            match self.launcher.launch() {
                Ok(link) => {
                    log::info!("Sidecar restarted ({})", self.launcher.describe());
                    self.attach(link);
                    return;
                }
                Err(e) => {
                    log::error!("Sidecar restart failed: {e}");
                    let mut state = self.lock_state();
                    if state.shutting_down
                        || state.consecutive_restarts >= self.restart.max_restarts
                    {
                        state.status = AdapterStatus::Unavailable;
                        log::error!("Sidecar unavailable; giving up");
                        return;
                    }
                    state.consecutive_restarts += 1;
                    attempt = state.consecutive_restarts;
                }
            }
        }
    }
}
