//! SessionManager: owns every resident session actor and routes sidecar
//! events to them.
//!
//! Switching the active session only changes which one is in view; sessions
//! in the background keep streaming and keep receiving their events. Idle
//! background sessions are evicted down to the [`RetentionPolicy`] and
//! rehydrated from the message sink when activated again. Each session's
//! [`SessionIndexEntry`] is kept current in the sink, so the backend session
//! to resume and the recent-session listing outlive eviction and restarts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::actor::{ActorStep, SessionActor, SessionSnapshot};
use super::creator::{SessionCreator, SessionRecord};
use super::machine::{SessionState, TransitionError};
use super::message::Message;
use super::SessionError;
use crate::event_bus::EventBus;
use crate::ids::{derive_conversation_id, ConversationId, RequestId, SessionId, SessionType};
use crate::persistence::{sort_recent, MessageSink, SessionIndexEntry};
use crate::protocol::{codes, Command, Event, QueryOptions};
use crate::sidecar::CommandDispatcher;

/// How many actors stay in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// `None` keeps every actor.
    pub max_resident_sessions: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_resident_sessions: Some(16),
        }
    }
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_resident_sessions: None,
        }
    }

    pub fn keep(max_resident_sessions: usize) -> Self {
        Self {
            max_resident_sessions: Some(max_resident_sessions),
        }
    }
}

/// One line of [`SessionManager::list_sessions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub display_name: Option<String>,
    pub state: SessionState,
    pub has_active_request: bool,
    pub is_active: bool,
}

/// One line of [`SessionManager::list_recent_sessions`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentSession {
    #[serde(flatten)]
    pub entry: SessionIndexEntry,
    pub is_resident: bool,
    pub is_active: bool,
}

struct ActorSlot {
    actor: SessionActor,
    entry: SessionIndexEntry,
    last_touched: u64,
}

pub struct SessionManager {
    actors: HashMap<SessionId, ActorSlot>,
    requests: HashMap<RequestId, SessionId>,
    active: Option<SessionId>,
    retention: RetentionPolicy,
    clock: u64,
    creator: Arc<dyn SessionCreator>,
    dispatcher: Arc<dyn CommandDispatcher>,
    sink: Arc<dyn MessageSink>,
    event_bus: Option<Arc<EventBus>>,
    default_options: QueryOptions,
}

impl SessionManager {
    pub fn new(
        creator: Arc<dyn SessionCreator>,
        dispatcher: Arc<dyn CommandDispatcher>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            actors: HashMap::new(),
            requests: HashMap::new(),
            active: None,
            retention: RetentionPolicy::default(),
            clock: 0,
            creator,
            dispatcher,
            sink,
            event_bus: None,
            default_options: QueryOptions::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Query options given to sessions created from now on.
    pub fn with_default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = options;
        self
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Make `session_id` the active session, loading it if it is not
    /// resident. The previously active session is left untouched.
    pub fn activate(&mut self, session_id: &SessionId) -> Result<&SessionActor, SessionError> {
        let conversation_id = derive_conversation_id(session_id)?;

        if !self.actors.contains_key(session_id) {
            self.load(session_id, conversation_id, None);
        }
        self.touch(session_id);
        self.record(session_id, 0, true);

        if self.active.as_ref() != Some(session_id) {
            log::debug!("Active session: {session_id}");
            self.active = Some(session_id.clone());
            if let Some(bus) = &self.event_bus {
                bus.emit_active_changed(session_id);
            }
        }
        self.reclaim();

        self.actors
            .get(session_id)
            .map(|slot| &slot.actor)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    /// Create a session through the creator and register it idle, without
    /// activating it.
    pub fn create_session(
        &mut self,
        session_type: SessionType,
        project_id: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        let record = self.creator.create_session(session_type, project_id)?;

        let derived = derive_conversation_id(&record.session_id)?;
        if derived != record.conversation_id {
            return Err(SessionError::Create(format!(
                "Creator returned conversation id {} for {}, expected {derived}",
                record.conversation_id, record.session_id
            )));
        }

        if !self.actors.contains_key(&record.session_id) {
            self.load(&record.session_id, derived, Some(&record.display_name));
        }
        self.touch(&record.session_id);
        self.record(&record.session_id, 0, true);
        log::info!("Created session {} ({})", record.session_id, record.display_name);

        Ok(record)
    }

    /// Create a session and make it the active one.
    pub fn create_new_session(
        &mut self,
        session_type: SessionType,
        project_id: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        let record = self.create_session(session_type, project_id)?;
        self.activate(&record.session_id)?;
        self.publish(&record.session_id);
        Ok(record)
    }

    /// Switch the view to another session and return its snapshot.
    pub fn switch_session(&mut self, session_id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        Ok(self.activate(session_id)?.snapshot())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Send a prompt and return the request id it was issued under.
    pub fn send_message(
        &mut self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<RequestId, SessionError> {
        let step = self.actor_mut(session_id)?.send(text)?;
        self.issue(session_id, step)
    }

    /// Resubmit the last prompt after a recoverable error.
    pub fn retry(&mut self, session_id: &SessionId) -> Result<RequestId, SessionError> {
        let step = self.actor_mut(session_id)?.retry()?;
        self.issue(session_id, step)
    }

    /// Interrupt the session's outstanding request. `Ok(false)` when there is
    /// nothing to interrupt.
    pub fn cancel(&mut self, session_id: &SessionId) -> Result<bool, SessionError> {
        let Some(Command::Interrupt { request_id }) = self.actor_mut(session_id)?.cancel() else {
            return Ok(false);
        };
        log::info!("Interrupting {request_id} in {session_id}");
        Ok(self.dispatcher.interrupt(&request_id)?)
    }

    /// Clear a finished or failed session back to idle.
    pub fn reset(&mut self, session_id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        self.actor_mut(session_id)?.reset()?;
        self.record(session_id, 0, true);
        self.publish(session_id);
        self.snapshot(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    // ------------------------------------------------------------------
    // Event routing
    // ------------------------------------------------------------------

    /// Deliver one sidecar event to the session that issued its request.
    pub fn route_event(&mut self, event: &Event) {
        let Some(request_id) = event.request_id() else {
            return;
        };
        let Some(session_id) = self.requests.get(request_id).cloned() else {
            log::warn!("Dropping {} for unknown request {request_id}", event.kind());
            return;
        };

        if event.is_terminal() {
            self.requests.remove(request_id);
        }
        self.deliver(&session_id, event);
        if event.is_terminal() {
            self.reclaim();
        }
    }

    /// Evict idle background actors beyond the retention limit, least
    /// recently touched first. Returns the evicted ids.
    pub fn reclaim(&mut self) -> Vec<SessionId> {
        let Some(limit) = self.retention.max_resident_sessions else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        while self.actors.len() > limit {
            let candidate = self
                .actors
                .iter()
                .filter(|(id, slot)| {
                    self.active.as_ref() != Some(*id) && !slot.actor.has_active_request()
                })
                .min_by_key(|(_, slot)| slot.last_touched)
                .map(|(id, _)| id.clone());

            let Some(session_id) = candidate else {
                break;
            };
            self.actors.remove(&session_id);
            log::debug!("Evicted idle session {session_id}");
            if let Some(bus) = &self.event_bus {
                bus.emit_evicted(&session_id);
            }
            evicted.push(session_id);
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionActor> {
        self.actors.get(session_id).map(|slot| &slot.actor)
    }

    pub fn is_resident(&self, session_id: &SessionId) -> bool {
        self.actors.contains_key(session_id)
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.get(session_id).map(SessionActor::snapshot)
    }

    pub fn active_session_id(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    pub fn active_snapshot(&self) -> Option<SessionSnapshot> {
        self.active.as_ref().and_then(|id| self.snapshot(id))
    }

    /// Owner of an outstanding request.
    pub fn request_owner(&self, request_id: &RequestId) -> Option<&SessionId> {
        self.requests.get(request_id)
    }

    /// Resident sessions, ordered by id.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .actors
            .values()
            .map(|slot| SessionSummary {
                session_id: slot.actor.session_id().clone(),
                conversation_id: slot.actor.conversation_id().clone(),
                display_name: slot.actor.display_name().map(str::to_string),
                state: slot.actor.state(),
                has_active_request: slot.actor.has_active_request(),
                is_active: self.active.as_ref() == Some(slot.actor.session_id()),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Up to `limit` sessions known to the sink or resident, most recently
    /// active first. Evicted sessions are included.
    pub fn list_recent_sessions(&self, limit: usize) -> Vec<RecentSession> {
        let mut entries: HashMap<SessionId, SessionIndexEntry> = match self.sink.list_sessions() {
            Ok(stored) => stored
                .into_iter()
                .map(|entry| (entry.session_id.clone(), entry))
                .collect(),
            Err(e) => {
                log::warn!("Failed to read session index: {e}");
                HashMap::new()
            }
        };
        for slot in self.actors.values() {
            entries.insert(slot.entry.session_id.clone(), slot.entry.clone());
        }

        let mut entries: Vec<SessionIndexEntry> = entries.into_values().collect();
        sort_recent(&mut entries);
        entries.truncate(limit);
        entries
            .into_iter()
            .map(|entry| RecentSession {
                is_resident: self.actors.contains_key(&entry.session_id),
                is_active: self.active.as_ref() == Some(&entry.session_id),
                entry,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Make a session resident from its stored history and index entry.
    fn load(
        &mut self,
        session_id: &SessionId,
        conversation_id: ConversationId,
        display_name: Option<&str>,
    ) {
        let history = match self.sink.load(&conversation_id) {
            Ok(history) => history,
            Err(e) => {
                log::warn!("Failed to load history for {session_id}: {e}");
                Vec::new()
            }
        };
        let stored = match self.sink.load_session(session_id) {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!("Failed to load index entry for {session_id}: {e}");
                None
            }
        };
        let mut entry = stored.unwrap_or_else(|| SessionIndexEntry {
            message_count: history.len(),
            ..SessionIndexEntry::new(session_id.clone(), conversation_id.clone(), Utc::now())
        });
        if let Some(name) = display_name {
            entry.display_name = Some(name.to_string());
        }

        let mut actor = SessionActor::new(session_id.clone(), conversation_id)
            .with_options(self.default_options.clone())
            .with_sdk_session_id(entry.sdk_session_id.clone())
            .with_history(history);
        if let Some(name) = &entry.display_name {
            actor = actor.with_display_name(name.clone());
        }

        self.clock += 1;
        self.actors.insert(
            session_id.clone(),
            ActorSlot {
                actor,
                entry,
                last_touched: self.clock,
            },
        );
    }

    fn touch(&mut self, session_id: &SessionId) {
        self.clock += 1;
        if let Some(slot) = self.actors.get_mut(session_id) {
            slot.last_touched = self.clock;
        }
    }

    fn actor_mut(&mut self, session_id: &SessionId) -> Result<&mut SessionActor, SessionError> {
        self.touch(session_id);
        self.actors
            .get_mut(session_id)
            .map(|slot| &mut slot.actor)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    /// Persist what the actor produced and submit its query. A failed submit
    /// is fed back to the actor as a recoverable `submit_failed` error.
    fn issue(&mut self, session_id: &SessionId, step: ActorStep) -> Result<RequestId, SessionError> {
        let conversation_id = self.actor_mut(session_id)?.conversation_id().clone();
        let appended = self.persist(&conversation_id, &step.persist);
        self.record(session_id, appended, true);

        let mut issued = None;
        for command in step.commands {
            let request_id = command.request_id().cloned();
            if let Some(request_id) = &request_id {
                self.requests.insert(request_id.clone(), session_id.clone());
            }

            if let Err(err) = self.dispatcher.submit(command) {
                log::warn!("Submit for {session_id} failed: {err}");
                if let Some(request_id) = request_id {
                    self.requests.remove(&request_id);
                    let failure = Event::Error {
                        request_id,
                        code: codes::SUBMIT_FAILED.to_string(),
                        message: err.to_string(),
                        recoverable: true,
                    };
                    self.deliver(session_id, &failure);
                }
                return Err(SessionError::Submit(err));
            }
            issued = issued.or(request_id);
        }

        self.publish(session_id);
        issued.ok_or_else(|| {
            SessionError::InvalidTransition(TransitionError::Invalid {
                state: self
                    .get(session_id)
                    .map(SessionActor::state)
                    .unwrap_or_default(),
                input: "SEND",
            })
        })
    }

    fn deliver(&mut self, session_id: &SessionId, event: &Event) {
        let Some(slot) = self.actors.get_mut(session_id) else {
            log::warn!("Dropping {} for non-resident session {session_id}", event.kind());
            return;
        };
        let outcome = slot.actor.dispatch(event);
        let conversation_id = slot.actor.conversation_id().clone();

        let appended = self.persist(&conversation_id, &outcome.persist);
        self.record(session_id, appended, false);
        if outcome.applied {
            if let Some(bus) = &self.event_bus {
                bus.emit_snapshot(&outcome.snapshot);
            }
        }
    }

    /// Append to the sink. Returns how many messages were stored.
    fn persist(&self, conversation_id: &ConversationId, messages: &[Message]) -> usize {
        let mut appended = 0;
        for message in messages {
            match self.sink.append(conversation_id, message) {
                Ok(()) => appended += 1,
                Err(e) => {
                    log::warn!("Failed to persist message {} to {conversation_id}: {e}", message.id)
                }
            }
        }
        appended
    }

    /// Fold new activity into the session's index entry and store it when
    /// something changed. Streaming chunks alone do not rewrite the index.
    fn record(&mut self, session_id: &SessionId, appended: usize, touched: bool) {
        let Some(slot) = self.actors.get_mut(session_id) else {
            return;
        };
        let sdk_session_id = slot.actor.sdk_session_id().map(str::to_string);
        if appended == 0 && !touched && sdk_session_id == slot.entry.sdk_session_id {
            return;
        }

        slot.entry.message_count += appended;
        slot.entry.sdk_session_id = sdk_session_id;
        slot.entry.last_active = Utc::now();
        if let Err(e) = self.sink.save_session(&slot.entry) {
            log::warn!("Failed to update index entry for {session_id}: {e}");
        }
    }

    fn publish(&self, session_id: &SessionId) {
        if let (Some(bus), Some(actor)) = (&self.event_bus, self.get(session_id)) {
            bus.emit_snapshot(&actor.snapshot());
        }
    }
}
