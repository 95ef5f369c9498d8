//! Call signaling for Chatwire.
//!
//! Each call is a small state machine:
//!
//! ```text
//! (none) --initiate--> ringing
//! ringing --accept--> active
//! ringing --decline--> declined        [terminal]
//! ringing --timeout--> missed          [terminal]
//! ringing --end/cancel--> ended        [terminal]
//! active  --end/peer disconnect--> ended [terminal]
//! ```
//!
//! A session is guarded by its own mutex; the state change and the
//! notifications it causes happen under that lock, so racing accepts from
//! two devices resolve to exactly one winner. Terminal sessions leave the
//! live table, and an unknown call ID is treated as already terminal.

use crate::connection::{ConnectionId, Delivery};
use crate::event::{now_millis, ServerEvent};
use crate::registry::{ConnectionRegistry, UserId};
use crate::store::StoreEvent;
use chatwire_protocol::{CallEndReason, CallType, EventKind, SignalKind};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A call identifier.
pub type CallId = String;

/// Default time a call may ring before it is marked missed.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(45);

/// State of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Active,
    Ended,
    Declined,
    Missed,
}

impl CallState {
    /// Terminal states accept no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Declined | CallState::Missed)
    }
}

/// Rejections returned by the engine. None of them has side effects.
#[derive(Debug, Error)]
pub enum CallError {
    /// The pair already has a ringing or active call.
    #[error("Call already in progress: {call_id}")]
    CallAlreadyInProgress { call_id: CallId },

    /// Another device of the recipient accepted first.
    #[error("Call already accepted elsewhere: {0}")]
    AlreadyAcceptedElsewhere(CallId),

    /// The call has ended or never existed.
    #[error("Call is over or unknown: {0}")]
    CallClosed(CallId),

    /// The call is live but the action does not apply to its state.
    #[error("Cannot {action} call {call_id} while {state:?}")]
    InvalidTransition {
        call_id: CallId,
        state: CallState,
        action: &'static str,
    },

    /// The acting user is not allowed to perform this action.
    #[error("Not a participant of call {0}")]
    NotParticipant(CallId),

    /// The recipient is invalid (e.g. calling yourself).
    #[error("Invalid call recipient: {0}")]
    InvalidRecipient(UserId),

    /// The acting connection is not attached or not authenticated.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Call engine configuration.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long a call may ring unanswered.
    pub ring_timeout: Duration,
    /// Capacity of the terminal call record stream.
    pub record_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: DEFAULT_RING_TIMEOUT,
            record_capacity: 1024,
        }
    }
}

/// Snapshot of a call session, also the record handed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: CallId,
    pub caller_user_id: UserId,
    pub recipient_user_id: UserId,
    pub call_type: CallType,
    pub state: CallState,
    pub started_at: u64,
    pub accepted_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub duration_seconds: u64,
    pub end_reason: Option<CallEndReason>,
}

/// Authoritative state of one call.
#[derive(Debug)]
struct CallSession {
    record: CallRecord,
    caller_connection: Option<ConnectionId>,
    answered_by: Option<ConnectionId>,
    timer: Option<AbortHandle>,
}

impl CallSession {
    fn is_participant(&self, user_id: &str) -> bool {
        self.record.caller_user_id == user_id || self.record.recipient_user_id == user_id
    }

    fn other_party(&self, user_id: &str) -> &str {
        if self.record.caller_user_id == user_id {
            &self.record.recipient_user_id
        } else {
            &self.record.caller_user_id
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Move into a terminal state. The state itself is the single-assignment
    /// guard: once terminal, every later transition (including a timer that
    /// fired concurrently) is refused.
    fn resolve(&mut self, state: CallState, reason: Option<CallEndReason>) {
        debug_assert!(state.is_terminal());
        self.cancel_timer();
        self.record.state = state;
        self.record.ended_at = Some(now_millis());
        self.record.end_reason = reason;
    }
}

fn lock(session: &Mutex<CallSession>) -> MutexGuard<'_, CallSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pair_key(a: &str, b: &str) -> (UserId, UserId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Drives call sessions and relays WebRTC signaling between the parties.
pub struct CallSignalingEngine {
    calls: DashMap<CallId, Arc<Mutex<CallSession>>>,
    /// Live call per unordered user pair.
    pairs: DashMap<(UserId, UserId), CallId>,
    /// Live calls per bound connection (placing or answering device).
    by_connection: DashMap<ConnectionId, HashSet<CallId>>,
    registry: Arc<ConnectionRegistry>,
    records: broadcast::Sender<CallRecord>,
    store_feed: OnceLock<mpsc::UnboundedSender<StoreEvent>>,
    config: CallConfig,
}

impl CallSignalingEngine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_config(registry, CallConfig::default())
    }

    /// Create an engine with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<ConnectionRegistry>, config: CallConfig) -> Self {
        let (records, _) = broadcast::channel(config.record_capacity.max(1));
        Self {
            calls: DashMap::new(),
            pairs: DashMap::new(),
            by_connection: DashMap::new(),
            registry,
            records,
            store_feed: OnceLock::new(),
            config,
        }
    }

    /// Subscribe to records of calls as they reach a terminal state.
    #[must_use]
    pub fn subscribe_records(&self) -> broadcast::Receiver<CallRecord> {
        self.records.subscribe()
    }

    /// Send every terminal call record to `feed`.
    ///
    /// Returns `false` if a feed is already attached.
    pub fn feed_store(&self, feed: mpsc::UnboundedSender<StoreEvent>) -> bool {
        self.store_feed.set(feed).is_ok()
    }

    /// Start ringing `recipient` on every one of their devices.
    ///
    /// `caller_connection` binds the call to the device that placed it, so
    /// the call ends if that device disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::CallAlreadyInProgress`] if the two users already
    /// have a ringing or active call, or [`CallError::InvalidRecipient`] for
    /// a self-call.
    pub fn initiate(
        self: &Arc<Self>,
        caller: &str,
        recipient: &str,
        call_type: CallType,
        caller_connection: Option<ConnectionId>,
    ) -> Result<CallId, CallError> {
        if caller == recipient || recipient.is_empty() {
            return Err(CallError::InvalidRecipient(recipient.to_string()));
        }

        let call_id: CallId = Uuid::new_v4().to_string();
        let record = CallRecord {
            call_id: call_id.clone(),
            caller_user_id: caller.to_string(),
            recipient_user_id: recipient.to_string(),
            call_type,
            state: CallState::Ringing,
            started_at: now_millis(),
            accepted_at: None,
            ended_at: None,
            duration_seconds: 0,
            end_reason: None,
        };
        let session = Arc::new(Mutex::new(CallSession {
            record,
            caller_connection: caller_connection.clone(),
            answered_by: None,
            timer: None,
        }));

        match self.pairs.entry(pair_key(caller, recipient)) {
            Entry::Occupied(o) => {
                debug!(caller = %caller, recipient = %recipient, existing = %o.get(), "Call already in progress");
                return Err(CallError::CallAlreadyInProgress {
                    call_id: o.get().clone(),
                });
            }
            Entry::Vacant(v) => {
                if let Some(connection_id) = &caller_connection {
                    self.bind_connection(connection_id, &call_id);
                }
                self.calls.insert(call_id.clone(), Arc::clone(&session));
                v.insert(call_id.clone());
            }
        }

        let mut guard = lock(&session);
        guard.timer = self.schedule_timeout(&call_id);

        let payload = json!({
            "call_id": call_id,
            "caller_id": caller,
            "recipient_id": recipient,
            "call_type": call_type,
            "started_at": guard.record.started_at,
        });
        let delivery = self.notify(recipient, EventKind::IncomingCall, payload, None);

        info!(
            call = %call_id,
            caller = %caller,
            recipient = %recipient,
            devices = delivery.delivered,
            "Call ringing"
        );
        Ok(call_id)
    }

    /// Accept a ringing call from one of the recipient's connections.
    ///
    /// The first accept wins; the caller is told once and the recipient's
    /// other devices are told to stop ringing.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::AlreadyAcceptedElsewhere`] if another device won,
    /// [`CallError::CallClosed`] for ended or unknown calls, and
    /// [`CallError::NotParticipant`] if the connection is not the recipient's.
    pub fn accept(
        &self,
        call_id: &str,
        accepting_connection: &ConnectionId,
    ) -> Result<CallRecord, CallError> {
        let user = self
            .registry
            .user_of(accepting_connection)
            .ok_or_else(|| CallError::UnknownConnection(accepting_connection.clone()))?;

        self.with_live_call(call_id, |session| {
            if session.record.recipient_user_id != user {
                return Err(CallError::NotParticipant(call_id.to_string()));
            }
            if session.record.state == CallState::Active {
                return Err(CallError::AlreadyAcceptedElsewhere(call_id.to_string()));
            }

            session.cancel_timer();
            session.record.state = CallState::Active;
            session.record.accepted_at = Some(now_millis());
            session.answered_by = Some(accepting_connection.clone());
            self.bind_connection(accepting_connection, call_id);

            let caller = session.record.caller_user_id.clone();
            self.notify(
                &caller,
                EventKind::CallAccepted,
                json!({ "call_id": call_id, "recipient_id": user }),
                None,
            );
            self.notify(
                &user,
                EventKind::CallAlreadyAcceptedElsewhere,
                json!({ "call_id": call_id }),
                Some(accepting_connection),
            );

            info!(call = %call_id, connection = %accepting_connection, "Call accepted");
            Ok(session.record.clone())
        })
    }

    /// Decline a ringing call. Only the recipient may decline.
    ///
    /// The caller is told, and so are the recipient's other devices, which
    /// stop ringing. `declining_connection` is spared that second push.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is not ringing or `by_user` is not the recipient.
    pub fn decline(
        &self,
        call_id: &str,
        by_user: &str,
        declining_connection: Option<&ConnectionId>,
    ) -> Result<CallRecord, CallError> {
        let record = self.with_live_call(call_id, |session| {
            if session.record.recipient_user_id != by_user {
                return Err(CallError::NotParticipant(call_id.to_string()));
            }
            if session.record.state != CallState::Ringing {
                return Err(CallError::InvalidTransition {
                    call_id: call_id.to_string(),
                    state: session.record.state,
                    action: "decline",
                });
            }

            session.resolve(CallState::Declined, None);
            let payload = json!({ "call_id": call_id, "recipient_id": by_user });
            self.notify(
                &session.record.caller_user_id,
                EventKind::CallDeclined,
                payload.clone(),
                None,
            );
            self.notify(by_user, EventKind::CallDeclined, payload, declining_connection);
            self.retire(session);
            Ok(session.record.clone())
        })?;

        info!(call = %call_id, "Call declined");
        self.publish_record(record.clone());
        Ok(record)
    }

    /// End a ringing or active call. Either participant may end it.
    ///
    /// `duration_seconds` is recorded only if the call had been accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is over or unknown, or `by_user` is not a participant.
    pub fn end(
        &self,
        call_id: &str,
        by_user: &str,
        duration_seconds: u64,
    ) -> Result<CallRecord, CallError> {
        let record = self.with_live_call(call_id, |session| {
            if !session.is_participant(by_user) {
                return Err(CallError::NotParticipant(call_id.to_string()));
            }

            let reason = if session.record.state == CallState::Ringing
                && session.record.caller_user_id == by_user
            {
                CallEndReason::CallerCancel
            } else {
                CallEndReason::Hangup
            };
            if session.record.state == CallState::Active {
                session.record.duration_seconds = duration_seconds;
            }
            session.resolve(CallState::Ended, Some(reason));
            self.notify_ended(session);
            self.retire(session);
            Ok(session.record.clone())
        })?;

        info!(call = %call_id, duration = record.duration_seconds, "Call ended");
        self.publish_record(record.clone());
        Ok(record)
    }

    /// Forward an SDP offer/answer or ICE candidate to the other party.
    ///
    /// The payload is not interpreted.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is over or unknown, or `from_user` is not a participant.
    pub fn relay_signal(
        &self,
        call_id: &str,
        from_user: &str,
        kind: SignalKind,
        payload: Value,
    ) -> Result<Delivery, CallError> {
        let result = self.with_live_call(call_id, |session| {
            if !session.is_participant(from_user) {
                return Err(CallError::NotParticipant(call_id.to_string()));
            }
            let target = session.other_party(from_user).to_string();
            Ok(self.notify(
                &target,
                kind.event_kind(),
                json!({ "call_id": call_id, "from": from_user, "payload": payload }),
                None,
            ))
        });

        if let Err(e) = &result {
            debug!(call = %call_id, from = %from_user, kind = ?kind, error = %e, "Signal dropped");
        }
        result
    }

    /// Mark a still-ringing call as missed and tell the caller.
    ///
    /// Returns `false` if the call was already resolved.
    pub fn expire(&self, call_id: &str) -> bool {
        let record = self.with_live_call(call_id, |session| {
            if session.record.state != CallState::Ringing {
                return Err(CallError::InvalidTransition {
                    call_id: call_id.to_string(),
                    state: session.record.state,
                    action: "expire",
                });
            }
            // The timer task is the one running us; dropping its handle is enough.
            session.timer = None;
            session.resolve(CallState::Missed, None);
            self.notify(
                &session.record.caller_user_id,
                EventKind::CallMissed,
                json!({ "call_id": call_id, "recipient_id": session.record.recipient_user_id }),
                None,
            );
            self.retire(session);
            Ok(session.record.clone())
        });

        match record {
            Ok(record) => {
                info!(call = %call_id, "Call missed");
                self.publish_record(record);
                true
            }
            Err(_) => false,
        }
    }

    /// End every live call bound to a connection that went away.
    ///
    /// An active call ends with `peer_disconnect`; a ringing call whose
    /// caller device left ends with `caller_cancel`.
    pub fn on_connection_closed(&self, connection_id: &ConnectionId) -> Vec<CallRecord> {
        let bound: Vec<CallId> = self
            .by_connection
            .get(connection_id)
            .map(|calls| calls.iter().cloned().collect())
            .unwrap_or_default();

        let mut ended = Vec::new();
        for call_id in bound {
            let Some(session) = self.calls.get(&call_id).map(|e| Arc::clone(e.value())) else {
                continue;
            };
            let mut session = lock(&session);
            if session.record.state.is_terminal() {
                continue;
            }
            let is_caller_device = session.caller_connection.as_ref() == Some(connection_id);
            let is_answering_device = session.answered_by.as_ref() == Some(connection_id);

            let reason = match session.record.state {
                CallState::Active if is_caller_device || is_answering_device => {
                    CallEndReason::PeerDisconnect
                }
                CallState::Ringing if is_caller_device => CallEndReason::CallerCancel,
                _ => continue,
            };

            session.resolve(CallState::Ended, Some(reason));
            self.notify_ended(&session);
            self.retire(&session);
            info!(call = %call_id, connection = %connection_id, reason = ?reason, "Call ended by disconnect");
            ended.push(session.record.clone());
        }

        self.by_connection.remove(connection_id);

        for record in &ended {
            self.publish_record(record.clone());
        }
        ended
    }

    /// Snapshot of a live call.
    #[must_use]
    pub fn session(&self, call_id: &str) -> Option<CallRecord> {
        let session = self.calls.get(call_id).map(|e| Arc::clone(e.value()))?;
        let session = lock(&session);
        Some(session.record.clone())
    }

    /// Current state of a live call; `None` once it is over.
    #[must_use]
    pub fn state_of(&self, call_id: &str) -> Option<CallState> {
        self.session(call_id).map(|r| r.state)
    }

    /// The live call between two users, if any.
    #[must_use]
    pub fn call_between(&self, a: &str, b: &str) -> Option<CallId> {
        self.pairs.get(&pair_key(a, b)).map(|id| id.clone())
    }

    /// Number of ringing or active calls.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.calls.len()
    }

    /// Run `f` on a live session under its lock.
    fn with_live_call<R>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut CallSession) -> Result<R, CallError>,
    ) -> Result<R, CallError> {
        let session = self
            .calls
            .get(call_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CallError::CallClosed(call_id.to_string()))?;

        let mut session = lock(&session);
        // Resolved between the lookup and taking the lock.
        if session.record.state.is_terminal() {
            return Err(CallError::CallClosed(call_id.to_string()));
        }
        f(&mut *session)
    }

    /// Drop a terminal session from the live tables.
    fn retire(&self, session: &CallSession) {
        let call_id = &session.record.call_id;
        self.calls.remove(call_id);
        self.pairs.remove_if(
            &pair_key(&session.record.caller_user_id, &session.record.recipient_user_id),
            |_, live| live == call_id,
        );
        for connection_id in [&session.caller_connection, &session.answered_by]
            .into_iter()
            .flatten()
        {
            self.unbind_connection(connection_id, call_id);
        }
    }

    fn bind_connection(&self, connection_id: &ConnectionId, call_id: &str) {
        self.by_connection
            .entry(connection_id.clone())
            .or_default()
            .insert(call_id.to_string());
    }

    fn unbind_connection(&self, connection_id: &ConnectionId, call_id: &str) {
        if let Some(mut calls) = self.by_connection.get_mut(connection_id) {
            calls.remove(call_id);
        }
        self.by_connection
            .remove_if(connection_id, |_, calls| calls.is_empty());
    }

    fn notify_ended(&self, session: &CallSession) {
        let payload = json!({
            "call_id": session.record.call_id,
            "duration": session.record.duration_seconds,
            "reason": session.record.end_reason,
        });
        self.notify(
            &session.record.caller_user_id,
            EventKind::CallEnded,
            payload.clone(),
            None,
        );
        self.notify(
            &session.record.recipient_user_id,
            EventKind::CallEnded,
            payload,
            None,
        );
    }

    fn notify(
        &self,
        user_id: &str,
        kind: EventKind,
        payload: Value,
        except: Option<&ConnectionId>,
    ) -> Delivery {
        self.registry
            .push_to_user(user_id, Arc::new(ServerEvent::new(kind, payload)), except)
    }

    fn publish_record(&self, record: CallRecord) {
        if let Some(feed) = self.store_feed.get() {
            let _ = feed.send(StoreEvent::CallRecord(record.clone()));
        }
        // No subscribers is fine.
        let _ = self.records.send(record);
    }

    fn schedule_timeout(self: &Arc<Self>, call_id: &str) -> Option<AbortHandle> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(call = %call_id, "No runtime, ring timeout disabled");
            return None;
        };

        let engine: Weak<Self> = Arc::downgrade(self);
        let call_id = call_id.to_string();
        let timeout = self.config.ring_timeout;
        let task = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(engine) = engine.upgrade() {
                engine.expire(&call_id);
            }
        });
        Some(task.abort_handle())
    }
}
