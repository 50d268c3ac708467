//! Session orchestrator.
//!
//! Owns the connection-id → live session map. Sessions are created on first
//! use and replaced by handoff-reconnect before the upstream time limit
//! runs out, either when the next client message finds the clock low or
//! when the session's reconnect timer fires during a quiet period.

mod handoff;

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::session::{
    LiveSession, ReconnectCallback, SessionDeps, SessionMode, SessionSnapshot, SessionState,
};
use crate::websocket::{EventSink, ServerEvent};

pub use handoff::build_handoff;

/// Per-connection slot. The lock is held for the whole of a create or
/// handoff so messages for one connection never race a reconnect.
struct SessionSlot {
    session: Option<Arc<LiveSession>>,
    sink: EventSink,
    mode: SessionMode,
    /// State parked after a failed handoff, retried on the next message
    pending_restore: Option<SessionSnapshot>,
}

pub struct SessionOrchestrator {
    deps: SessionDeps,
    slots: DashMap<String, Arc<Mutex<SessionSlot>>>,
}

impl SessionOrchestrator {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            slots: DashMap::new(),
        })
    }

    fn slot(&self, conn_id: &str, sink: &EventSink) -> Arc<Mutex<SessionSlot>> {
        self.slots
            .entry(conn_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionSlot {
                    session: None,
                    sink: sink.clone(),
                    mode: SessionMode::default(),
                    pending_restore: None,
                }))
            })
            .clone()
    }

    /// Return the connection's live session, creating it or handing off to
    /// a fresh one when the current one is about to expire or has dropped.
    pub async fn session_for(
        self: &Arc<Self>,
        conn_id: &str,
        mode_hint: Option<SessionMode>,
        sink: &EventSink,
    ) -> ServiceResult<Arc<LiveSession>> {
        let slot = self.slot(conn_id, sink);
        let mut slot = slot.lock().await;
        if let Some(mode) = mode_hint {
            slot.mode = mode;
            if let Some(session) = &slot.session {
                session.with_state(|state| state.mode = mode).await;
            }
        }

        if let Some(session) = slot.session.clone() {
            if !session.is_active() {
                info!(conn_id = %conn_id, "Live session dropped, reconnecting");
                return self.handoff(conn_id, &mut slot, "inactive").await;
            }
            if session.should_reconnect().await {
                return self.handoff(conn_id, &mut slot, "timeout").await;
            }
            return Ok(session);
        }

        if slot.pending_restore.is_some() {
            info!(conn_id = %conn_id, "Retrying restore of parked session state");
            return self.handoff(conn_id, &mut slot, "retry").await;
        }

        let state = SessionState::new(
            conn_id,
            slot.mode,
            self.deps.config.session.history_limit,
        );
        let session = Arc::new(LiveSession::new(state, self.deps.clone()));
        if let Err(e) = self.launch(conn_id, &session, &slot.sink, None).await {
            session.close().await;
            return Err(e);
        }
        slot.session = Some(session.clone());
        metrics::gauge!("opticia_live_sessions").increment(1.0);
        info!(conn_id = %conn_id, mode = %slot.mode, "Session created");
        Ok(session)
    }

    /// The connection's current session, without creating or reconnecting
    pub async fn current(&self, conn_id: &str) -> Option<Arc<LiveSession>> {
        let slot = self.slots.get(conn_id)?.clone();
        let slot = slot.lock().await;
        slot.session.clone()
    }

    /// Record the modality for the connection and its live session.
    /// Returns the previous mode.
    pub async fn set_mode(&self, conn_id: &str, mode: SessionMode, sink: &EventSink) -> SessionMode {
        let slot = self.slot(conn_id, sink);
        let mut slot = slot.lock().await;
        let previous = std::mem::replace(&mut slot.mode, mode);
        if let Some(session) = &slot.session {
            session.with_state(|state| state.mode = mode).await;
        }
        previous
    }

    /// Start a session, send the handoff text if any, then arm its receive
    /// loop and reconnect timer
    async fn launch(
        self: &Arc<Self>,
        conn_id: &str,
        session: &Arc<LiveSession>,
        sink: &EventSink,
        handoff: Option<String>,
    ) -> ServiceResult<()> {
        session.start().await?;
        if let Some(text) = handoff {
            session.send_instruction(&text, false)?;
        }
        session.start_receive_loop(sink.clone()).await?;
        session
            .schedule_reconnect_timer(self.reconnect_callback(conn_id, session))
            .await;
        Ok(())
    }

    fn reconnect_callback(
        self: &Arc<Self>,
        conn_id: &str,
        session: &Arc<LiveSession>,
    ) -> ReconnectCallback {
        let orchestrator = Arc::downgrade(self);
        let armed_for = Arc::downgrade(session);
        let conn_id = conn_id.to_string();
        Arc::new(move || {
            let Some(orchestrator) = orchestrator.upgrade() else {
                return;
            };
            let armed_for = armed_for.clone();
            let conn_id = conn_id.clone();
            tokio::spawn(async move {
                orchestrator.reconnect_due(&conn_id, armed_for).await;
            });
        })
    }

    /// Timer-driven handoff. Skipped when the session that armed the timer
    /// has already been replaced or closed.
    async fn reconnect_due(self: &Arc<Self>, conn_id: &str, armed_for: Weak<LiveSession>) {
        let Some(slot) = self.slots.get(conn_id).map(|s| s.clone()) else {
            return;
        };
        let mut slot = slot.lock().await;
        let armed_is_current = match (&slot.session, armed_for.upgrade()) {
            (Some(current), Some(armed)) => Arc::ptr_eq(current, &armed),
            _ => false,
        };
        if !armed_is_current {
            debug!(conn_id = %conn_id, "Reconnect timer for a retired session");
            return;
        }

        if let Err(e) = self.handoff(conn_id, &mut slot, "timer").await {
            error!(conn_id = %conn_id, error = %e, "Timer-driven reconnect failed");
            slot.sink.publish(ServerEvent::error(
                e.error_code(),
                e.to_string(),
                e.recoverable(),
            ));
        }
    }

    /// Replace the slot's session with a new one restored from its state
    async fn handoff(
        self: &Arc<Self>,
        conn_id: &str,
        slot: &mut SessionSlot,
        trigger: &'static str,
    ) -> ServiceResult<Arc<LiveSession>> {
        let snapshot = match slot.session.take() {
            Some(old) => {
                let remaining = old.time_remaining().await;
                slot.sink.publish(ServerEvent::SessionReconnecting {
                    time_remaining: remaining.as_secs(),
                });
                // Closing joins the receive loop, which flushes a pending turn
                old.close().await;
                let snapshot = old.snapshot().await;
                metrics::gauge!("opticia_live_sessions").decrement(1.0);
                snapshot
            }
            None => {
                let Some(snapshot) = slot.pending_restore.take() else {
                    return Err(ServiceError::SessionNotActive {
                        session_id: conn_id.to_string(),
                    });
                };
                slot.sink
                    .publish(ServerEvent::SessionReconnecting { time_remaining: 0 });
                snapshot
            }
        };
        info!(
            conn_id = %conn_id,
            trigger,
            history = snapshot.history.len(),
            "Handing off session"
        );

        let state = SessionState::restore(snapshot.clone(), self.deps.config.session.history_limit);
        let handoff = (state.history_len() > 0)
            .then(|| build_handoff(&state, &self.deps.config.handoff));
        let session = Arc::new(LiveSession::new(state, self.deps.clone()));

        if let Err(e) = self.launch(conn_id, &session, &slot.sink, handoff).await {
            session.close().await;
            slot.pending_restore = Some(snapshot);
            warn!(conn_id = %conn_id, error = %e, "Handoff failed, state parked for retry");
            return Err(match e {
                ServiceError::UpstreamUnavailable(source) => ServiceError::ReconnectFailed {
                    session_id: conn_id.to_string(),
                    source,
                },
                other => other,
            });
        }

        slot.session = Some(session.clone());
        slot.pending_restore = None;
        metrics::gauge!("opticia_live_sessions").increment(1.0);
        metrics::counter!("opticia_reconnects_total", "trigger" => trigger).increment(1);
        slot.sink.publish(ServerEvent::SessionReconnected {});
        info!(conn_id = %conn_id, trigger, "Session handed off");
        Ok(session)
    }

    /// Close and forget the connection's session and any parked state
    pub async fn close_session(&self, conn_id: &str) -> bool {
        let Some((_, slot)) = self.slots.remove(conn_id) else {
            return false;
        };
        let session = slot.lock().await.session.take();
        match session {
            Some(session) => {
                session.close().await;
                metrics::gauge!("opticia_live_sessions").decrement(1.0);
                info!(conn_id = %conn_id, "Session closed");
                true
            }
            None => false,
        }
    }

    /// Connections with a slot, live or parked
    pub fn session_count(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    async fn has_pending_restore(&self, conn_id: &str) -> bool {
        match self.slots.get(conn_id).map(|s| s.clone()) {
            Some(slot) => slot.lock().await.pending_restore.is_some(),
            None => false,
        }
    }
}
