//! Call session coordinator.
//!
//! Tracks the ephemeral state of in-progress call offers, one state machine
//! per call id: `ringing → connected → ended`, with `rejected` and `timed_out`
//! as alternate terminals. Only signaling metadata is tracked — SDP blobs and
//! ICE candidates pass through the dispatcher opaquely and are never stored.
//!
//! An unordered identity-pair guard allows at most one non-terminal session
//! between two identities, which also resolves glare: simultaneous offers
//! from both sides contend on the same pair key and the loser gets
//! `CallAlreadyInProgress`.
//!
//! Terminal sessions are retained briefly (and purged by the cleanup task) so
//! that a late answer is classified as stale and late ICE is silently dropped
//! rather than both turning into unknown-call noise.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{RelayError, Result};

/// Per-call state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Connected,
    Ended,
    Rejected,
    TimedOut,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallState::Ringing | CallState::Connected)
    }
}

/// An ephemeral call attempt between two identities.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// The other participant, if `identity` is one of the two parties.
    pub fn counterpart(&self, identity: &str) -> Option<&str> {
        if identity == self.caller {
            Some(&self.callee)
        } else if identity == self.callee {
            Some(&self.caller)
        } else {
            None
        }
    }

    fn is_participant(&self, identity: &str) -> bool {
        identity == self.caller || identity == self.callee
    }
}

/// Key for the at-most-one-call-per-pair guard, identical for both call
/// directions.
fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}

/// Coordinator over all live call sessions.
#[derive(Clone, Default)]
pub struct CallCoordinator {
    /// call_id → session (terminal sessions linger until purged).
    sessions: Arc<DashMap<String, CallSession>>,
    /// pair key → call_id of the single non-terminal session for that pair.
    active_pairs: Arc<DashMap<String, String>>,
}

impl CallCoordinator {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            active_pairs: Arc::new(DashMap::new()),
        }
    }

    /// Open a new session in `ringing`.
    ///
    /// Callee reachability is the dispatcher's concern and is checked before
    /// this call, so an unreachable callee never leaves a ringing session
    /// behind.
    pub fn offer(&self, call_id: &str, caller: &str, callee: &str) -> Result<CallSession> {
        if caller == callee {
            return Err(RelayError::InvalidMessage(
                "cannot place a call to yourself".to_string(),
            ));
        }
        if self.sessions.contains_key(call_id) {
            return Err(RelayError::StaleSignal(call_id.to_string()));
        }

        // Claim the pair slot first; the entry is atomic per key, so of two
        // simultaneous offers (either direction) exactly one wins.
        match self.active_pairs.entry(pair_key(caller, callee)) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RelayError::CallAlreadyInProgress(
                    caller.to_string(),
                    callee.to_string(),
                ));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(call_id.to_string());
            }
        }

        let session = CallSession {
            call_id: call_id.to_string(),
            caller: caller.to_string(),
            callee: callee.to_string(),
            state: CallState::Ringing,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.sessions.insert(call_id.to_string(), session.clone());

        tracing::info!(call_id = call_id, caller = caller, callee = callee, "Call ringing");
        Ok(session)
    }

    /// `ringing → connected`, valid only from the callee.
    pub fn answer(&self, call_id: &str, who: &str) -> Result<CallSession> {
        let mut session = self
            .sessions
            .get_mut(call_id)
            .ok_or_else(|| RelayError::StaleSignal(call_id.to_string()))?;

        if session.state != CallState::Ringing || who != session.callee {
            return Err(RelayError::StaleSignal(call_id.to_string()));
        }

        session.state = CallState::Connected;
        tracing::info!(call_id = call_id, "Call connected");
        Ok(session.clone())
    }

    /// `ringing → rejected`, valid only from the callee.
    pub fn reject(&self, call_id: &str, who: &str) -> Result<CallSession> {
        self.terminate(call_id, CallState::Rejected, |s| {
            s.state == CallState::Ringing && who == s.callee
        })
    }

    /// `ringing|connected → ended`, from either participant (a caller ending
    /// a still-ringing call is a cancel).
    pub fn end(&self, call_id: &str, who: &str) -> Result<CallSession> {
        self.terminate(call_id, CallState::Ended, |s| {
            !s.state.is_terminal() && s.is_participant(who)
        })
    }

    /// Unilateral `ringing → timed_out`. Returns the session if the timeout
    /// actually fired; `None` means the call was answered or torn down first.
    pub fn timeout_ring(&self, call_id: &str) -> Option<CallSession> {
        self.terminate(call_id, CallState::TimedOut, |s| {
            s.state == CallState::Ringing
        })
        .ok()
    }

    /// Whether ICE for this call may be relayed, and to whom.
    ///
    /// Candidates flow only while the session is ringing or connected and only
    /// between its two participants; anything else is a network-jitter race
    /// and the caller drops the candidate silently.
    pub fn ice_target(&self, call_id: &str, from: &str) -> Option<String> {
        let session = self.sessions.get(call_id)?;
        if session.state.is_terminal() {
            return None;
        }
        session.counterpart(from).map(str::to_string)
    }

    /// Force-terminate every non-terminal session involving `identity`
    /// (their connection dropped). Returns the terminated sessions so the
    /// dispatcher can notify each surviving party exactly once.
    pub fn end_all_for(&self, identity: &str) -> Vec<CallSession> {
        let involved: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| !s.state.is_terminal() && s.is_participant(identity))
            .map(|s| s.call_id.clone())
            .collect();

        involved
            .into_iter()
            .filter_map(|call_id| {
                // Re-checked under the entry lock; a racing hangup wins.
                self.terminate(&call_id, CallState::Ended, |s| !s.state.is_terminal())
                    .ok()
            })
            .collect()
    }

    /// Drop terminal sessions older than `retention_secs`. Called by the
    /// periodic cleanup task.
    pub fn purge_terminal(&self, retention_secs: i64) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| {
                s.state.is_terminal()
                    && s.ended_at
                        .map(|t| (now - t).num_seconds() > retention_secs)
                        .unwrap_or(true)
            })
            .map(|s| s.call_id.clone())
            .collect();

        for call_id in &expired {
            self.sessions.remove(call_id);
        }

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Purged terminal call sessions");
        }
        expired.len()
    }

    /// Number of non-terminal sessions (stats endpoint).
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| !s.state.is_terminal())
            .count()
    }

    /// Move a session to a terminal state if `permitted` holds, releasing the
    /// pair slot. Everything else is a stale signal.
    fn terminate(
        &self,
        call_id: &str,
        to: CallState,
        permitted: impl FnOnce(&CallSession) -> bool,
    ) -> Result<CallSession> {
        debug_assert!(to.is_terminal());

        let ended = {
            let mut session = self
                .sessions
                .get_mut(call_id)
                .ok_or_else(|| RelayError::StaleSignal(call_id.to_string()))?;

            if !permitted(&session) {
                return Err(RelayError::StaleSignal(call_id.to_string()));
            }

            session.state = to;
            session.ended_at = Some(Utc::now());
            session.clone()
        };

        self.active_pairs
            .remove_if(&pair_key(&ended.caller, &ended.callee), |_, id| {
                id == call_id
            });

        tracing::info!(
            call_id = call_id,
            state = ?to,
            duration_secs = (Utc::now() - ended.started_at).num_seconds(),
            "Call terminated"
        );
        Ok(ended)
    }
}
