//! Live call session registry
//!
//! Every call id owns one [`SessionHandle`]. Signaling events for the same call
//! serialize on the handle's async mutex; events for different calls only
//! share the map shard for the duration of a lookup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::debug;

use super::state::CallSession;
use crate::error::{CallEngineError, Result};
use crate::routing::TrunkLease;

/// Resources and bookkeeping held for a call besides its record
#[derive(Debug)]
pub struct SessionSlot {
    pub session: CallSession,
    /// Trunk slots held by the call's inbound and outbound legs; released
    /// when dropped
    pub trunk_leases: Vec<TrunkLease>,
    /// A media proxy session exists and must be deleted at the end
    pub media_allocated: bool,
    /// An outbound dialog was created towards the callee
    pub dialog_created: bool,
    /// The INVITE was admitted, so the caller's dialog is ours to tear down.
    /// Refused INVITEs are answered by the signaling engine itself.
    pub admitted: bool,
    pub from_tag: String,
    /// SDP offered by the caller
    pub remote_sdp: String,
    /// Proxy-rewritten offer sent to the callee legs
    pub offer_sdp: Option<String>,
    /// SDP last sent to the caller
    pub local_sdp: Option<String>,
    /// Limit on answered duration from the outbound rule
    pub max_duration: Option<Duration>,
}

impl SessionSlot {
    pub fn new(session: CallSession, from_tag: impl Into<String>, remote_sdp: impl Into<String>) -> Self {
        Self {
            session,
            trunk_leases: Vec::new(),
            media_allocated: false,
            dialog_created: false,
            admitted: false,
            from_tag: from_tag.into(),
            remote_sdp: remote_sdp.into(),
            offer_sdp: None,
            local_sdp: None,
            max_duration: None,
        }
    }
}

/// Handle to one call's exclusive state
#[derive(Debug)]
pub struct SessionHandle {
    call_id: String,
    /// Set once a terminal request has been accepted for this call
    terminating: AtomicBool,
    slot: Arc<Mutex<SessionSlot>>,
}

impl SessionHandle {
    fn new(slot: SessionSlot) -> Self {
        Self {
            call_id: slot.session.call_id.clone(),
            terminating: AtomicBool::new(false),
            slot: Arc::new(Mutex::new(slot)),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().await
    }

    /// Record a terminal request. Returns false if one was already recorded.
    pub fn begin_termination(&self) -> bool {
        !self.terminating.swap(true, Ordering::AcqRel)
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Copy of the current record
    pub async fn snapshot(&self) -> CallSession {
        self.slot.lock().await.session.clone()
    }
}

/// All call sessions known to the engine, live and recently ended
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new session. A second INVITE for the same call id is a conflict.
    pub fn insert(&self, slot: SessionSlot) -> Result<Arc<SessionHandle>> {
        self.insert_locked(slot).map(|(handle, _)| handle)
    }

    /// Admit a new session and hand back its lock, taken before the session
    /// becomes visible to any other task.
    pub fn insert_locked(&self, slot: SessionSlot) -> Result<(Arc<SessionHandle>, OwnedMutexGuard<SessionSlot>)> {
        use dashmap::mapref::entry::Entry;

        let call_id = slot.session.call_id.clone();
        match self.sessions.entry(call_id) {
            Entry::Occupied(e) => Err(CallEngineError::conflict(format!("call {} already exists", e.key()))),
            Entry::Vacant(e) => {
                let handle = Arc::new(SessionHandle::new(slot));
                let guard = handle
                    .slot
                    .clone()
                    .try_lock_owned()
                    .map_err(|_| CallEngineError::internal(format!("new call {} already locked", e.key())))?;
                e.insert(handle.clone());
                Ok((handle, guard))
            }
        }
    }

    pub fn get(&self, call_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(call_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| CallEngineError::not_found(format!("call {}", call_id)))
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.sessions.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop sessions that ended before `cutoff`. Sessions whose lock is held
    /// are skipped and picked up by a later pass.
    pub fn prune_ended(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|call_id, handle| match handle.slot.try_lock() {
            Ok(slot) => match slot.session.ended_at() {
                Some(ended_at) if ended_at < cutoff => {
                    debug!("🧹 Pruning ended call {}", call_id);
                    false
                }
                _ => true,
            },
            Err(_) => true,
        });
        before - self.sessions.len()
    }
}
