//! Call flow handling
//!
//! Signaling events for a call are applied under that call's session lock, so
//! they take effect in arrival order. A terminal request (BYE, CANCEL, a final
//! failure) marks the session as terminating before it waits for the lock;
//! handlers that were already in flight see the flag after their next await
//! point and stop driving the call forward.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::core::CallEngine;
use crate::entities::{AgentStatus, Destination, DestinationKind, Extension, OverflowAction, QueueDefinition};
use crate::error::{CallEngineError, Result};
use crate::events::{CallEventPayload, DtmfPayload, EventKind, QueueCallEnteredPayload, SystemAlertPayload, Topic};
use crate::integration::{bounded, set_media_direction};
use crate::queue::{Distribution, Overflow, OverflowReason, WaitingCall};
use crate::session::{
    CallSession, CallStateKind, Direction, HangupCause, Party, QueueLinkage, SessionEvent, SessionHandle,
    SessionSlot,
};

/// An INVITE as reported by the signaling engine
#[derive(Debug, Clone)]
pub struct InviteRequest {
    pub call_id: String,
    pub from_number: String,
    pub from_display_name: Option<String>,
    pub from_tag: String,
    /// User part of the request URI
    pub to_number: String,
    /// Set when the INVITE arrived from a configured trunk
    pub trunk_id: Option<String>,
    pub sdp: String,
}

impl InviteRequest {
    pub fn new(
        call_id: impl Into<String>,
        from_number: impl Into<String>,
        to_number: impl Into<String>,
        sdp: impl Into<String>,
    ) -> Self {
        let call_id = call_id.into();
        Self {
            from_tag: format!("{}-from", call_id),
            call_id,
            from_number: from_number.into(),
            from_display_name: None,
            to_number: to_number.into(),
            trunk_id: None,
            sdp: sdp.into(),
        }
    }

    pub fn from_trunk(mut self, trunk_id: impl Into<String>) -> Self {
        self.trunk_id = Some(trunk_id.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.from_display_name = Some(name.into());
        self
    }

    pub fn with_from_tag(mut self, tag: impl Into<String>) -> Self {
        self.from_tag = tag.into();
        self
    }
}

/// 200 OK from the callee side
#[derive(Debug, Clone)]
pub struct AnswerInfo {
    pub to_tag: String,
    pub sdp: String,
    /// Extension id or number of the answering endpoint, when the signaling
    /// engine knows which forked leg won
    pub answered_by: Option<String>,
}

impl AnswerInfo {
    pub fn new(to_tag: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            to_tag: to_tag.into(),
            sdp: sdp.into(),
            answered_by: None,
        }
    }

    pub fn answered_by(mut self, who: impl Into<String>) -> Self {
        self.answered_by = Some(who.into());
        self
    }
}

/// Where an admitted call is sent
enum Leg {
    Extension(Extension),
    Queue(String),
    Uri(String),
}

impl CallEngine {
    /// Admit, route and offer a new call.
    ///
    /// A call that cannot be admitted is still recorded, going straight from
    /// `initiated` to `ended` with cause `failed`; the error is returned.
    pub async fn handle_invite(&self, request: InviteRequest) -> Result<CallSession> {
        if let Ok(existing) = self.sessions.get(&request.call_id) {
            debug!("Duplicate INVITE for call {}", request.call_id);
            return Ok(existing.snapshot().await);
        }

        info!(
            "📞 INVITE {} from {} to {}{}",
            request.call_id,
            request.from_number,
            request.to_number,
            request
                .trunk_id
                .as_deref()
                .map(|t| format!(" via trunk {}", t))
                .unwrap_or_default()
        );

        let (caller_ext, callee_ext) = if request.trunk_id.is_none() {
            (
                self.lookup_extension(&request.from_number).await,
                self.lookup_extension(&request.to_number).await,
            )
        } else {
            (None, None)
        };

        let direction = match request.trunk_id {
            Some(_) => Direction::Inbound,
            None => Direction::classify(caller_ext.is_some(), callee_ext.is_some()),
        };
        let caller = party_for(&request.from_number, caller_ext.as_ref())
            .with_display_name(request.from_display_name.clone().or_else(|| {
                caller_ext.as_ref().and_then(|e| e.display_name.clone())
            }));
        let callee = party_for(&request.to_number, callee_ext.as_ref())
            .with_display_name(callee_ext.as_ref().and_then(|e| e.display_name.clone()));

        let mut session = CallSession::new(&request.call_id, direction, caller, callee, self.clock.now());
        session.trunk_id = request.trunk_id.clone();

        // locked before it is visible, so no BYE or CANCEL can end the call
        // ahead of its admission
        let (handle, mut slot) = match self
            .sessions
            .insert_locked(SessionSlot::new(session, &request.from_tag, &request.sdp))
        {
            Ok(locked) => locked,
            Err(CallEngineError::Conflict(_)) => {
                return Ok(self.sessions.get(&request.call_id)?.snapshot().await);
            }
            Err(e) => return Err(e),
        };

        self.record_initiated(&slot.session).await;

        match self.admit(&handle, &mut slot, &request, caller_ext, callee_ext).await {
            Ok(()) => {
                slot.admitted = true;
                Ok(slot.session.clone())
            }
            Err(e) => {
                warn!("❌ Call {} could not be admitted: {}", request.call_id, e);
                self.finalize(&mut slot, e.hangup_cause()).await;
                Err(e)
            }
        }
    }

    /// 180/183 from the callee side
    pub async fn on_ringing(&self, call_id: &str) -> Result<CallSession> {
        let handle = self.sessions.get(call_id)?;
        let mut slot = handle.lock().await;
        if slot.session.is_ended() || handle.is_terminating() {
            debug!("Ringing for finished call {} discarded", call_id);
            return Ok(slot.session.clone());
        }
        self.ring(&mut slot).await;
        Ok(slot.session.clone())
    }

    /// 200 OK from the callee side
    pub async fn on_answer(&self, call_id: &str, answer: AnswerInfo) -> Result<CallSession> {
        let handle = self.sessions.get(call_id)?;
        let mut slot = handle.lock().await;
        if slot.session.is_ended() || handle.is_terminating() {
            debug!("Answer for finished call {} discarded", call_id);
            return Ok(slot.session.clone());
        }

        match slot.session.kind() {
            CallStateKind::Initiated => self.ring(&mut slot).await,
            CallStateKind::Ringing => {}
            other => {
                debug!("Duplicate answer for call {} in state {}", call_id, other);
                return Ok(slot.session.clone());
            }
        }

        if let Err(e) = self.complete_answer(&mut slot, &answer).await {
            error!("❌ Answering call {} failed: {}", call_id, e);
            handle.begin_termination();
            self.finalize(&mut slot, e.hangup_cause()).await;
            return Err(e);
        }
        Ok(slot.session.clone())
    }

    /// Put an answered call on hold (re-INVITE with `sendonly`)
    pub async fn hold_call(&self, call_id: &str) -> Result<CallSession> {
        self.renegotiate(call_id, SessionEvent::Hold, "sendonly").await
    }

    /// Take a held call off hold
    pub async fn resume_call(&self, call_id: &str) -> Result<CallSession> {
        self.renegotiate(call_id, SessionEvent::Resume, "sendrecv").await
    }

    /// Blind transfer of an answered call via REFER
    pub async fn transfer_call(&self, call_id: &str, target_number: &str) -> Result<CallSession> {
        let handle = self.sessions.get(call_id)?;
        let mut slot = handle.lock().await;
        ensure_accepting(&handle, &slot)?;

        let (target, uri) = match self.lookup_extension(target_number).await {
            Some(ext) => {
                let contact = self.directory.lookup(&ext.id).map(|r| r.contact);
                let uri = self
                    .uris()
                    .extension_uri_with_fallback(&ext.number, contact.as_deref());
                let party = party_for(target_number, Some(&ext)).with_display_name(ext.display_name.clone());
                (party, uri)
            }
            None => (Party::number(target_number), self.uris().extension_uri(target_number)),
        };

        let mut next = slot.session.clone();
        let transition = next.apply(SessionEvent::Transfer { target }, self.clock.now())?;
        if !transition.is_changed() {
            return Ok(next);
        }

        info!("🔀 Transferring call {} to {}", call_id, uri);
        if let Err(e) = bounded(
            "send_refer",
            call_id,
            self.signaling_timeout(),
            self.signaling.send_refer(call_id, &uri),
        )
        .await
        {
            error!("❌ REFER for call {} failed: {}", call_id, e);
            handle.begin_termination();
            self.finalize(&mut slot, e.hangup_cause()).await;
            return Err(e);
        }

        slot.session = next;
        self.record_transition(&slot.session, transition).await;
        Ok(slot.session.clone())
    }

    /// BYE from either side
    pub async fn handle_bye(&self, call_id: &str) -> Result<CallSession> {
        self.terminate(call_id, HangupCause::NormalClearing).await
    }

    /// CANCEL from the caller before answer
    pub async fn handle_cancel(&self, call_id: &str) -> Result<CallSession> {
        self.terminate(call_id, HangupCause::Cancel).await
    }

    /// Final failure response from the callee side. For forked queue offers
    /// the signaling engine reports this only once every leg has failed.
    pub async fn handle_failure_response(&self, call_id: &str, status: u16) -> Result<CallSession> {
        let cause = HangupCause::from_sip_status(status);
        debug!("Call {} got final response {} ({})", call_id, status, cause);
        self.terminate(call_id, cause).await
    }

    /// Administrative hangup
    pub async fn hangup_call(&self, call_id: &str) -> Result<CallSession> {
        info!("📴 Hangup requested for call {}", call_id);
        self.terminate(call_id, HangupCause::NormalClearing).await
    }

    /// Relay a DTMF digit to observers
    pub async fn handle_dtmf(&self, call_id: &str, digit: char) -> Result<()> {
        if !matches!(digit, '0'..='9' | '*' | '#' | 'A'..='D') {
            return Err(CallEngineError::invalid_input(format!("invalid DTMF digit '{}'", digit)));
        }
        let handle = self.sessions.get(call_id)?;
        let slot = handle.lock().await;
        if slot.session.is_ended() {
            debug!("DTMF for ended call {} discarded", call_id);
            return Ok(());
        }
        let payload = DtmfPayload {
            call_id: call_id.to_string(),
            digit,
        };
        self.events.publish(Topic::Broadcast, EventKind::CallDtmf, &payload);
        Ok(())
    }

    /// Associate a recording with a live call
    pub async fn attach_recording(&self, call_id: &str, recording_id: &str) -> Result<CallSession> {
        let handle = self.sessions.get(call_id)?;
        let mut slot = handle.lock().await;
        if slot.session.is_ended() {
            return Err(CallEngineError::invalid_state(format!("call {} already ended", call_id)));
        }
        slot.session.recording_id = Some(recording_id.to_string());
        self.persist(&slot.session).await;
        Ok(slot.session.clone())
    }

    /// Live or recently ended session, falling back to the call record store
    pub async fn get_call(&self, call_id: &str) -> Result<CallSession> {
        if let Ok(handle) = self.sessions.get(call_id) {
            return Ok(handle.snapshot().await);
        }
        bounded(
            "load call record",
            call_id,
            self.store_timeout(),
            self.records.get(call_id),
        )
        .await?
        .ok_or_else(|| CallEngineError::not_found(format!("call {}", call_id)))
    }

    /// Sessions that have not ended yet
    pub async fn active_calls(&self) -> Vec<CallSession> {
        let mut calls = Vec::new();
        for handle in self.sessions.handles() {
            let session = handle.snapshot().await;
            if !session.is_ended() {
                calls.push(session);
            }
        }
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        calls
    }

    async fn admit(
        &self,
        handle: &SessionHandle,
        slot: &mut SessionSlot,
        request: &InviteRequest,
        caller_ext: Option<Extension>,
        callee_ext: Option<Extension>,
    ) -> Result<()> {
        let leg = self.route(slot, request, caller_ext, callee_ext).await?;

        let call_id = request.call_id.clone();
        slot.media_allocated = true;
        let offer = bounded(
            "media offer",
            &call_id,
            self.media_timeout(),
            self.media.offer(&call_id, &slot.from_tag, &slot.remote_sdp),
        )
        .await
        .and_then(|result| result.into_sdp("offer", &call_id))?;
        slot.offer_sdp = Some(offer);

        if handle.is_terminating() {
            debug!("Call {} torn down during admission", call_id);
            return Ok(());
        }

        match leg {
            Leg::Extension(ext) => {
                let registration = self.directory.lookup(&ext.id).ok_or_else(|| {
                    CallEngineError::not_found(format!("extension {} is not registered", ext.number))
                })?;
                self.offer_to(slot, &[registration.contact]).await?;
                self.ring(slot).await;
                self.spawn_ring_timer(&call_id);
            }
            Leg::Uri(uri) => {
                self.offer_to(slot, &[uri]).await?;
                self.ring(slot).await;
                self.spawn_ring_timer(&call_id);
            }
            Leg::Queue(queue_id) => self.enter_queue(slot, &queue_id).await?,
        }
        Ok(())
    }

    async fn route(
        &self,
        slot: &mut SessionSlot,
        request: &InviteRequest,
        caller_ext: Option<Extension>,
        callee_ext: Option<Extension>,
    ) -> Result<Leg> {
        let now = self.clock.now();
        match (request.trunk_id.as_deref(), caller_ext, callee_ext) {
            (None, _, Some(callee)) => Ok(Leg::Extension(callee)),
            (None, Some(caller), None) => {
                let uri = self.outbound_uri(slot, &request.to_number, Some(&caller)).await?;
                Ok(Leg::Uri(uri))
            }
            (trunk_id, _, _) => {
                if let Some(trunk_id) = trunk_id {
                    self.seize_inbound_trunk(slot, trunk_id).await?;
                }
                let route = bounded(
                    "resolve inbound route",
                    &request.call_id,
                    self.store_timeout(),
                    self.routing
                        .resolve_inbound(&request.to_number, trunk_id, &request.from_number, now),
                )
                .await?;
                self.leg_for_destination(slot, route.destination).await
            }
        }
    }

    async fn leg_for_destination(&self, slot: &mut SessionSlot, destination: Destination) -> Result<Leg> {
        let call_id = slot.session.call_id.clone();
        match destination.kind {
            DestinationKind::Extension => {
                let ext = bounded(
                    "find_extension_by_id",
                    &call_id,
                    self.store_timeout(),
                    self.entities.find_extension_by_id(&destination.target),
                )
                .await?;
                if !ext.is_active() {
                    return Err(CallEngineError::not_found(format!("extension {} is inactive", ext.number)));
                }
                slot.session.callee = party_for(&ext.number, Some(&ext)).with_display_name(ext.display_name.clone());
                Ok(Leg::Extension(ext))
            }
            DestinationKind::Queue => Ok(Leg::Queue(destination.target)),
            DestinationKind::Ivr => Ok(Leg::Uri(self.uris().ivr_uri(&destination.target))),
            DestinationKind::Voicemail => Ok(Leg::Uri(self.uris().voicemail_uri(&destination.target))),
            DestinationKind::External => {
                let uri = self.outbound_uri(slot, &destination.target, None).await?;
                Ok(Leg::Uri(uri))
            }
        }
    }

    /// Count an inbound call against the trunk it arrived on
    async fn seize_inbound_trunk(&self, slot: &mut SessionSlot, trunk_id: &str) -> Result<()> {
        let call_id = slot.session.call_id.clone();
        let trunk = bounded(
            "find_trunk",
            &call_id,
            self.store_timeout(),
            self.entities.find_trunk(trunk_id),
        )
        .await?;
        let Some(lease) = self.routing.trunk_usage().try_acquire(&trunk) else {
            self.publish_alert("warning", format!("trunk {} is at its concurrent call limit", trunk.id));
            return Err(CallEngineError::TrunkSaturated(trunk.id));
        };
        slot.trunk_leases.push(lease);
        Ok(())
    }

    /// Route a number out through a trunk, keeping the trunk slot in the session
    async fn outbound_uri(&self, slot: &mut SessionSlot, number: &str, originator: Option<&Extension>) -> Result<String> {
        let call_id = slot.session.call_id.clone();
        let route = match bounded(
            "resolve outbound route",
            &call_id,
            self.store_timeout(),
            self.routing.resolve_outbound(number, originator),
        )
        .await
        {
            Ok(route) => route,
            Err(CallEngineError::TrunkSaturated(trunk_id)) => {
                self.publish_alert("warning", format!("trunk {} is at its concurrent call limit", trunk_id));
                return Err(CallEngineError::TrunkSaturated(trunk_id));
            }
            Err(e) => return Err(e),
        };

        if let Some(caller_id) = &route.caller_id {
            debug!("Call {} presents caller id {} on trunk {}", call_id, caller_id, route.trunk.id);
        }
        let uri = self.uris().trunk_uri(&route.number, &route.trunk);
        slot.session.trunk_id = Some(route.trunk.id.clone());
        slot.session.presented_caller_id = route.caller_id;
        slot.max_duration = route.max_duration_secs.map(Duration::from_secs);
        slot.trunk_leases.push(route.lease);
        Ok(uri)
    }

    /// Create outbound dialogs towards every contact, in order
    async fn offer_to(&self, slot: &mut SessionSlot, contacts: &[String]) -> Result<()> {
        let call_id = slot.session.call_id.clone();
        let sdp = slot.offer_sdp.clone().unwrap_or_else(|| slot.remote_sdp.clone());
        let caller_id = slot.session.presented_caller_id.clone();
        for contact in contacts {
            debug!("Offering call {} to {}", call_id, contact);
            bounded(
                "create_outbound_dialog",
                &call_id,
                self.signaling_timeout(),
                self.signaling
                    .create_outbound_dialog(&call_id, contact, &sdp, caller_id.as_deref()),
            )
            .await?;
            slot.dialog_created = true;
        }
        Ok(())
    }

    async fn ring(&self, slot: &mut SessionSlot) {
        match slot.session.apply(SessionEvent::Ring, self.clock.now()) {
            Ok(transition) => self.record_transition(&slot.session, transition).await,
            Err(e) => debug!("Ring for call {} ignored: {}", slot.session.call_id, e),
        }
    }

    async fn enter_queue(&self, slot: &mut SessionSlot, queue_id: &str) -> Result<()> {
        let call_id = slot.session.call_id.clone();
        let queue = bounded(
            "find_queue",
            &call_id,
            self.store_timeout(),
            self.entities.find_queue(queue_id),
        )
        .await?;

        let now = self.clock.now();
        slot.session.queue = Some(QueueLinkage::new(&queue.id, now));
        let waiting = WaitingCall {
            call_id: call_id.clone(),
            caller_number: slot.session.caller.number.clone(),
            entered_at: now,
            required_skill: None,
        };

        let position = match self.distributor.enqueue(&queue, waiting.clone()) {
            Ok(position) => position,
            Err(overflow) => return self.overflow(slot, overflow).await,
        };
        let entered = QueueCallEnteredPayload {
            queue_id: queue.id.clone(),
            call_id: call_id.clone(),
            caller_number: waiting.caller_number.clone(),
            position,
        };
        self.events
            .publish(Topic::queue(&queue.id), EventKind::QueueCallEntered, &entered);

        let candidates = self.agent_candidates(&queue).await?;
        match self.distributor.distribute(&queue, &waiting, &candidates) {
            Distribution::Offer(agents) => {
                let contacts: Vec<String> = agents
                    .iter()
                    .filter_map(|agent| self.directory.lookup(agent).map(|r| r.contact))
                    .collect();
                if let Some(link) = slot.session.queue.as_mut() {
                    link.offered_to = agents;
                }
                self.offer_to(slot, &contacts).await?;
                self.ring(slot).await;
                self.spawn_queue_wait_timer(&call_id, &queue);
                self.publish_queue_stats(&queue.id).await;
                Ok(())
            }
            Distribution::Overflow(overflow) => self.overflow(slot, overflow).await,
        }
    }

    /// Take the queue's configured overflow action for a call
    pub(super) async fn overflow(&self, slot: &mut SessionSlot, overflow: Overflow) -> Result<()> {
        let call_id = slot.session.call_id.clone();
        self.distributor.dequeue(&overflow.queue_id, &call_id);
        info!(
            "↪️ Call {} overflowing queue {} ({:?}) -> {:?}",
            call_id, overflow.queue_id, overflow.reason, overflow.action
        );

        if slot.dialog_created {
            bounded(
                "cancel_outbound_dialogs",
                &call_id,
                self.signaling_timeout(),
                self.signaling.cancel_outbound_dialogs(&call_id),
            )
            .await?;
            slot.dialog_created = false;
        }
        if let Some(link) = slot.session.queue.as_mut() {
            link.offered_to.clear();
        }

        let target = match (overflow.action, overflow.destination.as_deref()) {
            (OverflowAction::Hangup, _) => {
                // ends the call without an error, so the caller's leg is
                // torn down here even during admission
                slot.admitted = true;
                self.finalize(slot, overflow.reason.hangup_cause()).await;
                return Ok(());
            }
            (OverflowAction::Voicemail, Some(id)) => self.uris().voicemail_uri(id),
            (OverflowAction::Ivr, Some(id)) => self.uris().ivr_uri(id),
            (OverflowAction::External, Some(number)) => self.outbound_uri(slot, number, None).await?,
            (action, None) => {
                return Err(CallEngineError::config(format!(
                    "queue {} overflow action {:?} has no destination",
                    overflow.queue_id, action
                )));
            }
        };

        self.offer_to(slot, &[target]).await?;
        self.ring(slot).await;
        self.spawn_ring_timer(&call_id);
        self.publish_queue_stats(&overflow.queue_id).await;
        Ok(())
    }

    async fn complete_answer(&self, slot: &mut SessionSlot, answer: &AnswerInfo) -> Result<()> {
        let call_id = slot.session.call_id.clone();
        let local_sdp = bounded(
            "media answer",
            &call_id,
            self.media_timeout(),
            self.media.answer(&call_id, &slot.from_tag, &answer.to_tag, &answer.sdp),
        )
        .await
        .and_then(|result| result.into_sdp("answer", &call_id))?;

        bounded(
            "accept_inbound_dialog",
            &call_id,
            self.signaling_timeout(),
            self.signaling.accept_inbound_dialog(&call_id, &local_sdp),
        )
        .await?;
        slot.local_sdp = Some(local_sdp);

        let transition = slot.session.apply(SessionEvent::Answer, self.clock.now())?;
        let answered_queue = self.link_answering_agent(slot, answer.answered_by.as_deref()).await;
        info!("✅ Call {} answered", call_id);
        self.record_transition(&slot.session, transition).await;

        if let Some((queue_id, agent)) = answered_queue {
            *self.queue_active.entry(queue_id.clone()).or_insert(0) += 1;
            if let Some(agent) = agent {
                self.update_agent_everywhere(&agent, AgentStatus::Busy, None).await;
            }
            self.publish_queue_stats(&queue_id).await;
        }
        if let Some(limit) = slot.max_duration {
            self.spawn_max_duration_timer(&call_id, limit);
        }
        Ok(())
    }

    /// Fill in who answered a queue call and how long it waited. Returns the
    /// queue and agent when an offered agent answered.
    async fn link_answering_agent(
        &self,
        slot: &mut SessionSlot,
        answered_by: Option<&str>,
    ) -> Option<(String, Option<String>)> {
        let answered_at = slot.session.answered_at()?;
        let call_id = slot.session.call_id.clone();
        let link = slot.session.queue.as_mut()?;
        // overflow targets are not agents
        if link.offered_to.is_empty() {
            return None;
        }

        let agent = match answered_by {
            Some(who) if link.offered_to.iter().any(|a| a == who) => Some(who.to_string()),
            Some(who) => self.lookup_extension(who).await.map(|ext| ext.id),
            None if link.offered_to.len() == 1 => link.offered_to.first().cloned(),
            None => None,
        };

        let wait_ms = (answered_at - link.entered_at).num_milliseconds().max(0);
        link.wait_secs = Some(wait_ms as f64 / 1000.0);
        link.agent_extension_id = agent.clone();
        self.distributor.dequeue(&link.queue_id, &call_id);
        info!(
            "🎧 Queue call {} answered by {:?} after {:.1}s",
            call_id,
            agent,
            wait_ms as f64 / 1000.0
        );
        Some((link.queue_id.clone(), agent))
    }

    async fn renegotiate(&self, call_id: &str, event: SessionEvent, direction: &str) -> Result<CallSession> {
        let handle = self.sessions.get(call_id)?;
        let mut slot = handle.lock().await;
        ensure_accepting(&handle, &slot)?;

        let event_name = event.name();
        let mut next = slot.session.clone();
        let transition = next.apply(event, self.clock.now())?;
        if !transition.is_changed() {
            return Ok(next);
        }

        let base = slot.local_sdp.clone().unwrap_or_else(|| slot.remote_sdp.clone());
        let sdp = set_media_direction(&base, direction);
        if let Err(e) = bounded(
            "modify_dialog",
            call_id,
            self.signaling_timeout(),
            self.signaling.modify_dialog(call_id, &sdp),
        )
        .await
        {
            error!("❌ {} re-INVITE for call {} failed: {}", event_name, call_id, e);
            handle.begin_termination();
            self.finalize(&mut slot, e.hangup_cause()).await;
            return Err(e);
        }

        slot.session = next;
        self.record_transition(&slot.session, transition).await;
        Ok(slot.session.clone())
    }

    async fn terminate(&self, call_id: &str, cause: HangupCause) -> Result<CallSession> {
        let handle = self.sessions.get(call_id)?;
        if !handle.begin_termination() {
            debug!("Call {} is already being torn down", call_id);
        }
        let mut slot = handle.lock().await;
        if slot.session.is_ended() {
            debug!("Call {} already ended, ignoring {}", call_id, cause);
            return Ok(slot.session.clone());
        }
        self.finalize(&mut slot, cause).await;
        Ok(slot.session.clone())
    }

    /// Release everything the call holds and move it to `ended`. Returns
    /// false if the call had already ended.
    pub(super) async fn finalize(&self, slot: &mut SessionSlot, cause: HangupCause) -> bool {
        if slot.session.is_ended() {
            return false;
        }
        let call_id = slot.session.call_id.clone();

        if slot.admitted || slot.dialog_created || slot.local_sdp.is_some() {
            if let Err(e) = bounded(
                "destroy_dialog",
                &call_id,
                self.signaling_timeout(),
                self.signaling.destroy_dialog(&call_id),
            )
            .await
            {
                warn!("destroy_dialog for call {} failed: {}", call_id, e);
            }
        }

        if slot.media_allocated {
            match bounded("media delete", &call_id, self.media_timeout(), self.media.delete(&call_id)).await {
                Ok(result) if result.success => debug!("Media session for call {} deleted", call_id),
                Ok(result) => warn!(
                    "Media delete for call {} failed: {}",
                    call_id,
                    result.error_reason.unwrap_or_default()
                ),
                Err(e) => warn!("Media delete for call {} failed: {}", call_id, e),
            }
            slot.media_allocated = false;
        }

        for lease in slot.trunk_leases.drain(..) {
            debug!("Releasing trunk {} slot held by call {}", lease.trunk_id(), call_id);
        }

        let transition = match slot.session.apply(SessionEvent::End(cause), self.clock.now()) {
            Ok(transition) => transition,
            Err(e) => {
                error!("Ending call {} failed: {}", call_id, e);
                return false;
            }
        };
        info!("📴 Call {} ended ({})", call_id, cause);

        let mut wrap_up_agent = None;
        let queue_id = match slot.session.queue.clone() {
            Some(link) if link.wait_secs.is_some() => {
                if let Some(mut active) = self.queue_active.get_mut(&link.queue_id) {
                    let remaining = active.saturating_sub(1);
                    *active = remaining;
                }
                if let Some(agent) = link.agent_extension_id {
                    if let Some(talk) = slot.session.talk_secs() {
                        self.talk_time.add_talk_time(&agent, talk).await;
                    }
                    wrap_up_agent = Some(agent);
                }
                Some(link.queue_id)
            }
            Some(link) => {
                self.distributor.dequeue(&link.queue_id, &call_id);
                Some(link.queue_id)
            }
            None => None,
        };

        self.record_transition(&slot.session, transition).await;

        if let Some(agent) = wrap_up_agent {
            self.begin_wrap_up(&agent).await;
        }
        if let Some(queue_id) = queue_id {
            self.publish_queue_stats(&queue_id).await;
        }
        true
    }

    fn spawn_ring_timer(&self, call_id: &str) {
        let engine = self.clone();
        let call_id = call_id.to_string();
        let limit = self.config.timeouts.ring_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            engine.on_ring_timeout(&call_id).await;
        });
    }

    async fn on_ring_timeout(&self, call_id: &str) {
        let Ok(handle) = self.sessions.get(call_id) else {
            return;
        };
        if handle.is_terminating() {
            return;
        }
        let mut slot = handle.lock().await;
        if slot.session.kind() != CallStateKind::Ringing {
            return;
        }
        // offered queue calls are governed by the queue's wait limit
        if slot.session.queue.as_ref().is_some_and(|q| !q.offered_to.is_empty()) {
            return;
        }
        info!("⏰ Call {} was not answered in time", call_id);
        handle.begin_termination();
        self.finalize(&mut slot, HangupCause::NoAnswer).await;
    }

    fn spawn_queue_wait_timer(&self, call_id: &str, queue: &QueueDefinition) {
        let engine = self.clone();
        let call_id = call_id.to_string();
        let queue_id = queue.id.clone();
        let limit = Duration::from_secs(queue.max_wait_time_secs);
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            engine.on_queue_wait_expired(&call_id, &queue_id).await;
        });
    }

    async fn on_queue_wait_expired(&self, call_id: &str, queue_id: &str) {
        let Ok(handle) = self.sessions.get(call_id) else {
            return;
        };
        if handle.is_terminating() {
            return;
        }
        let mut slot = handle.lock().await;
        self.overflow_waiting_call(&mut slot, queue_id).await;
    }

    /// Overflow a still-waiting queue call whose wait limit passed
    pub(super) async fn overflow_waiting_call(&self, slot: &mut SessionSlot, queue_id: &str) -> bool {
        if slot.session.is_ended() || slot.session.answered_at().is_some() {
            return false;
        }
        let call_id = slot.session.call_id.clone();
        let queue = match bounded(
            "find_queue",
            &call_id,
            self.store_timeout(),
            self.entities.find_queue(queue_id),
        )
        .await
        {
            Ok(queue) => queue,
            Err(e) => {
                warn!("Queue {} lookup for waiting call {} failed: {}", queue_id, call_id, e);
                return false;
            }
        };
        if self.distributor.dequeue(queue_id, &call_id).is_none() {
            return false;
        }

        info!("⏰ Call {} exceeded the wait limit of queue {}", call_id, queue_id);
        let overflow = Overflow::new(&queue, OverflowReason::WaitTimeExceeded);
        if let Err(e) = self.overflow(slot, overflow).await {
            warn!("Overflow of call {} failed: {}", call_id, e);
            self.finalize(slot, e.hangup_cause()).await;
        }
        true
    }

    fn spawn_max_duration_timer(&self, call_id: &str, limit: Duration) {
        let engine = self.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            engine.on_max_duration(&call_id, limit).await;
        });
    }

    async fn on_max_duration(&self, call_id: &str, limit: Duration) {
        let Ok(handle) = self.sessions.get(call_id) else {
            return;
        };
        let mut slot = handle.lock().await;
        if slot.session.is_ended() {
            return;
        }
        info!("⏰ Call {} reached its maximum duration of {:?}", call_id, limit);
        handle.begin_termination();
        self.finalize(&mut slot, HangupCause::Timeout).await;
    }

    pub(super) async fn lookup_extension(&self, number: &str) -> Option<Extension> {
        match self.find_active_extension(number).await {
            Ok(ext) => Some(ext),
            Err(CallEngineError::NotFound(_)) => None,
            Err(e) => {
                warn!("Extension lookup for {} failed: {}", number, e);
                None
            }
        }
    }

    async fn record_initiated(&self, session: &CallSession) {
        self.persist(session).await;
        self.events.publish(
            Topic::Broadcast,
            EventKind::CallInitiated,
            &CallEventPayload::from(session),
        );
    }

    pub(super) fn publish_alert(&self, severity: &str, message: String) {
        warn!("🚨 {}", message);
        let payload = SystemAlertPayload {
            severity: severity.to_string(),
            message,
        };
        self.events
            .publish(Topic::system(), EventKind::SystemAlert, &payload);
    }
}

fn party_for(number: &str, extension: Option<&Extension>) -> Party {
    match extension {
        Some(ext) => Party::extension(number, &ext.id),
        None => Party::number(number),
    }
}

fn ensure_accepting(handle: &Arc<SessionHandle>, slot: &SessionSlot) -> Result<()> {
    if slot.session.is_ended() {
        return Err(CallEngineError::invalid_state(format!(
            "call {} already ended",
            slot.session.call_id
        )));
    }
    if handle.is_terminating() {
        return Err(CallEngineError::invalid_state(format!(
            "call {} is being torn down",
            slot.session.call_id
        )));
    }
    Ok(())
}
