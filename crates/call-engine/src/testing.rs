//! Recording signaling and media doubles
//!
//! Both doubles log every command they receive and can be told to fail or to
//! never answer a given command, which is how the orchestrator's transport
//! error and timeout handling is exercised.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use pbx_registrar_core::DigestChallenge;

use crate::error::{CallEngineError, Result};
use crate::integration::{MediaProxy, MediaResult, SignalingEngine};

/// A command received by [`RecordingSignaling`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingCommand {
    RegisterChallenge { extension_number: String, nonce: String, stale: bool },
    CreateOutboundDialog {
        call_id: String,
        contact: String,
        sdp: String,
        caller_id: Option<String>,
    },
    AcceptInboundDialog { call_id: String, sdp: String },
    ModifyDialog { call_id: String, sdp: String },
    Refer { call_id: String, target: String },
    CancelOutboundDialogs { call_id: String },
    DestroyDialog { call_id: String },
}

impl SignalingCommand {
    /// Name of the trait method that produced the command
    pub fn name(&self) -> &'static str {
        match self {
            SignalingCommand::RegisterChallenge { .. } => "send_register_challenge",
            SignalingCommand::CreateOutboundDialog { .. } => "create_outbound_dialog",
            SignalingCommand::AcceptInboundDialog { .. } => "accept_inbound_dialog",
            SignalingCommand::ModifyDialog { .. } => "modify_dialog",
            SignalingCommand::Refer { .. } => "send_refer",
            SignalingCommand::CancelOutboundDialogs { .. } => "cancel_outbound_dialogs",
            SignalingCommand::DestroyDialog { .. } => "destroy_dialog",
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            SignalingCommand::RegisterChallenge { .. } => None,
            SignalingCommand::CreateOutboundDialog { call_id, .. }
            | SignalingCommand::AcceptInboundDialog { call_id, .. }
            | SignalingCommand::ModifyDialog { call_id, .. }
            | SignalingCommand::Refer { call_id, .. }
            | SignalingCommand::CancelOutboundDialogs { call_id }
            | SignalingCommand::DestroyDialog { call_id } => Some(call_id),
        }
    }
}

/// Faults injected per command name
#[derive(Debug, Default)]
struct Faults {
    failing: HashSet<&'static str>,
    hanging: HashSet<&'static str>,
}

impl Faults {
    async fn apply(&self, command: &'static str) -> Result<()> {
        if self.hanging.contains(command) {
            futures::future::pending::<()>().await;
        }
        if self.failing.contains(command) {
            return Err(CallEngineError::transport(format!("{} failed (injected)", command)));
        }
        Ok(())
    }
}

/// Signaling engine double
#[derive(Debug, Default)]
pub struct RecordingSignaling {
    commands: Mutex<Vec<SignalingCommand>>,
    faults: Mutex<Faults>,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a command fail with a transport error
    pub fn fail_on(&self, command: &'static str) {
        self.faults.lock().failing.insert(command);
    }

    /// Make a command never complete
    pub fn hang_on(&self, command: &'static str) {
        self.faults.lock().hanging.insert(command);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn commands(&self) -> Vec<SignalingCommand> {
        self.commands.lock().clone()
    }

    pub fn commands_for(&self, call_id: &str) -> Vec<SignalingCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.call_id() == Some(call_id))
            .cloned()
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands.lock().iter().filter(|c| c.name() == command).count()
    }

    /// Contacts an outbound dialog was created towards for a call, in order
    pub fn offered_contacts(&self, call_id: &str) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                SignalingCommand::CreateOutboundDialog { call_id: id, contact, .. } if id == call_id => {
                    Some(contact.clone())
                }
                _ => None,
            })
            .collect()
    }

    async fn record(&self, command: SignalingCommand) -> Result<()> {
        let name = command.name();
        self.commands.lock().push(command);
        let faults = {
            let faults = self.faults.lock();
            Faults {
                failing: faults.failing.clone(),
                hanging: faults.hanging.clone(),
            }
        };
        faults.apply(name).await
    }
}

#[async_trait]
impl SignalingEngine for RecordingSignaling {
    async fn send_register_challenge(&self, extension_number: &str, challenge: &DigestChallenge) -> Result<()> {
        self.record(SignalingCommand::RegisterChallenge {
            extension_number: extension_number.to_string(),
            nonce: challenge.nonce.clone(),
            stale: challenge.stale,
        })
        .await
    }

    async fn create_outbound_dialog(
        &self,
        call_id: &str,
        destination_contact: &str,
        local_sdp: &str,
        caller_id: Option<&str>,
    ) -> Result<()> {
        self.record(SignalingCommand::CreateOutboundDialog {
            call_id: call_id.to_string(),
            contact: destination_contact.to_string(),
            sdp: local_sdp.to_string(),
            caller_id: caller_id.map(str::to_string),
        })
        .await
    }

    async fn accept_inbound_dialog(&self, call_id: &str, local_sdp: &str) -> Result<()> {
        self.record(SignalingCommand::AcceptInboundDialog {
            call_id: call_id.to_string(),
            sdp: local_sdp.to_string(),
        })
        .await
    }

    async fn modify_dialog(&self, call_id: &str, new_sdp: &str) -> Result<()> {
        self.record(SignalingCommand::ModifyDialog {
            call_id: call_id.to_string(),
            sdp: new_sdp.to_string(),
        })
        .await
    }

    async fn send_refer(&self, call_id: &str, target_uri: &str) -> Result<()> {
        self.record(SignalingCommand::Refer {
            call_id: call_id.to_string(),
            target: target_uri.to_string(),
        })
        .await
    }

    async fn cancel_outbound_dialogs(&self, call_id: &str) -> Result<()> {
        self.record(SignalingCommand::CancelOutboundDialogs {
            call_id: call_id.to_string(),
        })
        .await
    }

    async fn destroy_dialog(&self, call_id: &str) -> Result<()> {
        self.record(SignalingCommand::DestroyDialog {
            call_id: call_id.to_string(),
        })
        .await
    }
}

/// A command received by [`RecordingMediaProxy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCommand {
    Offer { call_id: String, from_tag: String },
    Answer { call_id: String, from_tag: String, to_tag: String },
    Delete { call_id: String },
}

impl MediaCommand {
    pub fn name(&self) -> &'static str {
        match self {
            MediaCommand::Offer { .. } => "offer",
            MediaCommand::Answer { .. } => "answer",
            MediaCommand::Delete { .. } => "delete",
        }
    }
}

/// Media proxy double handing out a fixed rewritten SDP
#[derive(Debug, Default)]
pub struct RecordingMediaProxy {
    commands: Mutex<Vec<MediaCommand>>,
    /// Calls with an offered, not yet deleted media session
    sessions: Mutex<HashSet<String>>,
    faults: Mutex<Faults>,
}

/// SDP returned by [`RecordingMediaProxy`] for offers and answers
pub const PROXY_SDP: &str = "v=0\r\n\
o=- 1 1 IN IP4 203.0.113.10\r\n\
s=-\r\n\
c=IN IP4 203.0.113.10\r\n\
t=0 0\r\n\
m=audio 30000 RTP/AVP 0 8 101\r\n\
a=sendrecv\r\n";

impl RecordingMediaProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a command report `success = false`
    pub fn fail_on(&self, command: &'static str) {
        self.faults.lock().failing.insert(command);
    }

    /// Make a command never complete
    pub fn hang_on(&self, command: &'static str) {
        self.faults.lock().hanging.insert(command);
    }

    pub fn commands(&self) -> Vec<MediaCommand> {
        self.commands.lock().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands.lock().iter().filter(|c| c.name() == command).count()
    }

    /// Number of media sessions offered and not yet deleted
    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    async fn record(&self, command: MediaCommand) -> MediaResult {
        let name = command.name();
        let (failing, hanging) = {
            let faults = self.faults.lock();
            (faults.failing.contains(name), faults.hanging.contains(name))
        };
        match &command {
            MediaCommand::Offer { call_id, .. } if !failing => {
                self.sessions.lock().insert(call_id.clone());
            }
            MediaCommand::Delete { call_id } => {
                self.sessions.lock().remove(call_id);
            }
            _ => {}
        }
        self.commands.lock().push(command);

        if hanging {
            futures::future::pending::<()>().await;
        }
        if failing {
            MediaResult::failed(format!("{} rejected (injected)", name))
        } else {
            MediaResult::ok(PROXY_SDP)
        }
    }
}

#[async_trait]
impl MediaProxy for RecordingMediaProxy {
    async fn offer(&self, call_id: &str, from_tag: &str, _sdp: &str) -> Result<MediaResult> {
        Ok(self
            .record(MediaCommand::Offer {
                call_id: call_id.to_string(),
                from_tag: from_tag.to_string(),
            })
            .await)
    }

    async fn answer(&self, call_id: &str, from_tag: &str, to_tag: &str, _sdp: &str) -> Result<MediaResult> {
        Ok(self
            .record(MediaCommand::Answer {
                call_id: call_id.to_string(),
                from_tag: from_tag.to_string(),
                to_tag: to_tag.to_string(),
            })
            .await)
    }

    async fn delete(&self, call_id: &str) -> Result<MediaResult> {
        Ok(self
            .record(MediaCommand::Delete {
                call_id: call_id.to_string(),
            })
            .await)
    }
}
