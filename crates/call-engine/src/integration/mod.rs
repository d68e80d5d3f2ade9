//! # External engine integration
//!
//! The orchestrator never speaks SIP or RTP itself. It drives an external SIP
//! signaling engine and an external media proxy through the narrow command
//! sets below. Every command is awaited under a bounded timeout; an elapsed
//! timeout is reported as [`CallEngineError::Transport`] exactly like an
//! engine-side failure.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use pbx_registrar_core::DigestChallenge;

use crate::error::{CallEngineError, Result};

/// Commands understood by the SIP signaling engine.
///
/// Dialogs are keyed by the call id the engine reported with the original
/// INVITE.
#[async_trait]
pub trait SignalingEngine: Send + Sync {
    /// Answer a REGISTER with 401 and the given challenge
    async fn send_register_challenge(&self, extension_number: &str, challenge: &DigestChallenge) -> Result<()>;

    /// Place an outbound leg for `call_id` towards a contact URI.
    ///
    /// `caller_id` overrides the identity presented in From; `None` keeps
    /// the caller's own.
    async fn create_outbound_dialog(
        &self,
        call_id: &str,
        destination_contact: &str,
        local_sdp: &str,
        caller_id: Option<&str>,
    ) -> Result<()>;

    /// 200 OK the caller's leg with the negotiated SDP
    async fn accept_inbound_dialog(&self, call_id: &str, local_sdp: &str) -> Result<()>;

    /// re-INVITE with new SDP (hold / resume)
    async fn modify_dialog(&self, call_id: &str, new_sdp: &str) -> Result<()>;

    /// Blind transfer
    async fn send_refer(&self, call_id: &str, target_uri: &str) -> Result<()>;

    /// CANCEL the outbound legs still ringing, keeping the caller's leg up
    async fn cancel_outbound_dialogs(&self, call_id: &str) -> Result<()>;

    /// Tear down every leg of the call
    async fn destroy_dialog(&self, call_id: &str) -> Result<()>;
}

/// Result of a media proxy command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaResult {
    pub success: bool,
    /// SDP rewritten by the proxy
    pub sdp: Option<String>,
    pub error_reason: Option<String>,
}

impl MediaResult {
    pub fn ok(sdp: impl Into<String>) -> Self {
        Self {
            success: true,
            sdp: Some(sdp.into()),
            error_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            sdp: None,
            error_reason: Some(reason.into()),
        }
    }

    /// Negotiated SDP of a successful result, or a transport error
    pub fn into_sdp(self, command: &str, call_id: &str) -> Result<String> {
        match (self.success, self.sdp) {
            (true, Some(sdp)) => Ok(sdp),
            (true, None) => Err(CallEngineError::transport(format!(
                "media {} for {} returned no SDP",
                command, call_id
            ))),
            (false, _) => Err(CallEngineError::transport(format!(
                "media {} for {} failed: {}",
                command,
                call_id,
                self.error_reason.unwrap_or_else(|| "unknown".to_string())
            ))),
        }
    }
}

/// Commands understood by the media relay (rtpengine-style offer/answer/delete)
#[async_trait]
pub trait MediaProxy: Send + Sync {
    async fn offer(&self, call_id: &str, from_tag: &str, sdp: &str) -> Result<MediaResult>;

    async fn answer(&self, call_id: &str, from_tag: &str, to_tag: &str, sdp: &str) -> Result<MediaResult>;

    async fn delete(&self, call_id: &str) -> Result<MediaResult>;
}

/// Await a collaborator command with an upper bound
pub async fn bounded<T, F>(command: &str, call_id: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("⏱️ {} for call {} timed out after {:?}", command, call_id, limit);
            Err(CallEngineError::transport(format!(
                "{} for {} timed out after {}ms",
                command,
                call_id,
                limit.as_millis()
            )))
        }
    }
}

/// Rewrite the media direction attribute of an SDP body
pub fn set_media_direction(sdp: &str, direction: &str) -> String {
    let mut replaced = false;
    let mut lines: Vec<String> = sdp
        .lines()
        .map(|line| match line.trim_end() {
            "a=sendrecv" | "a=sendonly" | "a=recvonly" | "a=inactive" => {
                replaced = true;
                format!("a={}", direction)
            }
            other => other.to_string(),
        })
        .collect();
    if !replaced {
        lines.push(format!("a={}", direction));
    }
    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}
