//! Shared fixture for the call-engine integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use pbx_call_engine::prelude::*;
use pbx_call_engine::testing::{RecordingMediaProxy, RecordingSignaling};
use pbx_registrar_core::auth::digest_response;
use pbx_registrar_core::{DigestChallenge, ManualClock};

/// Caller SDP used by every test INVITE
pub const CALLER_SDP: &str = "v=0\r\n\
o=- 1 1 IN IP4 198.51.100.7\r\n\
s=-\r\n\
c=IN IP4 198.51.100.7\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 0\r\n\
a=sendrecv\r\n";

/// Monday morning, inside usual business hours
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
}

pub struct Pbx {
    pub engine: CallEngine,
    pub store: Arc<InMemoryEntityStore>,
    pub signaling: Arc<RecordingSignaling>,
    pub media: Arc<RecordingMediaProxy>,
    pub clock: Arc<ManualClock>,
}

pub async fn pbx(store: Arc<InMemoryEntityStore>) -> Pbx {
    pbx_with_config(store, EngineConfig::default()).await
}

pub async fn pbx_with_config(store: Arc<InMemoryEntityStore>, config: EngineConfig) -> Pbx {
    let signaling = Arc::new(RecordingSignaling::new());
    let media = Arc::new(RecordingMediaProxy::new());
    let clock = Arc::new(ManualClock::new(start_time()));

    let engine = CallEngine::builder(config)
        .with_entity_store(store.clone())
        .with_signaling(signaling.clone())
        .with_media(media.clone())
        .with_clock(clock.clone())
        .with_random_seed(7)
        .build()
        .await
        .expect("engine builds");

    Pbx {
        engine,
        store,
        signaling,
        media,
        clock,
    }
}

impl Pbx {
    /// Register an extension through a full digest exchange
    pub async fn register(&self, number: &str, contact: &str) -> Registration {
        let binding = ContactBinding::new(contact, "10.0.0.20", 5060, TransportKind::Udp);
        let mut request = RegisterRequest {
            extension_number: number.to_string(),
            binding,
            expires: Some(3600),
            authorization: None,
        };
        let challenge = match self.engine.handle_register(request.clone()).await.expect("register") {
            RegisterResponse::Challenged(challenge) => challenge,
            other => panic!("expected a challenge, got {:?}", other),
        };

        let extension = self
            .store
            .find_extension_by_number(number)
            .await
            .expect("extension exists");
        let password = extension.sip_password.expect("extension has a password");
        request.authorization = Some(digest_authorization(number, &password, &challenge, "00000001"));
        match self.engine.handle_register(request).await.expect("register") {
            RegisterResponse::Registered(registration) => registration,
            other => panic!("expected a registration, got {:?}", other),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub fn invite(&self, call_id: &str, from: &str, to: &str) -> InviteRequest {
        InviteRequest::new(call_id, from, to, CALLER_SDP)
    }
}

pub fn extension(id: &str, number: &str, role: Role) -> Extension {
    Extension::new(id, number, role)
        .with_display_name(format!("Ext {}", number))
        .with_password(format!("pw-{}", number))
}

/// Authorization header answering `challenge` as extension `number`
pub fn digest_authorization(number: &str, password: &str, challenge: &DigestChallenge, nc: &str) -> String {
    let uri = "sip:pbx.local";
    let cnonce = "7c3f21aa";
    let response = digest_response(
        number,
        password,
        &challenge.realm,
        "REGISTER",
        uri,
        &challenge.nonce,
        Some("auth"),
        Some(nc),
        Some(cnonce),
    );
    format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", \
         algorithm=MD5, qop=auth, nc={}, cnonce=\"{}\"",
        number, challenge.realm, challenge.nonce, uri, response, nc, cnonce
    )
}
