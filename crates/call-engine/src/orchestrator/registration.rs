//! REGISTER handling
//!
//! Digest challenge/response in front of the registration directory. A REGISTER
//! without credentials, with a stale nonce, or with an unparseable
//! Authorization header is answered with a fresh challenge; a wrong response is
//! refused. With authentication required, an extension that has no password
//! cannot register at all.

use tracing::{debug, info, warn};

use pbx_registrar_core::{
    ContactBinding, DigestChallenge, DigestCredentials, RegistrarError, Registration, RegistrationOutcome,
    RemovalReason,
};

use super::core::CallEngine;
use crate::entities::Extension;
use crate::error::{CallEngineError, Result};
use crate::events::{EventKind, RegistrationPayload, Topic};
use crate::integration::bounded;

/// A REGISTER as reported by the signaling engine
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// User part of the address-of-record
    pub extension_number: String,
    pub binding: ContactBinding,
    /// Requested expiry; `None` uses the configured default
    pub expires: Option<u32>,
    /// Raw Authorization header value
    pub authorization: Option<String>,
}

/// What the REGISTER resulted in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterResponse {
    /// 401 sent with this challenge
    Challenged(DigestChallenge),
    Registered(Registration),
    Unregistered,
}

impl CallEngine {
    /// Authenticate and apply a REGISTER
    pub async fn handle_register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let extension = self.find_active_extension(&request.extension_number).await?;

        if self.config.registrar.require_auth {
            let Some(password) = extension.sip_password.as_deref() else {
                warn!("🔒 REGISTER for {} refused: no SIP password configured", extension.number);
                return Err(RegistrarError::AuthenticationFailed(extension.number.clone()).into());
            };
            if let Some(challenge) = self.check_credentials(&extension, &request, password)? {
                self.send_challenge(&extension, &challenge).await?;
                return Ok(RegisterResponse::Challenged(challenge));
            }
        }

        let expires = request
            .expires
            .unwrap_or(self.config.registrar.default_expires);
        let outcome = self
            .directory
            .register(&extension.id, request.binding, expires)
            .await?;

        match outcome {
            RegistrationOutcome::Registered { registration, superseded } => {
                if let Some(old) = superseded {
                    debug!(
                        "Extension {} moved from {} to {}",
                        extension.number, old.contact, registration.contact
                    );
                }
                self.publish_registered(&registration);
                Ok(RegisterResponse::Registered(registration))
            }
            RegistrationOutcome::Refreshed(registration) => Ok(RegisterResponse::Registered(registration)),
            RegistrationOutcome::Unregistered(removed) => {
                if let Some(registration) = removed {
                    self.publish_unregistered(&registration, RemovalReason::Unregister);
                }
                Ok(RegisterResponse::Unregistered)
            }
        }
    }

    /// Administrative unregister; idempotent
    pub fn unregister_extension(&self, extension_id: &str) -> Option<Registration> {
        let removed = self.directory.unregister(extension_id);
        if let Some(registration) = &removed {
            self.publish_unregistered(registration, RemovalReason::Unregister);
        }
        removed
    }

    /// Current binding of an extension
    pub fn lookup_registration(&self, extension_id: &str) -> Option<Registration> {
        self.directory.lookup(extension_id)
    }

    /// `Ok(None)` when the credentials verify, `Ok(Some(challenge))` when the
    /// client should (re)authenticate.
    fn check_credentials(
        &self,
        extension: &Extension,
        request: &RegisterRequest,
        password: &str,
    ) -> Result<Option<DigestChallenge>> {
        let Some(header) = request.authorization.as_deref() else {
            debug!("REGISTER for {} without credentials, challenging", extension.number);
            return Ok(Some(self.digest.challenge(false)));
        };

        let verified = DigestCredentials::parse(header).and_then(|creds| {
            if creds.username != extension.number {
                warn!(
                    "Digest username {} does not match extension {}",
                    creds.username, extension.number
                );
                return Err(RegistrarError::AuthenticationFailed(creds.username));
            }
            self.digest.verify(&creds, "REGISTER", password)
        });

        match verified {
            Ok(()) => Ok(None),
            Err(e) if e.is_challengeable() => {
                debug!("Re-challenging {}: {}", extension.number, e);
                let stale = matches!(e, RegistrarError::StaleNonce(_));
                Ok(Some(self.digest.challenge(stale)))
            }
            Err(e) => {
                warn!("🔒 REGISTER for {} refused: {}", extension.number, e);
                Err(e.into())
            }
        }
    }

    async fn send_challenge(&self, extension: &Extension, challenge: &DigestChallenge) -> Result<()> {
        bounded(
            "send_register_challenge",
            &extension.number,
            self.signaling_timeout(),
            self.signaling.send_register_challenge(&extension.number, challenge),
        )
        .await
    }

    pub(super) async fn find_active_extension(&self, number: &str) -> Result<Extension> {
        let extension = bounded(
            "find_extension_by_number",
            number,
            self.store_timeout(),
            self.entities.find_extension_by_number(number),
        )
        .await?;
        if !extension.is_active() {
            return Err(CallEngineError::not_found(format!("extension {} is inactive", number)));
        }
        Ok(extension)
    }

    pub(super) fn publish_registered(&self, registration: &Registration) {
        info!(
            "📇 Extension {} registered at {}",
            registration.extension_id, registration.contact
        );
        let payload = RegistrationPayload {
            extension_id: registration.extension_id.clone(),
            contact: registration.contact.clone(),
            transport: registration.transport.to_string(),
            expires_at: Some(registration.expires_at),
            reason: None,
        };
        self.events
            .publish(Topic::Broadcast, EventKind::ExtensionRegistered, &payload);
    }

    pub(super) fn publish_unregistered(&self, registration: &Registration, reason: RemovalReason) {
        let payload = RegistrationPayload {
            extension_id: registration.extension_id.clone(),
            contact: registration.contact.clone(),
            transport: registration.transport.to_string(),
            expires_at: None,
            reason: Some(reason.as_str().to_string()),
        };
        self.events
            .publish(Topic::Broadcast, EventKind::ExtensionUnregistered, &payload);
    }
}
