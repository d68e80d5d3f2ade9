//! Extension registration directory

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::RegistrarConfig;
use crate::error::{RegistrarError, Result};
use crate::types::{ContactBinding, Registration};

/// Entity-store view the directory needs: does this extension exist?
#[async_trait]
pub trait ExtensionCatalog: Send + Sync {
    async fn is_known(&self, extension_id: &str) -> bool;
}

/// What a REGISTER did to the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// New binding, possibly superseding one for a different contact
    Registered {
        registration: Registration,
        superseded: Option<Registration>,
    },
    /// Same contact re-registered; expiry extended
    Refreshed(Registration),
    /// expires=0; carries the binding that was removed, if any
    Unregistered(Option<Registration>),
}

impl RegistrationOutcome {
    pub fn registration(&self) -> Option<&Registration> {
        match self {
            RegistrationOutcome::Registered { registration, .. } => Some(registration),
            RegistrationOutcome::Refreshed(registration) => Some(registration),
            RegistrationOutcome::Unregistered(_) => None,
        }
    }
}

/// Thread-safe directory of current contact bindings, one per extension
///
/// Each extension is its own DashMap key, so a REGISTER for one extension
/// only contends with operations on the same shard.
pub struct RegistrationDirectory {
    /// Map of extension id to its current binding
    bindings: Arc<DashMap<String, Registration>>,

    config: RegistrarConfig,

    catalog: Arc<dyn ExtensionCatalog>,

    clock: Arc<dyn Clock>,
}

impl RegistrationDirectory {
    pub fn new(config: RegistrarConfig, catalog: Arc<dyn ExtensionCatalog>) -> Self {
        Self::with_clock(config, catalog, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: RegistrarConfig,
        catalog: Arc<dyn ExtensionCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bindings: Arc::new(DashMap::new()),
            config,
            catalog,
            clock,
        }
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Register (or refresh, or with `expires == 0` remove) an extension's contact.
    ///
    /// A new REGISTER supersedes whatever binding the extension had; bindings are
    /// never accumulated.
    pub async fn register(
        &self,
        extension_id: &str,
        binding: ContactBinding,
        expires: u32,
    ) -> Result<RegistrationOutcome> {
        if !self.catalog.is_known(extension_id).await {
            warn!("REGISTER for unknown extension {}", extension_id);
            return Err(RegistrarError::not_found(extension_id));
        }

        if expires == 0 {
            let removed = self.unregister(extension_id);
            return Ok(RegistrationOutcome::Unregistered(removed));
        }

        if binding.contact.trim().is_empty() {
            return Err(RegistrarError::invalid("empty contact URI"));
        }

        let expires = self.normalize_expires(expires);
        let now = self.clock.now();
        let expires_at = now + Duration::seconds(i64::from(expires));

        let mut registration = Registration {
            extension_id: extension_id.to_string(),
            contact: binding.contact,
            source_ip: binding.source_ip,
            port: binding.port,
            transport: binding.transport,
            user_agent: binding.user_agent,
            registered_at: now,
            expires_at,
        };

        let outcome = match self.bindings.entry(extension_id.to_string()) {
            Entry::Occupied(mut existing) => {
                let previous = existing.get().clone();
                if previous.contact == registration.contact && !previous.is_expired(now) {
                    registration.registered_at = previous.registered_at;
                    existing.insert(registration.clone());
                    RegistrationOutcome::Refreshed(registration)
                } else {
                    existing.insert(registration.clone());
                    let superseded = (!previous.is_expired(now)).then_some(previous);
                    RegistrationOutcome::Registered { registration, superseded }
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(registration.clone());
                RegistrationOutcome::Registered { registration, superseded: None }
            }
        };

        match &outcome {
            RegistrationOutcome::Refreshed(reg) => {
                debug!("Extension {} refreshed {} for {}s", extension_id, reg.contact, expires)
            }
            RegistrationOutcome::Registered { registration, .. } => info!(
                "Extension {} registered at {} via {} for {}s",
                extension_id, registration.contact, registration.transport, expires
            ),
            RegistrationOutcome::Unregistered(_) => {}
        }

        Ok(outcome)
    }

    /// Remove an extension's binding. Absent bindings are not an error.
    pub fn unregister(&self, extension_id: &str) -> Option<Registration> {
        match self.bindings.remove(extension_id) {
            Some((_, registration)) => {
                info!("Extension {} unregistered ({})", extension_id, registration.contact);
                Some(registration)
            }
            None => {
                debug!("Unregister for {} with no binding", extension_id);
                None
            }
        }
    }

    /// Current non-expired binding for an extension
    pub fn lookup(&self, extension_id: &str) -> Option<Registration> {
        let now = self.clock.now();
        self.bindings
            .get(extension_id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
    }

    pub fn is_registered(&self, extension_id: &str) -> bool {
        self.lookup(extension_id).is_some()
    }

    /// Remove every binding whose expiry has passed and return what was removed.
    ///
    /// Removal re-checks expiry under the shard lock, so a refresh racing the
    /// sweep is never lost.
    pub fn sweep_expired(&self) -> Vec<Registration> {
        let now = self.clock.now();

        let candidates: Vec<String> = self
            .bindings
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(candidates.len());
        for extension_id in candidates {
            if let Some((_, registration)) = self
                .bindings
                .remove_if(&extension_id, |_, reg| reg.is_expired(now))
            {
                warn!("Registration expired for extension {}", extension_id);
                removed.push(registration);
            }
        }

        if !removed.is_empty() {
            info!("Registration sweep removed {} binding(s)", removed.len());
        }
        removed
    }

    /// All current non-expired bindings
    pub fn active_registrations(&self) -> Vec<Registration> {
        let now = self.clock.now();
        self.bindings
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Clamp a requested expiry into the configured bounds
    fn normalize_expires(&self, expires: u32) -> u32 {
        expires.clamp(self.config.min_expires, self.config.max_expires)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::TransportKind;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    struct Known(HashSet<String>);

    #[async_trait]
    impl ExtensionCatalog for Known {
        async fn is_known(&self, extension_id: &str) -> bool {
            self.0.contains(extension_id)
        }
    }

    fn directory(clock: &ManualClock) -> RegistrationDirectory {
        let known = ["ext-100", "ext-200", "ext-300"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        RegistrationDirectory::with_clock(
            RegistrarConfig::default(),
            Arc::new(Known(known)),
            Arc::new(clock.clone()),
        )
    }

    fn binding(contact: &str) -> ContactBinding {
        ContactBinding::new(contact, "10.0.0.5", 5060, TransportKind::Udp).with_user_agent("Test UA")
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let clock = ManualClock::new(Utc::now());
        let dir = directory(&clock);

        let outcome = dir.register("ext-100", binding("sip:100@10.0.0.5"), 3600).await.unwrap();
        assert!(matches!(outcome, RegistrationOutcome::Registered { superseded: None, .. }));

        let reg = dir.lookup("ext-100").unwrap();
        assert_eq!(reg.contact, "sip:100@10.0.0.5");
        assert_eq!(reg.user_agent.as_deref(), Some("Test UA"));
        assert_eq!(reg.expires_at, clock.now() + Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_unknown_extension_rejected() {
        let clock = ManualClock::default();
        let dir = directory(&clock);
        let err = dir.register("ext-999", binding("sip:999@x"), 60).await.unwrap_err();
        assert_eq!(err, RegistrarError::ExtensionNotFound("ext-999".to_string()));
    }

    #[tokio::test]
    async fn test_new_contact_supersedes_previous() {
        let clock = ManualClock::default();
        let dir = directory(&clock);
        dir.register("ext-100", binding("sip:100@desk"), 3600).await.unwrap();
        let outcome = dir.register("ext-100", binding("sip:100@mobile"), 3600).await.unwrap();

        match outcome {
            RegistrationOutcome::Registered { superseded: Some(prev), .. } => {
                assert_eq!(prev.contact, "sip:100@desk")
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(dir.active_registrations().len(), 1);
        assert_eq!(dir.lookup("ext-100").unwrap().contact, "sip:100@mobile");
    }

    #[tokio::test]
    async fn test_refresh_keeps_registered_at() {
        let clock = ManualClock::default();
        let dir = directory(&clock);
        dir.register("ext-100", binding("sip:100@desk"), 600).await.unwrap();
        let first = dir.lookup("ext-100").unwrap();

        clock.advance(Duration::seconds(300));
        let outcome = dir.register("ext-100", binding("sip:100@desk"), 600).await.unwrap();
        assert!(matches!(outcome, RegistrationOutcome::Refreshed(_)));

        let refreshed = dir.lookup("ext-100").unwrap();
        assert_eq!(refreshed.registered_at, first.registered_at);
        assert_eq!(refreshed.expires_at, first.expires_at + Duration::seconds(300));
    }

    #[tokio::test]
    async fn test_expires_zero_unregisters() {
        let clock = ManualClock::default();
        let dir = directory(&clock);
        dir.register("ext-300", binding("sip:300@desk"), 3600).await.unwrap();

        let outcome = dir.register("ext-300", binding("sip:300@desk"), 0).await.unwrap();
        assert!(matches!(outcome, RegistrationOutcome::Unregistered(Some(_))));
        assert!(dir.lookup("ext-300").is_none());

        // idempotent
        assert!(dir.unregister("ext-300").is_none());
    }

    #[tokio::test]
    async fn test_expiry_is_clamped() {
        let clock = ManualClock::default();
        let dir = directory(&clock);
        dir.register("ext-100", binding("sip:100@a"), 5).await.unwrap();
        dir.register("ext-200", binding("sip:200@a"), 1_000_000).await.unwrap();

        let now = clock.now();
        assert_eq!(dir.lookup("ext-100").unwrap().expires_at, now + Duration::seconds(60));
        assert_eq!(dir.lookup("ext-200").unwrap().expires_at, now + Duration::seconds(86400));
    }

    #[tokio::test]
    async fn test_lookup_hides_expired_binding() {
        let clock = ManualClock::default();
        let dir = directory(&clock);
        dir.register("ext-100", binding("sip:100@a"), 60).await.unwrap();

        clock.advance(Duration::seconds(61));
        assert!(dir.lookup("ext-100").is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_exactly_expired() {
        let clock = ManualClock::default();
        let dir = directory(&clock);
        dir.register("ext-100", binding("sip:100@a"), 60).await.unwrap();
        dir.register("ext-200", binding("sip:200@a"), 120).await.unwrap();
        dir.register("ext-300", binding("sip:300@a"), 3600).await.unwrap();

        // ext-200 expires exactly now: not yet past
        clock.advance(Duration::seconds(120));
        let removed: Vec<String> = dir.sweep_expired().into_iter().map(|r| r.extension_id).collect();
        assert_eq!(removed, vec!["ext-100".to_string()]);
        assert!(dir.lookup("ext-200").is_some());
        assert!(dir.lookup("ext-300").is_some());

        // second sweep at the same instant is a no-op
        assert!(dir.sweep_expired().is_empty());
        assert_eq!(dir.active_registrations().len(), 2);
    }
}
