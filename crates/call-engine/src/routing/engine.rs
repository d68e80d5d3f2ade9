//! Inbound and outbound rule evaluation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::pattern::DialPattern;
use super::trunk_usage::{TrunkLease, TrunkUsage};
use crate::entities::{
    CallerIdMode, Destination, EntityStore, Extension, InboundRule, OutboundRule, RuleStatus, Trunk,
};
use crate::error::{CallEngineError, Result};

/// Result of inbound resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRoute {
    pub rule_id: String,
    pub destination: Destination,
    /// The rule was out of its time window and its fallback was used
    pub via_fallback: bool,
}

/// Result of outbound resolution. Holds the trunk slot until dropped.
#[derive(Debug)]
pub struct OutboundRoute {
    pub rule_id: String,
    /// Number as dialed
    pub dialed: String,
    /// Number after strip/prepend, as sent to the trunk
    pub number: String,
    pub caller_id: Option<String>,
    pub trunk: Trunk,
    /// The rule's trunk was unreachable and its backup was used
    pub failed_over: bool,
    pub max_duration_secs: Option<u64>,
    pub lease: TrunkLease,
}

/// Resolves dialed numbers to destinations
pub struct RoutingEngine {
    store: Arc<dyn EntityStore>,
    usage: TrunkUsage,
}

impl RoutingEngine {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            usage: TrunkUsage::new(),
        }
    }

    pub fn trunk_usage(&self) -> &TrunkUsage {
        &self.usage
    }

    /// Resolve a DID arriving on `trunk_id` to a destination.
    pub async fn resolve_inbound(
        &self,
        did: &str,
        trunk_id: Option<&str>,
        caller_number: &str,
        now: DateTime<Utc>,
    ) -> Result<InboundRoute> {
        let mut rules: Vec<InboundRule> = self
            .store
            .inbound_rules()
            .await?
            .into_iter()
            .filter(|r| r.status == RuleStatus::Active)
            .collect();
        rules.sort_by_key(|r| (r.priority, r.sequence));

        for rule in rules {
            let Some(did_pattern) = compile(&rule.id, &rule.did_pattern) else {
                continue;
            };
            if !did_pattern.matches(did) {
                continue;
            }
            if let Some(scope) = &rule.trunk_id {
                if trunk_id != Some(scope.as_str()) {
                    continue;
                }
            }
            if let Some(caller_pattern) = &rule.caller_id_pattern {
                match compile(&rule.id, caller_pattern) {
                    Some(p) if p.matches(caller_number) => {}
                    _ => continue,
                }
            }

            let in_window = rule.time_window.as_ref().map(|w| w.contains(now)).unwrap_or(true);
            if in_window {
                info!("📍 DID {} matched inbound rule {} -> {}", did, rule.id, rule.destination);
                return Ok(InboundRoute {
                    rule_id: rule.id,
                    destination: rule.destination,
                    via_fallback: false,
                });
            }

            match rule.fallback {
                Some(fallback) => {
                    info!(
                        "📍 DID {} matched inbound rule {} outside its hours, using fallback {}",
                        did, rule.id, fallback
                    );
                    return Ok(InboundRoute {
                        rule_id: rule.id,
                        destination: fallback,
                        via_fallback: true,
                    });
                }
                None => {
                    debug!("Inbound rule {} out of window with no fallback, continuing", rule.id);
                }
            }
        }

        warn!("❌ No inbound route for DID {} on trunk {:?}", did, trunk_id);
        Err(CallEngineError::no_route(format!("inbound DID {}", did)))
    }

    /// Resolve a number dialed by `originator` (`None` for system-originated
    /// calls, which bypass the role filter) to a trunk and a rewritten number.
    pub async fn resolve_outbound(
        &self,
        dialed: &str,
        originator: Option<&Extension>,
    ) -> Result<OutboundRoute> {
        let role = originator.map(|ext| ext.role);

        let mut rules: Vec<OutboundRule> = self
            .store
            .outbound_rules()
            .await?
            .into_iter()
            .filter(|r| r.status == RuleStatus::Active)
            .collect();
        rules.sort_by_key(|r| (r.priority, r.sequence));

        let rule = rules
            .into_iter()
            .find(|rule| {
                rule.permits(role)
                    && compile(&rule.id, &rule.number_pattern)
                        .map(|p| p.matches(dialed))
                        .unwrap_or(false)
            })
            .ok_or_else(|| {
                warn!("❌ No outbound route for {} (role {:?})", dialed, role);
                CallEngineError::no_route(format!("outbound number {}", dialed))
            })?;

        let number = rewrite_number(dialed, rule.strip_digits, &rule.prepend);
        let (trunk, failed_over) = self.select_trunk(&rule).await?;

        let caller_id = match rule.caller_id_mode {
            CallerIdMode::Extension => originator
                .map(|ext| ext.number.clone())
                .or_else(|| trunk.default_caller_id.clone()),
            CallerIdMode::Custom => rule
                .custom_caller_id
                .clone()
                .or_else(|| originator.map(|ext| ext.number.clone())),
            CallerIdMode::Trunk => trunk
                .default_caller_id
                .clone()
                .or_else(|| originator.map(|ext| ext.number.clone())),
        };

        let lease = self.usage.try_acquire(&trunk).ok_or_else(|| {
            warn!(
                "🚫 Trunk {} saturated ({} concurrent calls) for {}",
                trunk.id, trunk.max_concurrent_calls, dialed
            );
            CallEngineError::TrunkSaturated(trunk.id.clone())
        })?;

        info!(
            "📍 {} matched outbound rule {} -> {} via trunk {}{}",
            dialed,
            rule.id,
            number,
            trunk.id,
            if failed_over { " (backup)" } else { "" }
        );

        Ok(OutboundRoute {
            rule_id: rule.id,
            dialed: dialed.to_string(),
            number,
            caller_id,
            trunk,
            failed_over,
            max_duration_secs: rule.max_duration_secs,
            lease,
        })
    }

    /// The rule's trunk, or its backup when the primary is unreachable.
    /// The backup's own backup is never consulted.
    async fn select_trunk(&self, rule: &OutboundRule) -> Result<(Trunk, bool)> {
        let primary = match self.store.find_trunk(&rule.trunk_id).await {
            Ok(trunk) => trunk,
            Err(CallEngineError::NotFound(_)) => {
                warn!("Outbound rule {} references missing trunk {}", rule.id, rule.trunk_id);
                return Err(CallEngineError::no_route(format!("trunk {} missing", rule.trunk_id)));
            }
            Err(e) => return Err(e),
        };

        if primary.is_reachable() {
            return Ok((primary, false));
        }

        let Some(backup_id) = primary.backup_trunk_id.as_deref() else {
            warn!("Trunk {} unreachable and has no backup", primary.id);
            return Err(CallEngineError::no_route(format!("trunk {} unreachable", primary.id)));
        };

        match self.store.find_trunk(backup_id).await {
            Ok(backup) if backup.is_reachable() => {
                info!("🔀 Trunk {} unreachable, failing over to {}", primary.id, backup.id);
                Ok((backup, true))
            }
            Ok(backup) => {
                warn!("Trunk {} and its backup {} both unreachable", primary.id, backup.id);
                Err(CallEngineError::no_route(format!(
                    "trunk {} and backup {} unreachable",
                    primary.id, backup.id
                )))
            }
            Err(CallEngineError::NotFound(_)) => Err(CallEngineError::no_route(format!(
                "trunk {} unreachable, backup {} missing",
                primary.id, backup_id
            ))),
            Err(e) => Err(e),
        }
    }
}

/// Compile a stored pattern; unparseable rules are skipped, not fatal
fn compile(rule_id: &str, pattern: &str) -> Option<DialPattern> {
    match DialPattern::parse(pattern) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!("Skipping rule {}: {}", rule_id, e);
            None
        }
    }
}

/// Remove `strip` leading characters, then prefix `prepend`
pub fn rewrite_number(dialed: &str, strip: usize, prepend: &str) -> String {
    let rest: String = dialed.chars().skip(strip).collect();
    format!("{}{}", prepend, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{InMemoryEntityStore, Role, TimeWindow, TrunkStatus};
    use chrono::{NaiveTime, TimeZone, Weekday};

    fn engine_with(store: InMemoryEntityStore) -> RoutingEngine {
        RoutingEngine::new(Arc::new(store))
    }

    fn agent() -> Extension {
        Extension::new("e200", "200", Role::Agent)
    }

    #[test]
    fn test_rewrite_number() {
        assert_eq!(rewrite_number("0049891234567", 2, "+"), "+49891234567");
        assert_eq!(rewrite_number("9123", 1, ""), "123");
        assert_eq!(rewrite_number("12", 5, "0"), "0");
    }

    #[tokio::test]
    async fn test_outbound_priority_and_insertion_order() {
        let store = InMemoryEntityStore::new();
        store.add_trunk(Trunk::new("t1", "a.example")).unwrap();
        store.add_trunk(Trunk::new("t2", "b.example")).unwrap();
        store.add_outbound_rule(OutboundRule::new("broad", "0*", 50, "t1")).unwrap();
        store.add_outbound_rule(OutboundRule::new("first", "0049*", 10, "t1")).unwrap();
        store.add_outbound_rule(OutboundRule::new("second", "0049*", 10, "t2")).unwrap();

        let route = engine_with(store).resolve_outbound("0049891234567", Some(&agent())).await.unwrap();
        assert_eq!(route.rule_id, "first");
        assert_eq!(route.trunk.id, "t1");
        assert_eq!(route.caller_id.as_deref(), Some("200"));
    }

    #[tokio::test]
    async fn test_outbound_role_filter() {
        let store = InMemoryEntityStore::new();
        store.add_trunk(Trunk::new("t1", "a.example")).unwrap();
        let mut intl = OutboundRule::new("intl", "00*", 1, "t1");
        intl.allowed_roles = vec![Role::Admin];
        store.add_outbound_rule(intl).unwrap();

        let engine = engine_with(store);
        let err = engine.resolve_outbound("0044123", Some(&agent())).await.unwrap_err();
        assert!(matches!(err, CallEngineError::NoRouteFound(_)));

        // system-originated calls are not role-restricted
        assert!(engine.resolve_outbound("0044123", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_outbound_digit_manipulation_and_caller_id() {
        let store = InMemoryEntityStore::new();
        let mut trunk = Trunk::new("t1", "a.example");
        trunk.default_caller_id = Some("+49301111".to_string());
        store.add_trunk(trunk).unwrap();

        let mut rule = OutboundRule::new("r", "9*", 1, "t1");
        rule.strip_digits = 1;
        rule.prepend = "+49".to_string();
        rule.caller_id_mode = CallerIdMode::Custom;
        rule.custom_caller_id = Some("+49302222".to_string());
        rule.max_duration_secs = Some(3600);
        store.add_outbound_rule(rule).unwrap();

        let route = engine_with(store).resolve_outbound("930123", Some(&agent())).await.unwrap();
        assert_eq!(route.number, "+4930123");
        assert_eq!(route.caller_id.as_deref(), Some("+49302222"));
        assert_eq!(route.max_duration_secs, Some(3600));
    }

    #[tokio::test]
    async fn test_failover_is_one_hop() {
        let store = InMemoryEntityStore::new();
        let mut t1 = Trunk::new("t1", "a.example");
        t1.status = TrunkStatus::Inactive;
        t1.backup_trunk_id = Some("t2".to_string());
        let mut t2 = Trunk::new("t2", "b.example");
        t2.status = TrunkStatus::Testing;
        t2.backup_trunk_id = Some("t3".to_string());
        store.add_trunk(t1).unwrap();
        store.add_trunk(t2).unwrap();
        store.add_trunk(Trunk::new("t3", "c.example")).unwrap();
        store.add_outbound_rule(OutboundRule::new("r", "0*", 1, "t1")).unwrap();

        let engine = engine_with(store);
        let err = engine.resolve_outbound("0301", Some(&agent())).await.unwrap_err();
        assert!(matches!(err, CallEngineError::NoRouteFound(_)));
    }

    #[tokio::test]
    async fn test_failover_to_backup() {
        let store = InMemoryEntityStore::new();
        let mut t1 = Trunk::new("t1", "a.example");
        t1.status = TrunkStatus::Inactive;
        t1.backup_trunk_id = Some("t2".to_string());
        store.add_trunk(t1).unwrap();
        store.add_trunk(Trunk::new("t2", "b.example")).unwrap();
        store.add_outbound_rule(OutboundRule::new("r", "0*", 1, "t1")).unwrap();

        let route = engine_with(store).resolve_outbound("0301", Some(&agent())).await.unwrap();
        assert_eq!(route.trunk.id, "t2");
        assert!(route.failed_over);
    }

    #[tokio::test]
    async fn test_saturated_trunk_refused_and_released() {
        let store = InMemoryEntityStore::new();
        let mut t2 = Trunk::new("t2", "b.example");
        t2.max_concurrent_calls = 1;
        store.add_trunk(t2).unwrap();
        store.add_outbound_rule(OutboundRule::new("r", "0049*", 1, "t2")).unwrap();
        let engine = engine_with(store);

        let held = engine.resolve_outbound("0049891234567", Some(&agent())).await.unwrap();
        let err = engine.resolve_outbound("0049891234567", Some(&agent())).await.unwrap_err();
        assert_eq!(err, CallEngineError::TrunkSaturated("t2".to_string()));

        drop(held);
        assert!(engine.resolve_outbound("0049891234567", Some(&agent())).await.is_ok());
    }

    #[tokio::test]
    async fn test_inbound_trunk_scope_and_caller_filter() {
        let store = InMemoryEntityStore::new();
        let mut scoped = InboundRule::new("scoped", "+4930*", 1, Destination::queue("vip"));
        scoped.trunk_id = Some("t9".to_string());
        store.add_inbound_rule(scoped).unwrap();
        let mut screened = InboundRule::new("screened", "+4930*", 2, Destination::voicemail("vm1"));
        screened.caller_id_pattern = Some("+1*".to_string());
        store.add_inbound_rule(screened).unwrap();
        store.add_inbound_rule(InboundRule::new("default", "+4930*", 3, Destination::queue("q1"))).unwrap();

        let engine = engine_with(store);
        let now = Utc::now();
        let route = engine.resolve_inbound("+4930123456", Some("t1"), "+4470000", now).await.unwrap();
        assert_eq!(route.rule_id, "default");

        let route = engine.resolve_inbound("+4930123456", Some("t9"), "+4470000", now).await.unwrap();
        assert_eq!(route.destination, Destination::queue("vip"));

        let route = engine.resolve_inbound("+4930123456", Some("t1"), "+15550100", now).await.unwrap();
        assert_eq!(route.destination, Destination::voicemail("vm1"));

        let err = engine.resolve_inbound("+4940000", Some("t1"), "+1", now).await.unwrap_err();
        assert!(matches!(err, CallEngineError::NoRouteFound(_)));
    }

    #[tokio::test]
    async fn test_inbound_time_window_fallback() {
        let store = InMemoryEntityStore::new();
        let mut rule = InboundRule::new("hours", "+4930*", 1, Destination::queue("q1"));
        rule.time_window = Some(TimeWindow {
            days: vec![Weekday::Mon],
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            utc_offset_minutes: 0,
        });
        rule.fallback = Some(Destination::voicemail("after-hours"));
        store.add_inbound_rule(rule).unwrap();
        let engine = engine_with(store);

        let monday_noon = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
        let monday_night = Utc.with_ymd_and_hms(2024, 1, 15, 22, 0, 0).unwrap();

        let open = engine.resolve_inbound("+4930123", None, "", monday_noon).await.unwrap();
        assert!(!open.via_fallback);
        let closed = engine.resolve_inbound("+4930123", None, "", monday_night).await.unwrap();
        assert!(closed.via_fallback);
        assert_eq!(closed.destination, Destination::voicemail("after-hours"));
    }

    #[tokio::test]
    async fn test_invalid_pattern_rule_is_skipped() {
        let store = InMemoryEntityStore::new();
        store.add_inbound_rule(InboundRule::new("broken", "[1-", 1, Destination::queue("x"))).unwrap();
        store.add_inbound_rule(InboundRule::new("ok", "1*", 2, Destination::queue("q"))).unwrap();
        let route = engine_with(store).resolve_inbound("123", None, "", Utc::now()).await.unwrap();
        assert_eq!(route.rule_id, "ok");
    }
}
