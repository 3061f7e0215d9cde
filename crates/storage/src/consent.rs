use consentgate_core::{
    BannerProbe, Choice, Clock, Consent, ConsentDecision, DecisionSource, GateError, LegacyProbe,
    StorageConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{Cookie, CookieJar, KeyValueStore};

/// Canonical persisted form: `{"accepted": bool, "timestamp": ms, "expiry": ms}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub accepted: bool,
    pub timestamp: i64,
    pub expiry: i64,
}

impl ConsentRecord {
    fn decision(&self) -> ConsentDecision {
        ConsentDecision {
            consent: if self.accepted { Consent::Granted } else { Consent::Declined },
            issued_at: Some(self.timestamp),
            expires_at: Some(self.expiry),
            source: Some(DecisionSource::Canonical),
        }
    }
}

/// Owns the persisted consent decision: one canonical record plus an
/// ordered list of legacy places older scripts used.
#[derive(Clone)]
pub struct ConsentStore {
    local: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    cookies: CookieJar,
    clock: Arc<dyn Clock>,
    config: StorageConfig,
}

impl ConsentStore {
    pub fn new(
        local: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        cookies: CookieJar,
        clock: Arc<dyn Clock>,
        config: StorageConfig,
    ) -> Self {
        Self { local, session, cookies, clock, config }
    }

    pub fn key(&self) -> &str {
        &self.config.consent_key
    }

    /// Raw view of the canonical record, without purging anything.
    pub fn inspect(&self) -> Result<Option<ConsentRecord>, GateError> {
        let key = self.key();
        let Some(raw) = self.local.get_item(key) else {
            return Ok(None);
        };
        let record: ConsentRecord =
            serde_json::from_str(&raw).map_err(|e| GateError::malformed_state(key, e.to_string()))?;
        if record.expiry <= record.timestamp {
            return Err(GateError::malformed_state(key, "expiry is not after timestamp"));
        }
        Ok(Some(record))
    }

    pub fn read(&self) -> ConsentDecision {
        self.read_with(None)
    }

    /// Like [`read`](Self::read), with a page to evaluate banner heuristics
    /// against.
    pub fn read_with(&self, banner: Option<&dyn BannerProbe>) -> ConsentDecision {
        let now = self.clock.now_ms();
        match self.inspect() {
            Ok(Some(record)) => {
                let decision = record.decision();
                if decision.is_expired(now) {
                    info!(key = self.key(), expiry = record.expiry, "Consent record expired, purging");
                    self.purge();
                    return ConsentDecision::unknown();
                }
                decision
            }
            Ok(None) => self.probe_legacy(banner, now).unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "Discarding unreadable consent record");
                self.purge();
                ConsentDecision::unknown()
            }
        }
    }

    /// Persists `choice` for the configured retention window. The local write
    /// is visible to every other context on the same storage area.
    pub fn write(&self, choice: Choice) -> Result<ConsentDecision, GateError> {
        let now = self.clock.now_ms();
        let retention = self.config.retention().as_millis() as i64;
        let record = ConsentRecord {
            accepted: choice.accepted(),
            timestamp: now,
            expiry: now.saturating_add(retention),
        };
        if let Some(name) = &self.config.mirror_cookie {
            self.cookies.set(
                Cookie::new(name.as_str(), if record.accepted { "true" } else { "false" })
                    .with_path(self.config.cookie_path.as_str())
                    .expires_at(record.expiry),
            );
        }
        let json = serde_json::to_string(&record)
            .map_err(|e| GateError::storage_unavailable(self.key(), e))?;
        self.local
            .set_item(self.key(), &json)
            .map_err(|e| GateError::storage_unavailable(self.key(), e))?;
        debug!(key = self.key(), ?choice, expiry = record.expiry, "Consent written");
        Ok(record.decision())
    }

    /// Forgets the decision, including every legacy source so a later read
    /// cannot resurrect it.
    pub fn clear(&self) {
        self.purge();
        for probe in &self.config.legacy_probes {
            self.forget(probe);
        }
        info!(key = self.key(), "Consent cleared");
    }

    /// Drops the canonical record and its mirror. Storage flags go too: a
    /// flag left behind would be migrated again on the next read.
    fn purge(&self) {
        self.local.remove_item(self.key());
        if let Some(name) = &self.config.mirror_cookie {
            self.cookies.remove(name, &self.config.cookie_path);
        }
        for probe in &self.config.legacy_probes {
            if matches!(probe, LegacyProbe::LocalFlag { .. } | LegacyProbe::SessionFlag { .. }) {
                self.forget(probe);
            }
        }
    }

    fn forget(&self, probe: &LegacyProbe) {
        match probe {
            LegacyProbe::LocalFlag { key } => self.local.remove_item(key),
            LegacyProbe::SessionFlag { key } => self.session.remove_item(key),
            LegacyProbe::Cookie { name } => self.cookies.remove(name, &self.config.cookie_path),
            LegacyProbe::BannerHidden { .. } => {}
        }
    }

    fn is_mirror(&self, probe: &LegacyProbe) -> bool {
        matches!(probe, LegacyProbe::Cookie { name } if self.config.mirror_cookie.as_ref() == Some(name))
    }

    fn probe_legacy(&self, banner: Option<&dyn BannerProbe>, now: i64) -> Option<ConsentDecision> {
        for probe in &self.config.legacy_probes {
            let consent = match probe {
                LegacyProbe::Cookie { name } => match self.cookies.get(name, now).as_deref() {
                    Some("true") => Some(Consent::Granted),
                    Some("false") => Some(Consent::Declined),
                    _ => None,
                },
                LegacyProbe::LocalFlag { key } => flag(self.local.get_item(key)),
                LegacyProbe::SessionFlag { key } => flag(self.session.get_item(key)),
                LegacyProbe::BannerHidden { selector } => banner
                    .filter(|page| page.banner_hidden(selector))
                    .map(|_| Consent::Granted),
            };
            let Some(consent) = consent else {
                continue;
            };
            debug!(probe = %probe.label(), ?consent, "Consent found by legacy probe");
            let migratable = !matches!(probe, LegacyProbe::BannerHidden { .. });
            if migratable && self.config.migrate_legacy {
                let choice = if consent == Consent::Granted { Choice::Granted } else { Choice::Declined };
                match self.write(choice) {
                    Ok(_) if !self.is_mirror(probe) => self.forget(probe),
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, probe = %probe.label(), "Could not migrate legacy consent")
                    }
                }
            }
            return Some(ConsentDecision {
                consent,
                issued_at: None,
                expires_at: None,
                source: Some(DecisionSource::Legacy(probe.clone())),
            });
        }
        None
    }
}

fn flag(value: Option<String>) -> Option<Consent> {
    (value.as_deref() == Some("true")).then_some(Consent::Granted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, StorageArea};
    use consentgate_core::{ErrorCategory, ManualClock};
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        store: ConsentStore,
        local: crate::LocalStorage,
        session: Arc<MemoryStore>,
        cookies: CookieJar,
        clock: ManualClock,
    }

    fn fixture(config: StorageConfig) -> Fixture {
        let local = StorageArea::new().open();
        let session = Arc::new(MemoryStore::new());
        let cookies = CookieJar::new();
        let clock = ManualClock::new(NOW);
        let store = ConsentStore::new(
            Arc::new(local.clone()),
            session.clone(),
            cookies.clone(),
            Arc::new(clock.clone()),
            config,
        );
        Fixture { store, local, session, cookies, clock }
    }

    struct Banner(bool);

    impl BannerProbe for Banner {
        fn banner_hidden(&self, _selector: &str) -> bool {
            self.0
        }
    }

    #[test]
    fn write_then_read_round_trips_both_choices() {
        let f = fixture(StorageConfig::default());
        for choice in [Choice::Granted, Choice::Declined] {
            f.store.write(choice).unwrap();
            let decision = f.store.read();
            assert_eq!(decision.consent, Consent::from(choice));
            assert_eq!(decision.source, Some(DecisionSource::Canonical));
            assert!(decision.expires_at.unwrap() > NOW);
        }
    }

    #[test]
    fn record_is_json_with_expected_fields() {
        let f = fixture(StorageConfig::default());
        f.store.write(Choice::Granted).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&f.local.get_item("vimeo-consent").unwrap()).unwrap();
        assert_eq!(raw["accepted"], true);
        assert_eq!(raw["timestamp"], NOW);
        assert_eq!(raw["expiry"], NOW + 180 * 24 * 3600 * 1000);
        assert_eq!(f.cookies.get("vimeo_consent", NOW).as_deref(), Some("true"));
    }

    #[test]
    fn malformed_records_read_as_unknown_and_are_purged() {
        let f = fixture(StorageConfig::default());
        let samples = [
            "true",
            "{",
            "{\"accepted\":true}",
            "{\"accepted\":\"yes\",\"timestamp\":1,\"expiry\":2}",
            "{\"accepted\":true,\"timestamp\":5,\"expiry\":5}",
            "",
        ];
        for raw in samples {
            f.local.set_item("vimeo-consent", raw).unwrap();
            let err = f.store.inspect().unwrap_err();
            assert_eq!(err.category, ErrorCategory::MalformedStoredState, "{raw}");
            assert_eq!(f.store.read().consent, Consent::Unknown, "{raw}");
            assert_eq!(f.local.get_item("vimeo-consent"), None, "{raw}");
        }
    }

    #[test]
    fn expired_record_is_unknown_and_removed() {
        let f = fixture(StorageConfig::default());
        f.store.write(Choice::Granted).unwrap();
        f.clock.advance(Duration::from_secs(181 * 24 * 3600));
        assert_eq!(f.store.read(), ConsentDecision::unknown());
        assert_eq!(f.local.get_item("vimeo-consent"), None);
        assert_eq!(f.cookies.get("vimeo_consent", f.clock.now_ms()), None);
    }

    #[test]
    fn stale_record_written_in_the_past_is_purged() {
        let f = fixture(StorageConfig::default());
        let stale = ConsentRecord { accepted: true, timestamp: NOW - 10_000, expiry: NOW - 1 };
        f.local.set_item("vimeo-consent", &serde_json::to_string(&stale).unwrap()).unwrap();
        assert_eq!(f.store.inspect().unwrap(), Some(stale));
        assert_eq!(f.store.read().consent, Consent::Unknown);
        assert_eq!(f.store.inspect().unwrap(), None);
    }

    #[test]
    fn legacy_local_flag_is_found_and_migrated() {
        let f = fixture(StorageConfig::default());
        f.local.set_item("cookiesAccepted", "true").unwrap();
        let decision = f.store.read();
        assert!(decision.is_granted());
        assert_eq!(
            decision.source,
            Some(DecisionSource::Legacy(LegacyProbe::LocalFlag { key: "cookiesAccepted".to_string() }))
        );
        assert_eq!(f.store.read().source, Some(DecisionSource::Canonical));
    }

    #[test]
    fn migrated_flag_does_not_outlive_record_expiry() {
        let f = fixture(StorageConfig::default());
        f.local.set_item("cookiesAccepted", "true").unwrap();
        assert!(f.store.read().is_granted());
        assert_eq!(f.local.get_item("cookiesAccepted"), None);

        f.clock.advance(Duration::from_secs(181 * 24 * 3600));
        assert_eq!(f.store.read(), ConsentDecision::unknown());
        assert_eq!(f.store.read(), ConsentDecision::unknown());
        assert_eq!(f.local.get_item("vimeo-consent"), None);
    }

    #[test]
    fn purging_a_bad_record_drops_stale_flags() {
        let f = fixture(StorageConfig::default());
        f.local.set_item("vimeo-consent", "{").unwrap();
        f.local.set_item("vimeo-cookies-accepted", "true").unwrap();
        f.session.set_item("cookieBannerClosed", "true").unwrap();
        assert_eq!(f.store.read().consent, Consent::Unknown);
        assert_eq!(f.store.read().consent, Consent::Unknown);
        assert_eq!(f.local.get_item("vimeo-consent"), None);
        assert_eq!(f.session.get_item("cookieBannerClosed"), None);
    }

    #[test]
    fn mirror_cookie_survives_its_own_migration() {
        let f = fixture(StorageConfig::default());
        f.cookies.set(Cookie::new("vimeo_consent", "true"));
        assert!(f.store.read().is_granted());
        assert_eq!(f.store.read().source, Some(DecisionSource::Canonical));
        assert_eq!(f.cookies.get("vimeo_consent", NOW).as_deref(), Some("true"));
    }

    #[test]
    fn legacy_flags_need_literal_true() {
        let f = fixture(StorageConfig::default());
        f.local.set_item("vimeo-cookies-accepted", "1").unwrap();
        f.session.set_item("cookieBannerClosed", "false").unwrap();
        assert_eq!(f.store.read().consent, Consent::Unknown);
        f.session.set_item("cookieBannerClosed", "true").unwrap();
        assert!(f.store.read().is_granted());
    }

    #[test]
    fn probes_run_in_configured_order() {
        let config = StorageConfig {
            migrate_legacy: false,
            ..StorageConfig::default()
        };
        let f = fixture(config);
        f.cookies.set(Cookie::new("vimeo_consent", "false"));
        f.local.set_item("vimeo-cookies-accepted", "true").unwrap();
        let decision = f.store.read();
        assert!(decision.is_declined());
        assert_eq!(f.local.get_item("vimeo-consent"), None);
    }

    #[test]
    fn banner_heuristic_needs_a_page_and_is_not_migrated() {
        let f = fixture(StorageConfig::default());
        assert_eq!(f.store.read().consent, Consent::Unknown);
        assert_eq!(f.store.read_with(Some(&Banner(false))).consent, Consent::Unknown);
        assert!(f.store.read_with(Some(&Banner(true))).is_granted());
        assert_eq!(f.local.get_item("vimeo-consent"), None);
    }

    #[test]
    fn clear_removes_record_cookie_and_legacy_flags() {
        let f = fixture(StorageConfig::default());
        f.store.write(Choice::Granted).unwrap();
        f.local.set_item("cookiesAccepted", "true").unwrap();
        f.session.set_item("cookieBannerClosed", "true").unwrap();
        f.store.clear();
        assert_eq!(f.store.read().consent, Consent::Unknown);
        assert!(f.local.keys().is_empty());
        assert_eq!(f.cookies.header(NOW), "");
    }

    #[test]
    fn failed_write_still_mirrors_cookie() {
        let local = StorageArea::with_quota(4).open();
        let cookies = CookieJar::new();
        let store = ConsentStore::new(
            Arc::new(local),
            Arc::new(MemoryStore::new()),
            cookies.clone(),
            Arc::new(ManualClock::new(NOW)),
            StorageConfig { migrate_legacy: false, ..StorageConfig::default() },
        );
        let err = store.write(Choice::Granted).unwrap_err();
        assert_eq!(err.category, ErrorCategory::StorageUnavailable);
        let decision = store.read();
        assert!(decision.is_granted());
        assert!(matches!(decision.source, Some(DecisionSource::Legacy(LegacyProbe::Cookie { .. }))));
    }
}
