use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::GateError;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub storage: StorageConfig,
    pub provider: ProviderConfig,
    pub banner: BannerConfig,
    pub signals: SignalConfig,
    pub retry: RetryConfig,
}

impl GateConfig {
    /// Missing sections and fields fall back to their defaults.
    pub fn from_json(json: &str) -> Result<Self, GateError> {
        serde_json::from_str(json).map_err(|e| GateError::config(format!("Invalid gate config: {}", e)))
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.storage.retention_days = days;
        self
    }

    pub fn with_legacy_probes(mut self, probes: Vec<LegacyProbe>) -> Self {
        self.storage.legacy_probes = probes;
        self
    }
}

/// One backward-compatible place a decision may have been left by an older
/// script version. Probed in list order when the canonical record is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LegacyProbe {
    /// Cookie holding `true` or `false`
    Cookie { name: String },
    /// localStorage flag holding `true`
    LocalFlag { key: String },
    /// sessionStorage flag holding `true`
    SessionFlag { key: String },
    /// Banner element present but hidden. Heuristic, never migrated.
    BannerHidden { selector: String },
}

impl LegacyProbe {
    pub fn label(&self) -> String {
        match self {
            LegacyProbe::Cookie { name } => format!("cookie:{}", name),
            LegacyProbe::LocalFlag { key } => format!("local:{}", key),
            LegacyProbe::SessionFlag { key } => format!("session:{}", key),
            LegacyProbe::BannerHidden { selector } => format!("banner:{}", selector),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// localStorage key of the canonical JSON record
    pub consent_key: String,
    pub retention_days: u32,
    /// Cookie mirroring the canonical value, if any
    pub mirror_cookie: Option<String>,
    pub cookie_path: String,
    pub legacy_probes: Vec<LegacyProbe>,
    /// Rewrite storage-based legacy hits into the canonical record
    pub migrate_legacy: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            consent_key: "vimeo-consent".to_string(),
            retention_days: 180,
            mirror_cookie: Some("vimeo_consent".to_string()),
            cookie_path: "/".to_string(),
            legacy_probes: vec![
                LegacyProbe::Cookie { name: "vimeo_consent".to_string() },
                LegacyProbe::LocalFlag { key: "vimeo-cookies-accepted".to_string() },
                LegacyProbe::LocalFlag { key: "cookiesAccepted".to_string() },
                LegacyProbe::SessionFlag { key: "cookieBannerClosed".to_string() },
                LegacyProbe::BannerHidden { selector: ".cookie-banner".to_string() },
            ],
            migrate_legacy: true,
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(u64::from(self.retention_days) * DAY_MS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Shown in overlay copy
    pub name: String,
    /// Embed URLs must have this host or a subdomain of it
    pub domain: String,
    pub frame_selector: String,
    /// Path segment preceding the numeric id, as in `/video/76979871`
    pub id_segment: String,
    /// Sandbox applied when a frame is loaded; `None` leaves it untouched
    pub loaded_sandbox: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "Vimeo".to_string(),
            domain: "vimeo.com".to_string(),
            frame_selector: "iframe".to_string(),
            id_segment: "video".to_string(),
            loaded_sandbox: Some(
                "allow-same-origin allow-scripts allow-pointer-lock allow-forms allow-popups allow-popups-to-escape-sandbox"
                    .to_string(),
            ),
        }
    }
}

/// Selector contract of the site's cookie banner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BannerConfig {
    pub banner_selector: String,
    pub accept_selector: String,
    pub decline_selector: Option<String>,
    pub close_selector: Option<String>,
    pub watched_attributes: Vec<String>,
}

impl Default for BannerConfig {
    fn default() -> Self {
        Self {
            banner_selector: ".cookie-banner".to_string(),
            accept_selector: ".cookie-banner .consent-link".to_string(),
            decline_selector: Some(".cookie-banner .decline-link".to_string()),
            close_selector: Some(".cookie-banner .close-btn".to_string()),
            watched_attributes: vec!["style".to_string(), "class".to_string()],
        }
    }
}

/// Names of the custom events exchanged with other scripts on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub accept_event: String,
    pub banner_ready_event: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            accept_event: "cookiesAccepted".to_string(),
            banner_ready_event: "cookieBannerReady".to_string(),
        }
    }
}

/// Bounded exponential backoff used while waiting for a late banner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    /// Total lookups, including the first immediate one
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 2000,
            multiplier: 2,
            max_attempts: 8,
        }
    }
}

impl RetryConfig {
    pub fn fast() -> Self {
        Self {
            initial_delay_ms: 10,
            max_delay_ms: 200,
            multiplier: 2,
            max_attempts: 5,
        }
    }

    pub fn patient() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            multiplier: 2,
            max_attempts: 12,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before lookup number `attempt + 1`, `None` once the budget is
    /// spent. `attempt` counts lookups already made.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt - 1);
        let delay = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}
