use serde::{Deserialize, Serialize};
use std::fmt;

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BannerConfig, GateConfig, LegacyProbe, ProviderConfig, RetryConfig, SignalConfig, StorageConfig,
};
pub use error::{ErrorCategory, GateError};

/// The user's consent as far as this page can tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consent {
    /// No valid decision on record
    #[default]
    Unknown,
    Granted,
    Declined,
}

/// A decision a writer can persist. `Unknown` is never written, only cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Choice {
    Granted,
    Declined,
}

impl From<Choice> for Consent {
    fn from(choice: Choice) -> Self {
        match choice {
            Choice::Granted => Consent::Granted,
            Choice::Declined => Consent::Declined,
        }
    }
}

impl Choice {
    pub fn accepted(self) -> bool {
        matches!(self, Choice::Granted)
    }
}

/// Where a decision was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSource {
    Canonical,
    Legacy(LegacyProbe),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDecision {
    pub consent: Consent,
    /// Milliseconds since the Unix epoch
    pub issued_at: Option<i64>,
    /// Milliseconds since the Unix epoch
    pub expires_at: Option<i64>,
    pub source: Option<DecisionSource>,
}

impl ConsentDecision {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_granted(&self) -> bool {
        self.consent == Consent::Granted
    }

    pub fn is_declined(&self) -> bool {
        self.consent == Consent::Declined
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|expiry| now_ms >= expiry)
    }
}

/// Numeric video id taken from the provider's embed URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VideoId(pub u64);

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gating state of a tracked video element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GateState {
    /// Source withheld, overlay shown
    Gated,
    /// Source applied, overlay gone. Terminal for the page's life.
    Loaded,
}

impl GateState {
    pub fn marker(self) -> &'static str {
        match self {
            GateState::Gated => "gated",
            GateState::Loaded => "loaded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalSource {
    /// Click on an overlay button or the banner's own controls
    UserAction,
    /// Another script on the same page (custom event, banner visibility)
    CrossComponent,
    /// Storage change made by another browsing context
    CrossTab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentSignal {
    pub source: SignalSource,
    pub consent: Consent,
}

impl ConsentSignal {
    pub fn new(source: SignalSource, consent: Consent) -> Self {
        Self { source, consent }
    }
}

/// Lets the consent store evaluate the banner-visibility heuristic without
/// depending on a concrete DOM.
pub trait BannerProbe {
    /// True when an element matching `selector` exists and is hidden.
    fn banner_hidden(&self, selector: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_expires_at_its_expiry() {
        let decision = ConsentDecision {
            consent: Consent::Granted,
            issued_at: Some(1_000),
            expires_at: Some(2_000),
            source: Some(DecisionSource::Canonical),
        };
        assert!(!decision.is_expired(1_999));
        assert!(decision.is_expired(2_000));
        assert!(!ConsentDecision::unknown().is_expired(i64::MAX));
    }

    #[test]
    fn choice_maps_onto_consent() {
        assert_eq!(Consent::from(Choice::Granted), Consent::Granted);
        assert_eq!(Consent::from(Choice::Declined), Consent::Declined);
        assert!(Choice::Granted.accepted());
        assert!(!Choice::Declined.accepted());
    }
}
