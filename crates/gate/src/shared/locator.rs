use consentgate_core::{GateError, RetryConfig};
use consentgate_dom::{NodeId, Selector};
use consentgate_scheduler::{Page, TimerId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Found on this attempt
    Found(NodeId),
    /// Found earlier; nothing new to subscribe
    AlreadyFound,
    /// Not found, another attempt is scheduled
    Retrying,
    /// Not found and the retry budget is spent
    GaveUp,
}

/// Finds a banner control that may render after the page script runs,
/// retrying on page timers with bounded exponential backoff.
pub struct BannerLocator {
    component: &'static str,
    selector: Selector,
    retry: RetryConfig,
    attempts: u32,
    pending: Option<TimerId>,
    found: Option<NodeId>,
    gave_up: bool,
}

impl BannerLocator {
    pub fn new(component: &'static str, selector: &str, retry: RetryConfig) -> Result<Self, GateError> {
        Ok(Self {
            component,
            selector: Selector::parse(selector)?,
            retry,
            attempts: 0,
            pending: None,
            found: None,
            gave_up: false,
        })
    }

    pub fn owns_timer(&self, timer: TimerId) -> bool {
        self.pending == Some(timer)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// One lookup. Any pending retry is superseded, so calling this from a
    /// ready signal never leaves two retries in flight.
    pub fn attempt(&mut self, page: &mut Page) -> Lookup {
        if let Some(timer) = self.pending.take() {
            page.clear_timeout(timer);
        }
        if self.found.is_some() {
            return Lookup::AlreadyFound;
        }

        self.attempts += 1;
        if let Some(node) = page.document.query_selector(page.document.root(), &self.selector) {
            debug!(component = self.component, attempt = self.attempts, %node, "Banner control found");
            self.found = Some(node);
            return Lookup::Found(node);
        }

        match self.retry.delay_after(self.attempts) {
            Some(delay) => {
                debug!(
                    component = self.component,
                    attempt = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Banner control not rendered yet, retrying"
                );
                self.pending = Some(page.set_timeout(delay));
                Lookup::Retrying
            }
            None => {
                let err = GateError::missing_collaborator(self.selector.source(), self.attempts);
                if self.gave_up {
                    debug!(component = self.component, error = %err, "Banner control still missing");
                } else {
                    warn!(component = self.component, error = %err, "Giving up on banner control");
                }
                self.gave_up = true;
                Lookup::GaveUp
            }
        }
    }
}
