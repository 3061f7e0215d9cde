use consentgate_core::{Choice, GateConfig, GateError};
use consentgate_dom::NodeId;
use consentgate_scheduler::{EventHandler, EventLoop, Page, PageEvent, ReadyState};
use consentgate_storage::ConsentStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ConsentGate;
use crate::shared::{BannerLocator, Lookup};

/// Connects the site's cookie banner to the gate: accepting on the banner
/// persists consent, announces it and unblocks the videos.
pub struct CookieBridge {
    store: ConsentStore,
    locator: BannerLocator,
    accept_event: String,
    banner_ready_event: String,
    accept: Option<NodeId>,
    gate: Option<ConsentGate>,
}

impl CookieBridge {
    pub fn new(page: &Page, config: &GateConfig) -> Result<Self, GateError> {
        Ok(Self {
            store: ConsentStore::new(
                Arc::new(page.local_storage().clone()),
                page.session_storage(),
                page.cookies().clone(),
                page.clock(),
                config.storage.clone(),
            ),
            locator: BannerLocator::new("bridge", &config.banner.accept_selector, config.retry.clone())?,
            accept_event: config.signals.accept_event.clone(),
            banner_ready_event: config.signals.banner_ready_event.clone(),
            accept: None,
            gate: None,
        })
    }

    pub fn with_gate(mut self, gate: ConsentGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn install(mut self, event_loop: &mut EventLoop, page: &mut Page) {
        if page.ready_state() == ReadyState::Complete {
            self.attach(page);
        }
        event_loop.register(self);
    }

    fn attach(&mut self, page: &mut Page) {
        if self.accept.is_some() {
            return;
        }
        if let Lookup::Found(accept) = self.locator.attempt(page) {
            info!(%accept, "Cookie bridge attached to banner");
            self.accept = Some(accept);
        }
    }

    fn on_accept(&mut self, page: &mut Page) {
        match self.store.write(Choice::Granted) {
            Ok(decision) => debug!(expiry = ?decision.expires_at, "Banner consent stored"),
            Err(err) => warn!(error = %err, "Banner consent not persisted"),
        }
        page.dispatch_custom(&self.accept_event);
        if let Some(gate) = &self.gate {
            gate.enable_all(page);
        }
    }
}

impl EventHandler for CookieBridge {
    fn handle(&mut self, page: &mut Page, event: &PageEvent) {
        match event {
            PageEvent::DomReady => self.attach(page),
            PageEvent::Custom { name } if *name == self.banner_ready_event => self.attach(page),
            PageEvent::Timer(timer) if self.locator.owns_timer(*timer) => self.attach(page),
            PageEvent::Click { target } => {
                if self.accept.is_some_and(|accept| page.document.contains(accept, *target)) {
                    self.on_accept(page);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consentgate_core::ManualClock;
    use consentgate_storage::{CookieJar, StorageArea};

    const BANNER: &str = r#"<div class="cookie-banner"><a class="consent-link">Accept</a></div>"#;

    #[test]
    fn accept_click_persists_consent() {
        let mut page = Page::open(BANNER, &StorageArea::new(), &CookieJar::new(), Arc::new(ManualClock::new(0)));
        let mut event_loop = EventLoop::new();
        let bridge = CookieBridge::new(&page, &GateConfig::default()).unwrap();
        let store = bridge.store.clone();
        bridge.install(&mut event_loop, &mut page);
        event_loop.run_until_idle(&mut page);

        let accept = page.query(".consent-link").unwrap();
        page.click(accept);
        event_loop.run_until_idle(&mut page);
        assert!(store.read().is_granted());
        assert_eq!(page.cookies().get("vimeo_consent", 0).as_deref(), Some("true"));
    }

    #[test]
    fn attaches_immediately_on_loaded_page() {
        let mut page = Page::open(BANNER, &StorageArea::new(), &CookieJar::new(), Arc::new(ManualClock::new(0)));
        let mut event_loop = EventLoop::new();
        event_loop.run_until_idle(&mut page);
        let mut bridge = CookieBridge::new(&page, &GateConfig::default()).unwrap();
        bridge.attach(&mut page);
        assert_eq!(bridge.accept, page.query(".consent-link"));
        assert_eq!(page.pending_timers(), 0);
    }
}
