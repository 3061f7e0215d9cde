//! Keeps embedded Vimeo players from loading until the visitor consents to
//! the provider's cookies.
//!
//! ```no_run
//! use consentgate::{ConsentGate, CookieBridge};
//! use consentgate_core::{GateConfig, SystemClock};
//! use consentgate_scheduler::{EventLoop, Page};
//! use consentgate_storage::{CookieJar, StorageArea};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), consentgate_core::GateError> {
//! let mut page = Page::open("<body></body>", &StorageArea::new(), &CookieJar::new(), Arc::new(SystemClock));
//! let mut event_loop = EventLoop::new();
//! let config = GateConfig::default();
//! let gate = ConsentGate::install(&mut event_loop, &mut page, config.clone())?;
//! CookieBridge::new(&page, &config)?.with_gate(gate.clone()).install(&mut event_loop, &mut page);
//! event_loop.run_until_idle(&mut page);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod controller;
pub mod overlay;
pub mod scanner;
pub mod shared;

pub use bridge::CookieBridge;
pub use controller::{FrameSnapshot, GateController};
pub use overlay::{OverlayAction, OverlayVariant};
pub use scanner::{FrameScanner, FrameState, VideoElement};

use consentgate_core::{Choice, ConsentDecision, GateConfig, GateError};
use consentgate_scheduler::{EventHandler, EventLoop, Page, PageEvent, ReadyState};
use consentgate_storage::ConsentStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Handle to a page's gate, shared by the event loop and by other scripts
/// on the page.
#[derive(Clone)]
pub struct ConsentGate {
    controller: Arc<Mutex<GateController>>,
}

impl ConsentGate {
    pub fn new(page: &Page, config: GateConfig) -> Result<Self, GateError> {
        Ok(Self { controller: Arc::new(Mutex::new(GateController::new(page, config)?)) })
    }

    /// Registers the gate with the page's event loop. On a page that has
    /// already finished loading the gate initializes right away.
    pub fn install(event_loop: &mut EventLoop, page: &mut Page, config: GateConfig) -> Result<Self, GateError> {
        let gate = Self::new(page, config)?;
        if page.ready_state() == ReadyState::Complete {
            gate.lock().initialize(page);
        }
        event_loop.register(gate.clone());
        Ok(gate)
    }

    fn lock(&self) -> MutexGuard<'_, GateController> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_consent(&self, page: &Page) -> bool {
        self.consent(page).is_granted()
    }

    pub fn consent(&self, page: &Page) -> ConsentDecision {
        self.lock().store().read_with(Some(&page.document))
    }

    /// Same as the visitor clicking accept or decline on an overlay.
    pub fn set_consent(&self, page: &mut Page, choice: Choice) -> Result<ConsentDecision, GateError> {
        let mut controller = self.lock();
        match choice {
            Choice::Granted => controller.on_user_accept(page),
            Choice::Declined => controller.on_user_decline(page),
        }
    }

    /// Loads every gated video; returns how many were loaded by this call.
    pub fn enable_all(&self, page: &mut Page) -> usize {
        self.lock().enable_all(page)
    }

    /// Picks up frames inserted after the gate initialized.
    pub fn scan(&self, page: &mut Page) -> usize {
        self.lock().scan(page)
    }

    pub fn frames(&self) -> Vec<FrameSnapshot> {
        self.lock().frames()
    }

    pub fn store(&self) -> ConsentStore {
        self.lock().store().clone()
    }
}

impl EventHandler for ConsentGate {
    fn handle(&mut self, page: &mut Page, event: &PageEvent) {
        self.lock().handle(page, event);
    }
}
