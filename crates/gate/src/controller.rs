use consentgate_core::{
    Choice, Consent, ConsentDecision, ConsentSignal, GateConfig, GateError, GateState, SignalSource,
    VideoId,
};
use consentgate_dom::{Document, NodeId, ObserverId, Selector};
use consentgate_scheduler::{Page, PageEvent};
use consentgate_storage::ConsentStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::overlay::{OverlayAction, OverlayVariant, Overlays};
use crate::scanner::{
    DEFERRED_SRC_ATTR, FrameScanner, FrameState, STATE_ATTR, VideoElement, WITHHELD_SRC_ATTR,
};
use crate::shared::{BannerLocator, Lookup};

/// Read-only view of a tracked frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub id: VideoId,
    pub node: NodeId,
    pub state: GateState,
    pub overlay: Option<NodeId>,
}

struct TrackedFrame {
    video: VideoElement,
    state: GateState,
    overlay: Option<NodeId>,
    variant: OverlayVariant,
}

struct BannerSubscription {
    accept: NodeId,
    decline: Option<NodeId>,
    close: Option<NodeId>,
    banner: Option<NodeId>,
    observer: Option<ObserverId>,
}

impl BannerSubscription {
    fn observe(&mut self, doc: &mut Document, attributes: &[String]) {
        if let (Some(banner), None) = (self.banner, self.observer) {
            self.observer = Some(doc.observe(banner, attributes));
            debug!(%banner, "Observing banner visibility");
        }
    }

    fn dispose(&mut self, doc: &mut Document) {
        if let Some(observer) = self.observer.take() {
            doc.disconnect(observer);
            debug!("Banner observer disconnected");
        }
    }
}

/// Gates every provider frame on the page until consent is granted.
pub struct GateController {
    config: GateConfig,
    store: ConsentStore,
    scanner: FrameScanner,
    overlays: Overlays,
    locator: BannerLocator,
    banner_selector: Selector,
    decline_selector: Option<Selector>,
    close_selector: Option<Selector>,
    frames: Vec<TrackedFrame>,
    banner: Option<BannerSubscription>,
    initialized: bool,
    all_loaded: bool,
}

impl GateController {
    pub fn new(page: &Page, config: GateConfig) -> Result<Self, GateError> {
        let store = ConsentStore::new(
            Arc::new(page.local_storage().clone()),
            page.session_storage(),
            page.cookies().clone(),
            page.clock(),
            config.storage.clone(),
        );
        let optional = |selector: &Option<String>| selector.as_deref().map(Selector::parse).transpose();
        Ok(Self {
            store,
            scanner: FrameScanner::new(&config.provider)?,
            overlays: Overlays::new(&config.provider)?,
            locator: BannerLocator::new("gate", &config.banner.accept_selector, config.retry.clone())?,
            banner_selector: Selector::parse(&config.banner.banner_selector)?,
            decline_selector: optional(&config.banner.decline_selector)?,
            close_selector: optional(&config.banner.close_selector)?,
            frames: Vec::new(),
            banner: None,
            initialized: false,
            all_loaded: false,
            config,
        })
    }

    pub fn store(&self) -> &ConsentStore {
        &self.store
    }

    pub fn initialize(&mut self, page: &mut Page) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        let tracked = self.scan(page);
        info!(frames = tracked, "Consent gate initialized");
        self.subscribe_banner(page);
    }

    /// Picks up frames not tracked yet and returns how many were added.
    pub fn scan(&mut self, page: &mut Page) -> usize {
        let decision = self.store.read_with(Some(&page.document));
        let found: Vec<VideoElement> = self
            .scanner
            .discover(&page.document, page.document.root())
            .filter(|video| !self.is_tracked(video.node))
            .collect();
        let added = found.len();

        for video in found {
            match video.state {
                FrameState::Loaded => {
                    debug!(video_id = %video.id, node = %video.node, "Adopting loaded frame");
                    self.track(video, GateState::Loaded, None, OverlayVariant::Prompt);
                }
                FrameState::Fresh | FrameState::Gated if decision.is_granted() => {
                    let index = self.track(video, GateState::Gated, None, OverlayVariant::Prompt);
                    if let Some(overlay) = self.overlays.find_existing(&page.document, self.frames[index].video.node) {
                        self.frames[index].overlay = Some(overlay);
                    }
                    self.load(page, index);
                }
                FrameState::Gated => {
                    let overlay = self.overlays.find_existing(&page.document, video.node);
                    let variant = match overlay {
                        Some(existing) => self.overlays.variant_of(&page.document, existing),
                        None => OverlayVariant::for_consent(decision.consent),
                    };
                    debug!(video_id = %video.id, node = %video.node, adopted_overlay = overlay.is_some(), "Adopting gated frame");
                    let index = self.track(video, GateState::Gated, overlay, variant);
                    if overlay.is_none() {
                        self.show_overlay(page, index, variant);
                    }
                }
                FrameState::Fresh => {
                    let variant = OverlayVariant::for_consent(decision.consent);
                    withhold(&mut page.document, &video);
                    info!(video_id = %video.id, node = %video.node, consent = ?decision.consent, "Video gated");
                    let index = self.track(video, GateState::Gated, None, variant);
                    self.show_overlay(page, index, variant);
                }
            }
        }

        if self.any_gated() {
            // Frames gated after a page-wide enable need the banner signals again.
            self.all_loaded = false;
            if let Some(banner) = &mut self.banner {
                banner.observe(&mut page.document, &self.config.banner.watched_attributes);
            }
        } else if decision.is_granted() && !self.frames.is_empty() {
            self.all_loaded = true;
            self.release_banner(page);
        }
        added
    }

    /// Loads every gated frame. Once this has run and nothing is gated,
    /// further calls are no-ops.
    pub fn enable_all(&mut self, page: &mut Page) -> usize {
        let gated: Vec<usize> = (0..self.frames.len())
            .filter(|&index| self.frames[index].state == GateState::Gated)
            .collect();
        if self.all_loaded && gated.is_empty() {
            debug!("All videos already enabled");
            return 0;
        }
        for &index in &gated {
            self.load(page, index);
        }
        if !self.frames.is_empty() {
            self.all_loaded = true;
            self.release_banner(page);
        }
        info!(loaded = gated.len(), "Enabled all videos");
        gated.len()
    }

    /// Persists Granted and loads everything. Videos load even when the
    /// write fails: the user consented on this page.
    pub fn on_user_accept(&mut self, page: &mut Page) -> Result<ConsentDecision, GateError> {
        let written = self.store.write(Choice::Granted);
        self.enable_all(page);
        written
    }

    pub fn on_user_decline(&mut self, page: &mut Page) -> Result<ConsentDecision, GateError> {
        let written = self.store.write(Choice::Declined);
        self.rerender(page, OverlayVariant::Declined);
        written
    }

    pub fn on_reprompt(&mut self, page: &mut Page) {
        self.rerender(page, OverlayVariant::Prompt);
    }

    /// Granted signals load everything; anything else is ignored since a
    /// loaded frame is never re-blocked.
    pub fn on_signal(&mut self, page: &mut Page, signal: ConsentSignal) {
        match signal.consent {
            Consent::Granted => {
                debug!(source = ?signal.source, "Consent granted signal");
                self.enable_all(page);
            }
            consent => debug!(source = ?signal.source, ?consent, "Ignoring consent signal"),
        }
    }

    pub fn frames(&self) -> Vec<FrameSnapshot> {
        self.frames
            .iter()
            .map(|frame| FrameSnapshot {
                id: frame.video.id,
                node: frame.video.node,
                state: frame.state,
                overlay: frame.overlay,
            })
            .collect()
    }

    pub fn handle(&mut self, page: &mut Page, event: &PageEvent) {
        match event {
            PageEvent::DomReady => self.initialize(page),
            _ if !self.initialized => {}
            PageEvent::Click { target } => self.on_click(page, *target),
            PageEvent::Custom { name } if *name == self.config.signals.accept_event => {
                if !self.store.read().is_granted() {
                    if let Err(err) = self.store.write(Choice::Granted) {
                        warn!(error = %err, event = %name, "Could not persist consent from event");
                    }
                }
                self.on_signal(page, ConsentSignal::new(SignalSource::CrossComponent, Consent::Granted));
            }
            PageEvent::Custom { name } if *name == self.config.signals.banner_ready_event => {
                debug!(event = %name, "Banner ready");
                self.subscribe_banner(page);
            }
            PageEvent::Custom { .. } => {}
            PageEvent::Storage(change) => {
                if change.key.as_deref().is_some_and(|key| key != self.store.key()) {
                    return;
                }
                let decision = self.store.read();
                debug!(key = ?change.key, consent = ?decision.consent, "Consent changed in another tab");
                self.on_signal(page, ConsentSignal::new(SignalSource::CrossTab, decision.consent));
            }
            PageEvent::Mutation(record) => {
                let ours = self.banner.as_ref().and_then(|banner| banner.observer) == Some(record.observer);
                if !ours || page.document.is_rendered(record.target) {
                    return;
                }
                let decision = self.store.read();
                debug!(attribute = %record.attribute, consent = ?decision.consent, "Banner hidden");
                if decision.is_granted() {
                    self.on_signal(page, ConsentSignal::new(SignalSource::CrossComponent, decision.consent));
                }
            }
            PageEvent::Timer(timer) => {
                if self.locator.owns_timer(*timer) {
                    self.subscribe_banner(page);
                }
            }
        }
    }

    fn on_click(&mut self, page: &mut Page, target: NodeId) {
        if let Some((action, overlay)) = self.overlays.action_for(&page.document, target) {
            debug!(?action, %overlay, "Overlay button clicked");
            let result = match action {
                OverlayAction::Accept => self.on_user_accept(page).map(|_| ()),
                OverlayAction::Decline => self.on_user_decline(page).map(|_| ()),
                OverlayAction::Reprompt => {
                    self.on_reprompt(page);
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!(error = %err, "Consent choice not persisted");
            }
            return;
        }

        let Some(banner) = &self.banner else {
            return;
        };
        let doc = &page.document;
        let hit = |control: Option<NodeId>| control.is_some_and(|c| doc.contains(c, target));
        let (accept, decline, close) = (hit(Some(banner.accept)), hit(banner.decline), hit(banner.close));

        if accept {
            if let Err(err) = self.on_user_accept(page) {
                warn!(error = %err, "Consent choice not persisted");
            }
        } else if decline {
            if let Err(err) = self.on_user_decline(page) {
                warn!(error = %err, "Consent choice not persisted");
            }
        } else if close {
            let decision = self.store.read();
            debug!(consent = ?decision.consent, "Banner closed");
            self.on_signal(page, ConsentSignal::new(SignalSource::CrossComponent, decision.consent));
        }
    }

    fn subscribe_banner(&mut self, page: &mut Page) {
        if self.banner.is_some() {
            return;
        }
        if let Lookup::Found(accept) = self.locator.attempt(page) {
            self.attach_banner(page, accept);
        }
    }

    fn attach_banner(&mut self, page: &mut Page, accept: NodeId) {
        let doc = &mut page.document;
        let root = doc.root();
        let decline = self.decline_selector.as_ref().and_then(|s| doc.query_selector(root, s));
        let close = self.close_selector.as_ref().and_then(|s| doc.query_selector(root, s));
        let banner = doc
            .closest(accept, &self.banner_selector)
            .or_else(|| doc.query_selector(root, &self.banner_selector));
        let mut subscription = BannerSubscription { accept, decline, close, banner, observer: None };
        if !self.all_loaded {
            subscription.observe(doc, &self.config.banner.watched_attributes);
        }
        info!(
            %accept,
            decline = decline.is_some(),
            close = close.is_some(),
            observing = subscription.observer.is_some(),
            "Subscribed to cookie banner"
        );
        self.banner = Some(subscription);
    }

    fn release_banner(&mut self, page: &mut Page) {
        if let Some(banner) = &mut self.banner {
            banner.dispose(&mut page.document);
        }
    }

    fn is_tracked(&self, node: NodeId) -> bool {
        self.frames.iter().any(|frame| frame.video.node == node)
    }

    fn any_gated(&self) -> bool {
        self.frames.iter().any(|frame| frame.state == GateState::Gated)
    }

    fn track(&mut self, video: VideoElement, state: GateState, overlay: Option<NodeId>, variant: OverlayVariant) -> usize {
        self.frames.push(TrackedFrame { video, state, overlay, variant });
        self.frames.len() - 1
    }

    fn show_overlay(&mut self, page: &mut Page, index: usize, variant: OverlayVariant) {
        let frame = &mut self.frames[index];
        if let Some(old) = frame.overlay.take() {
            page.document.remove(old);
        }
        frame.overlay = self.overlays.render(&mut page.document, frame.video.node, variant);
        frame.variant = variant;
    }

    fn rerender(&mut self, page: &mut Page, variant: OverlayVariant) {
        for index in 0..self.frames.len() {
            let frame = &self.frames[index];
            if frame.state == GateState::Gated && (frame.variant != variant || frame.overlay.is_none()) {
                self.show_overlay(page, index, variant);
            }
        }
    }

    fn load(&mut self, page: &mut Page, index: usize) {
        let frame = &mut self.frames[index];
        if frame.state == GateState::Loaded {
            return;
        }
        let doc = &mut page.document;
        let node = frame.video.node;
        doc.set_attr(node, "src", &frame.video.source);
        doc.remove_attr(node, WITHHELD_SRC_ATTR);
        doc.remove_attr(node, DEFERRED_SRC_ATTR);
        if let Some(sandbox) = &self.config.provider.loaded_sandbox {
            doc.set_attr(node, "sandbox", sandbox);
        }
        doc.set_attr(node, STATE_ATTR, GateState::Loaded.marker());
        if let Some(overlay) = frame.overlay.take() {
            doc.remove(overlay);
        }
        frame.state = GateState::Loaded;
        info!(video_id = %frame.video.id, %node, "Video loaded");
    }
}

/// Moves the frame's source out of `src` so nothing is fetched.
fn withhold(doc: &mut Document, video: &VideoElement) {
    doc.remove_attr(video.node, "src");
    doc.remove_attr(video.node, DEFERRED_SRC_ATTR);
    doc.set_attr(video.node, WITHHELD_SRC_ATTR, &video.source);
    doc.set_attr(video.node, STATE_ATTR, GateState::Gated.marker());
}
