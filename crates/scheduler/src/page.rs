use consentgate_core::Clock;
use consentgate_dom::{Document, MutationRecord, NodeId, Selector};
use consentgate_storage::{CookieJar, LocalStorage, MemoryStore, StorageArea, StorageEvent, StorageEvents};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Everything a page script can be woken up by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    DomReady,
    Click { target: NodeId },
    /// `window.dispatchEvent(new Event(name))`
    Custom { name: String },
    /// Storage change made by another context
    Storage(StorageEvent),
    Mutation(MutationRecord),
    Timer(TimerId),
}

/// One browsing context: its document, its view of the origin's storage and
/// cookies, and its pending events and timers.
pub struct Page {
    pub document: Document,
    local: LocalStorage,
    session: Arc<MemoryStore>,
    cookies: CookieJar,
    clock: Arc<dyn Clock>,
    ready_state: ReadyState,
    queue: VecDeque<PageEvent>,
    timers: BTreeMap<TimerId, i64>,
    next_timer: u64,
    pub(crate) storage_events: StorageEvents,
}

impl Page {
    /// Opens `html` in a new context sharing `area` and `cookies` with every
    /// other context of the origin. The page starts out loading with a
    /// `DomReady` event queued.
    pub fn open(html: &str, area: &StorageArea, cookies: &CookieJar, clock: Arc<dyn Clock>) -> Self {
        let local = area.open();
        let storage_events = local.subscribe();
        let mut queue = VecDeque::new();
        queue.push_back(PageEvent::DomReady);
        Self {
            document: Document::parse(html),
            local,
            session: Arc::new(MemoryStore::new()),
            cookies: cookies.clone(),
            clock,
            ready_state: ReadyState::Loading,
            queue,
            timers: BTreeMap::new(),
            next_timer: 0,
            storage_events,
        }
    }

    pub fn local_storage(&self) -> &LocalStorage {
        &self.local
    }

    pub fn session_storage(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.session)
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.ready_state
    }

    pub(crate) fn mark_complete(&mut self) {
        self.ready_state = ReadyState::Complete;
    }

    /// First element matching `selector`; an invalid selector matches nothing.
    pub fn query(&self, selector: &str) -> Option<NodeId> {
        let selector = Selector::parse(selector).ok()?;
        self.document.query_selector(self.document.root(), &selector)
    }

    pub fn query_all(&self, selector: &str) -> Vec<NodeId> {
        match Selector::parse(selector) {
            Ok(selector) => self.document.query_selector_all(self.document.root(), &selector),
            Err(_) => Vec::new(),
        }
    }

    /// Queues `event` behind everything already queued.
    pub fn dispatch(&mut self, event: PageEvent) {
        self.queue.push_back(event);
    }

    pub fn click(&mut self, target: NodeId) {
        self.dispatch(PageEvent::Click { target });
    }

    pub fn dispatch_custom(&mut self, name: &str) {
        self.dispatch(PageEvent::Custom { name: name.to_string() });
    }

    pub fn set_timeout(&mut self, delay: Duration) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        let due = self.clock.now_ms().saturating_add(delay.as_millis() as i64);
        self.timers.insert(id, due);
        id
    }

    pub fn clear_timeout(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Earliest timer deadline, in clock milliseconds.
    pub fn next_deadline(&self) -> Option<i64> {
        self.timers.values().copied().min()
    }

    /// Queued events (attribute mutations recorded so far are appended to
    /// the queue first), then storage changes from other contexts, then the
    /// earliest due timer.
    pub(crate) fn next_event(&mut self) -> Option<PageEvent> {
        self.flush_mutations();
        if let Some(event) = self.queue.pop_front() {
            return Some(event);
        }
        if let Some(event) = self.storage_events.try_next() {
            return Some(PageEvent::Storage(event));
        }
        let now = self.clock.now_ms();
        let (&id, _) = self
            .timers
            .iter()
            .filter(|(_, due)| **due <= now)
            .min_by_key(|(id, due)| (**due, **id))?;
        self.timers.remove(&id);
        Some(PageEvent::Timer(id))
    }

    pub(crate) fn flush_mutations(&mut self) {
        for record in self.document.take_mutations() {
            self.queue.push_back(PageEvent::Mutation(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consentgate_core::ManualClock;
    use consentgate_storage::KeyValueStore;

    fn page(clock: &ManualClock) -> Page {
        Page::open(
            "<div class='cookie-banner'></div>",
            &StorageArea::new(),
            &CookieJar::new(),
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn starts_loading_with_dom_ready_queued() {
        let clock = ManualClock::new(0);
        let mut page = page(&clock);
        assert_eq!(page.ready_state(), ReadyState::Loading);
        assert_eq!(page.next_event(), Some(PageEvent::DomReady));
        assert_eq!(page.next_event(), None);
    }

    #[test]
    fn timers_fire_in_deadline_order_once_due() {
        let clock = ManualClock::new(0);
        let mut page = page(&clock);
        page.next_event();
        let late = page.set_timeout(Duration::from_millis(20));
        let early = page.set_timeout(Duration::from_millis(10));
        let cancelled = page.set_timeout(Duration::from_millis(5));
        assert!(page.clear_timeout(cancelled));
        assert_eq!(page.next_deadline(), Some(10));
        assert_eq!(page.next_event(), None);

        clock.advance(Duration::from_millis(25));
        assert_eq!(page.next_event(), Some(PageEvent::Timer(early)));
        assert_eq!(page.next_event(), Some(PageEvent::Timer(late)));
        assert_eq!(page.pending_timers(), 0);
    }

    #[test]
    fn mutations_are_queued_before_timers() {
        let clock = ManualClock::new(0);
        let mut page = page(&clock);
        page.next_event();
        let banner = page.query(".cookie-banner").unwrap();
        let observer = page.document.observe(banner, &["style".to_string()]);
        let timer = page.set_timeout(Duration::ZERO);
        page.document.set_style(banner, "display", "none");
        assert_eq!(
            page.next_event(),
            Some(PageEvent::Mutation(MutationRecord {
                observer,
                target: banner,
                attribute: "style".to_string(),
            }))
        );
        assert_eq!(page.next_event(), Some(PageEvent::Timer(timer)));
    }

    #[test]
    fn mutations_queue_behind_dispatched_events_and_ahead_of_storage() {
        let clock = ManualClock::new(0);
        let area = StorageArea::new();
        let cookies = CookieJar::new();
        let mut page = Page::open("<div class='cookie-banner'></div>", &area, &cookies, Arc::new(clock.clone()));
        let other = Page::open("", &area, &cookies, Arc::new(clock.clone()));
        page.next_event();
        let banner = page.query(".cookie-banner").unwrap();
        let observer = page.document.observe(banner, &["style".to_string()]);

        page.click(banner);
        page.document.set_style(banner, "display", "none");
        other.local_storage().set_item("theme", "dark").unwrap();

        assert_eq!(page.next_event(), Some(PageEvent::Click { target: banner }));
        assert!(matches!(page.next_event(), Some(PageEvent::Mutation(record)) if record.observer == observer));
        assert!(matches!(page.next_event(), Some(PageEvent::Storage(change)) if change.key.as_deref() == Some("theme")));
        assert_eq!(page.next_event(), None);
    }

    #[test]
    fn invalid_selectors_match_nothing() {
        let clock = ManualClock::new(0);
        let page = page(&clock);
        assert_eq!(page.query("[["), None);
        assert!(page.query_all("..").is_empty());
        assert_eq!(page.query_all("div").len(), 1);
    }
}
