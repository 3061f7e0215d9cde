use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{trace, warn};

use crate::{Page, PageEvent};

/// Bound on events handled in one drain, so a handler that keeps
/// re-dispatching cannot hang the page.
const MAX_EVENTS_PER_DRAIN: usize = 10_000;

/// A page script. Handlers run one at a time on the page's single thread;
/// they re-enter each other only through events queued on the page.
pub trait EventHandler: Send {
    fn handle(&mut self, page: &mut Page, event: &PageEvent);
}

/// Lets other tasks feed events (clicks, custom events) into a running loop.
pub type EventSender = mpsc::UnboundedSender<PageEvent>;

pub struct EventLoop {
    handlers: Vec<Box<dyn EventHandler>>,
    sender: EventSender,
    inbox: mpsc::UnboundedReceiver<PageEvent>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

enum Wake {
    Deadline,
    Inbox(PageEvent),
    Storage(consentgate_storage::StorageEvent),
    Timer,
}

impl EventLoop {
    pub fn new() -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Self { handlers: Vec::new(), sender, inbox }
    }

    /// Handlers see every event in registration order.
    pub fn register<H: EventHandler + 'static>(&mut self, handler: H) {
        self.handlers.push(Box::new(handler));
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Delivers everything that is ready now, including timers already due,
    /// and returns the number of events handled.
    pub fn run_until_idle(&mut self, page: &mut Page) -> usize {
        let mut handled = 0;
        loop {
            while let Ok(event) = self.inbox.try_recv() {
                page.dispatch(event);
            }
            let Some(event) = page.next_event() else {
                break;
            };
            self.deliver(page, &event);
            handled += 1;
            if handled >= MAX_EVENTS_PER_DRAIN {
                warn!(handled, "Event drain limit reached, yielding");
                break;
            }
        }
        handled
    }

    fn deliver(&mut self, page: &mut Page, event: &PageEvent) {
        trace!(?event, "Dispatching page event");
        if *event == PageEvent::DomReady {
            page.mark_complete();
        }
        for handler in &mut self.handlers {
            handler.handle(page, event);
        }
        page.flush_mutations();
    }

    /// Runs the page until `deadline`, waking for injected events, storage
    /// changes from other contexts and timers.
    pub async fn run_until(&mut self, page: &mut Page, deadline: Instant) -> usize {
        let mut handled = 0;
        loop {
            handled += self.run_until_idle(page);
            let now = page.now_ms();
            let timer_delay = page
                .next_deadline()
                .map(|due| Duration::from_millis(due.saturating_sub(now).max(0) as u64));
            let timer = async move {
                match timer_delay {
                    Some(delay) => sleep(delay).await,
                    None => std::future::pending().await,
                }
            };

            let wake = tokio::select! {
                _ = sleep_until(deadline) => Wake::Deadline,
                Some(event) = self.inbox.recv() => Wake::Inbox(event),
                Some(event) = page.storage_events.next() => Wake::Storage(event),
                _ = timer => Wake::Timer,
            };

            match wake {
                Wake::Deadline => break,
                Wake::Inbox(event) => page.dispatch(event),
                Wake::Storage(event) => page.dispatch(PageEvent::Storage(event)),
                Wake::Timer => {}
            }
        }
        handled
    }

    pub async fn run_for(&mut self, page: &mut Page, duration: Duration) -> usize {
        self.run_until(page, Instant::now() + duration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consentgate_core::{ManualClock, SystemClock};
    use consentgate_storage::{CookieJar, KeyValueStore, StorageArea};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<PageEvent>>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<PageEvent> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EventHandler for Recorder {
        fn handle(&mut self, page: &mut Page, event: &PageEvent) {
            self.seen.lock().unwrap().push(event.clone());
            if let PageEvent::Custom { name } = event {
                if name == "ping" {
                    page.dispatch_custom("pong");
                }
            }
        }
    }

    #[test]
    fn events_queued_by_handlers_run_after_current_ones() {
        let area = StorageArea::new();
        let mut page = Page::open("", &area, &CookieJar::new(), Arc::new(ManualClock::new(0)));
        let recorder = Recorder::default();
        let mut event_loop = EventLoop::new();
        event_loop.register(recorder.clone());

        page.dispatch_custom("ping");
        page.dispatch_custom("other");
        assert_eq!(event_loop.run_until_idle(&mut page), 4);
        assert_eq!(page.ready_state(), crate::ReadyState::Complete);
        let names: Vec<String> = recorder
            .seen()
            .into_iter()
            .filter_map(|e| match e {
                PageEvent::Custom { name } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["ping", "other", "pong"]);
    }

    #[test]
    fn storage_changes_from_other_pages_are_delivered() {
        let area = StorageArea::new();
        let cookies = CookieJar::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut page = Page::open("", &area, &cookies, clock.clone());
        let other = Page::open("", &area, &cookies, clock);
        let recorder = Recorder::default();
        let mut event_loop = EventLoop::new();
        event_loop.register(recorder.clone());
        event_loop.run_until_idle(&mut page);

        other.local_storage().set_item("k", "v").unwrap();
        page.local_storage().set_item("mine", "1").unwrap();
        event_loop.run_until_idle(&mut page);
        let storage: Vec<_> = recorder
            .seen()
            .into_iter()
            .filter_map(|e| match e {
                PageEvent::Storage(event) => event.key,
                _ => None,
            })
            .collect();
        assert_eq!(storage, vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn run_for_wakes_for_timers_and_injected_events() {
        let area = StorageArea::new();
        let mut page = Page::open("", &area, &CookieJar::new(), Arc::new(SystemClock));
        let recorder = Recorder::default();
        let mut event_loop = EventLoop::new();
        event_loop.register(recorder.clone());
        let timer = page.set_timeout(Duration::from_millis(10));
        let sender = event_loop.sender();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            let _ = sender.send(PageEvent::Custom { name: "injected".to_string() });
        });

        event_loop.run_for(&mut page, Duration::from_millis(100)).await;
        let seen = recorder.seen();
        assert!(seen.contains(&PageEvent::Timer(timer)));
        assert!(seen.contains(&PageEvent::Custom { name: "injected".to_string() }));
        assert_eq!(page.pending_timers(), 0);
    }
}
