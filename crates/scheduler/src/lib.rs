mod event_loop;
mod page;

pub use event_loop::{EventHandler, EventLoop, EventSender};
pub use page::{Page, PageEvent, ReadyState, TimerId};
