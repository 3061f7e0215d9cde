mod document;
mod html;
mod selector;

pub use document::{Descendants, Document, MutationRecord, NodeId, ObserverId};
pub use selector::Selector;
