mod area;
mod consent;
mod cookie;

pub use area::{KeyValueStore, LocalStorage, MemoryStore, StorageArea, StorageEvent, StorageEvents};
pub use consent::{ConsentRecord, ConsentStore};
pub use cookie::{Cookie, CookieJar};
