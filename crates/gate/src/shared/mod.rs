pub mod locator;
pub mod templates;

pub use locator::{BannerLocator, Lookup};
