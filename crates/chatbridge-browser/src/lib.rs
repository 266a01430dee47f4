//! Browser session layer for ChatBridge.
//!
//! This crate owns everything that knows it is talking to Chrome:
//! - [`UiSurface`], the capability interface the turn engine is written against
//! - a Chrome DevTools Protocol connection and a page-level `UiSurface` over it
//! - bootstrap that attaches to (or launches) a Chrome with a persistent profile

pub mod cdp;
pub mod chrome;
pub mod page;
pub mod surface;

pub use cdp::CdpConnection;
pub use chrome::{BrowserOptions, ChromeSession, launch_or_attach};
pub use page::CdpSurface;
pub use surface::{ElementHandle, Locator, UiSurface};
