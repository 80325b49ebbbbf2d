//! Object lifetime bridge between script proxies and native refcounts

pub mod bridge;
pub mod keep_alive;
pub mod proxy;
pub mod toggle;

pub use bridge::ObjectLifetimeBridge;
pub use keep_alive::KeepAliveSet;
pub use proxy::{ObjectProxy, ProxyState};
pub use toggle::{EnqueueOutcome, PendingToggleOp, ToggleDirection, ToggleQueue};
