//! salut-mdns — the discovery boundary of the link-local engine.
//!
//! The engine never talks to an mDNS library directly. It consumes the
//! [`Discovery`] trait: publish the local presence, browse the link, and
//! receive resolved remote presences through a [`DiscoveryObserver`].
//! [`MdnsDiscovery`] binds the trait to the `mdns-sd` daemon; tests swap
//! in an in-process double.

mod daemon;
pub mod store;

pub use daemon::MdnsDiscovery;
pub use store::{PresenceListener, PresenceStore};

use std::sync::Arc;

use salut_core::{LLPresence, Result};

/// The DNS-SD service type for XEP-0174 presence.
pub const SERVICE_TYPE: &str = "_presence._tcp.local.";

/// Callbacks from the discovery layer. Invoked on discovery's own tasks;
/// implementations must marshal into their own locking.
pub trait DiscoveryObserver: Send + Sync {
    /// A service instance appeared on the link. Only the name is known;
    /// the adapter requests resolution and `service_resolved` follows.
    fn service_added(&self, _name: &str) {}

    /// A service instance left the link.
    fn service_removed(&self, name: &str);

    /// A service instance resolved to a full presence (host, port, TXT).
    fn service_resolved(&self, presence: LLPresence);
}

/// What the engine asks of its discovery adapter (spec: mDNS/DNS-SD
/// register/browse/resolve primitives, wrapped per instance).
pub trait Discovery: Send + Sync {
    /// Publish the local presence. Returns the service name actually
    /// registered — under a name collision this differs from the
    /// requested one, and the caller must adopt it.
    fn register(&self, presence: &LLPresence) -> Result<String>;

    /// Withdraw the published service.
    fn unregister(&self) -> Result<()>;

    /// Re-broadcast the current registration after a TXT mutation.
    fn reannounce(&self) -> Result<()>;

    /// Replace the advertised TXT field map.
    fn update_txt(&self, presence: &LLPresence) -> Result<()>;

    /// Start watching the link for peer presences.
    fn browse(&self) -> Result<()>;

    /// Attach an observer for service lifecycle events.
    fn subscribe(&self, observer: Arc<dyn DiscoveryObserver>);

    /// Stop the discovery layer entirely.
    fn shutdown(&self) -> Result<()>;
}
