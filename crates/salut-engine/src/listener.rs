//! Listener traits for the session engine.
//!
//! All callbacks run on engine tasks (the per-service dispatcher or a
//! discovery task) and should complete quickly.

use std::sync::Arc;

use salut_core::{Error, Message, Stanza};

use crate::chat::Chat;
use crate::stream::StreamRole;

/// Sees every inbound stanza its filter accepts, across all streams.
pub trait PacketListener: Send + Sync {
    fn process_packet(&self, stanza: &Stanza);
}

/// Runs over every outbound stanza before it is written, after the
/// engine has stamped `from`. Interceptors may rewrite the stanza.
pub trait PacketInterceptor: Send + Sync {
    fn intercept_packet(&self, stanza: &mut Stanza);
}

/// Receives messages delivered to one chat session.
pub trait MessageListener: Send + Sync {
    fn process_message(&self, chat: &Arc<Chat>, message: &Message);
}

/// Notified when a chat session is created (first inbound or outbound
/// message for a peer).
pub trait ChatListener: Send + Sync {
    fn new_chat(&self, chat: &Arc<Chat>);
}

/// Notified when streams to peers open and close.
pub trait ConnectionListener: Send + Sync {
    fn connection_opened(&self, _service_name: &str, _role: StreamRole) {}
    fn connection_closed(&self, _service_name: &str, _on_error: bool) {}
}

/// Service-level lifecycle events.
pub trait ServiceStateListener: Send + Sync {
    /// The service shut down normally.
    fn service_closed(&self) {}

    /// The acceptor died on an I/O error; no new inbound streams arrive.
    fn service_closed_on_error(&self, _error: &Error) {}

    /// A message arrived from a service name with no known presence.
    /// The message is dropped after this callback.
    fn unknown_origin_message(&self, _message: &Message) {}

    /// Registration renamed the local service (name collision on the link).
    fn service_name_changed(&self, _new_name: &str, _old_name: &str) {}
}
