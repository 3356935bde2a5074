//! Per-peer chat sessions.
//!
//! A chat is a FIFO message channel to one remote service name. Messages
//! that arrive before any listener is attached are buffered; the first
//! listener drains the backlog, later listeners see only new messages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use salut_core::{Error, Message, MessageType, Result, Stanza};

use crate::listener::MessageListener;
use crate::service::ServiceInner;

pub struct Chat {
    service_name: String,
    service: Weak<ServiceInner>,
    listeners: Mutex<Vec<Arc<dyn MessageListener>>>,
    backlog: Mutex<VecDeque<Message>>,
}

impl Chat {
    pub(crate) fn new(service: Weak<ServiceInner>, service_name: String) -> Arc<Chat> {
        Arc::new(Chat {
            service_name,
            service,
            listeners: Mutex::new(Vec::new()),
            backlog: Mutex::new(VecDeque::new()),
        })
    }

    /// The remote peer this chat talks to.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Deliver an inbound message: to every listener if any are attached,
    /// otherwise into the backlog.
    pub(crate) fn deliver(self: &Arc<Self>, message: Message) {
        let listeners = self.listeners.lock().expect("chat listeners poisoned");
        if listeners.is_empty() {
            self.backlog
                .lock()
                .expect("chat backlog poisoned")
                .push_back(message);
        } else {
            for listener in listeners.iter() {
                listener.process_message(self, &message);
            }
        }
    }

    /// Attach a listener. If messages were buffered before any listener
    /// existed, this listener receives them first, in arrival order; the
    /// backlog is then gone for good.
    pub fn add_message_listener(self: &Arc<Self>, listener: Arc<dyn MessageListener>) {
        let mut listeners = self.listeners.lock().expect("chat listeners poisoned");
        let backlog: Vec<Message> = self
            .backlog
            .lock()
            .expect("chat backlog poisoned")
            .drain(..)
            .collect();
        for message in &backlog {
            listener.process_message(self, message);
        }
        listeners.push(listener);
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.listeners
            .lock()
            .expect("chat listeners poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Send a chat message with the given body.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_message(Message::chat(&self.service_name, text.into()))
            .await
    }

    /// Send a message through this chat. Addressing and type are forced:
    /// `to` is the chat's peer and the type is `chat`; the session manager
    /// stamps `from`.
    pub async fn send_message(&self, mut message: Message) -> Result<()> {
        message.to = Some(self.service_name.clone());
        message.mtype = MessageType::Chat;
        let Some(service) = self.service.upgrade() else {
            return Err(Error::Closed);
        };
        service.send_stanza(Stanza::Message(message)).await
    }
}
