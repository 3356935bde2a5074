//! Messaging scenarios: chat delivery, from-stamping, IQ round trips.

use std::sync::Arc;
use std::time::Duration;

use salut_engine::{
    filter, Chat, ChatListener, Iq, IqType, LLService, Message, MessageListener, PacketInterceptor,
    PacketListener, Stanza,
};

use crate::support::{spawn_peer, test_config, wait_for, TestHub};

/// Routes every delivered chat message body into a channel.
struct Collect {
    tx: tokio::sync::mpsc::UnboundedSender<(String, String)>,
}

impl MessageListener for Collect {
    fn process_message(&self, chat: &Arc<Chat>, message: &Message) {
        let _ = self.tx.send((
            chat.service_name().to_string(),
            message.body.clone().unwrap_or_default(),
        ));
    }
}

/// Attaches a `Collect` listener to every chat as it is created.
struct AttachOnNewChat {
    tx: tokio::sync::mpsc::UnboundedSender<(String, String)>,
}

impl ChatListener for AttachOnNewChat {
    fn new_chat(&self, chat: &Arc<Chat>) {
        chat.add_message_listener(Arc::new(Collect {
            tx: self.tx.clone(),
        }));
    }
}

async fn recv_with_timeout(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<(String, String)>,
    timeout: Duration,
) -> (String, String) {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

#[tokio::test]
async fn chat_message_is_delivered_with_stamped_from() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    a.add_chat_listener(Arc::new(AttachOnNewChat { tx }));

    wait_for("b to see alice", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some()
    })
    .await;
    wait_for("a to see bob", Duration::from_secs(5), || {
        a.presence_of("bob@host-b").is_some()
    })
    .await;

    b.chat("alice@host-a")
        .expect("chat")
        .send_text("hi")
        .await
        .expect("send");

    let (chat_peer, body) = recv_with_timeout(&mut rx, Duration::from_secs(1)).await;
    // The chat on A's side is keyed by the *sender*, proving the engine
    // stamped from= with B's service name.
    assert_eq!(chat_peer, "bob@host-b");
    assert_eq!(body, "hi");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn messages_before_a_listener_are_buffered_then_replayed() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    wait_for("mutual discovery", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some() && a.presence_of("bob@host-b").is_some()
    })
    .await;

    let bob_chat = b.chat("alice@host-a").expect("chat");
    bob_chat.send_text("one").await.expect("send one");
    bob_chat.send_text("two").await.expect("send two");

    // Wait until A's chat for bob exists and holds the backlog.
    wait_for("a's chat to exist", Duration::from_secs(2), || {
        a.chat("bob@host-b").is_ok()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    a.chat("bob@host-b")
        .expect("chat")
        .add_message_listener(Arc::new(Collect { tx }));

    let first = recv_with_timeout(&mut rx, Duration::from_secs(1)).await;
    let second = recv_with_timeout(&mut rx, Duration::from_secs(1)).await;
    assert_eq!(first.1, "one");
    assert_eq!(second.1, "two");

    a.close().await;
    b.close().await;
}

/// Replies to `ping` IQ gets, through the service (not the stream the
/// request arrived on).
struct PingResponder {
    service: LLService,
}

impl PacketListener for PingResponder {
    fn process_packet(&self, stanza: &Stanza) {
        let Stanza::Iq(iq) = stanza else { return };
        if iq.itype != IqType::Get {
            return;
        }
        let reply = iq.result_reply(None);
        let service = self.service.clone();
        tokio::spawn(async move {
            service
                .send_stanza(Stanza::Iq(reply))
                .await
                .expect("reply send");
        });
    }
}

#[tokio::test]
async fn iq_get_receives_its_result() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    wait_for("mutual discovery", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some() && a.presence_of("bob@host-b").is_some()
    })
    .await;

    a.add_packet_listener(filter::iqs(), Arc::new(PingResponder { service: a.clone() }));

    let mut iq = Iq {
        id: "q-1".to_string(),
        to: Some("alice@host-a".to_string()),
        from: None,
        itype: IqType::Get,
        payload: None,
        error: None,
    };
    iq.payload = Some(salut_core::stanza::IqPayload {
        name: "ping".to_string(),
        namespace: "urn:xmpp:ping".to_string(),
        xml: "<ping xmlns=\"urn:xmpp:ping\"/>".to_string(),
    });

    let reply = b.get_iq_response(iq).await.expect("iq reply");
    assert_eq!(reply.id, "q-1");
    assert_eq!(reply.itype, IqType::Result);
    assert_eq!(reply.from.as_deref(), Some("alice@host-a"));

    a.close().await;
    b.close().await;
}

/// Rewrites outbound chat bodies; proves interceptors run before the wire.
struct TagBody;

impl PacketInterceptor for TagBody {
    fn intercept_packet(&self, stanza: &mut Stanza) {
        if let Stanza::Message(message) = stanza {
            if let Some(body) = message.body.take() {
                message.body = Some(format!("[tagged] {body}"));
            }
        }
    }
}

struct SentLog {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl PacketListener for SentLog {
    fn process_packet(&self, stanza: &Stanza) {
        if let Stanza::Message(message) = stanza {
            let _ = self.tx.send(message.body.clone().unwrap_or_default());
        }
    }
}

#[tokio::test]
async fn interceptors_rewrite_and_send_listeners_observe_outbound_stanzas() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    let (chat_tx, mut chat_rx) = tokio::sync::mpsc::unbounded_channel();
    a.add_chat_listener(Arc::new(AttachOnNewChat { tx: chat_tx }));

    b.add_packet_interceptor(filter::chat_messages(), Arc::new(TagBody));
    let (sent_tx, mut sent_rx) = tokio::sync::mpsc::unbounded_channel();
    b.add_send_listener(filter::chat_messages(), Arc::new(SentLog { tx: sent_tx }));

    wait_for("mutual discovery", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some() && a.presence_of("bob@host-b").is_some()
    })
    .await;

    b.chat("alice@host-a")
        .expect("chat")
        .send_text("hi")
        .await
        .expect("send");

    // The send listener saw the intercepted form...
    let sent = tokio::time::timeout(Duration::from_secs(1), sent_rx.recv())
        .await
        .expect("send listener fired")
        .expect("channel open");
    assert_eq!(sent, "[tagged] hi");

    // ...and the peer received exactly that form.
    let (_, body) = recv_with_timeout(&mut chat_rx, Duration::from_secs(1)).await;
    assert_eq!(body, "[tagged] hi");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn unhandled_iq_get_is_answered_with_feature_not_implemented() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    wait_for("mutual discovery", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some() && a.presence_of("bob@host-b").is_some()
    })
    .await;

    let iq = Iq {
        id: "q-unknown".to_string(),
        to: Some("alice@host-a".to_string()),
        from: None,
        itype: IqType::Get,
        payload: Some(salut_core::stanza::IqPayload {
            name: "mystery".to_string(),
            namespace: "urn:example:mystery".to_string(),
            xml: "<mystery xmlns=\"urn:example:mystery\"/>".to_string(),
        }),
        error: None,
    };

    let reply = b.get_iq_response(iq).await.expect("error reply expected");
    assert_eq!(reply.itype, IqType::Error);
    let err = reply.error.expect("stanza error present");
    assert_eq!(err.condition, "feature-not-implemented");

    a.close().await;
    b.close().await;
}
