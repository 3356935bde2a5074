//! Idle-timeout scenarios: zombie streams die, traffic revives peers,
//! and IQ correlation survives a reply arriving on a fresh stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use salut_engine::{
    filter, Chat, ChatListener, ConnectionListener, Iq, IqType, LLService, Message,
    MessageListener, PacketListener, Stanza, StreamRole,
};

use crate::support::{fast_config, spawn_peer, wait_for, TestHub};

#[derive(Default)]
struct CloseCounter {
    closed: AtomicUsize,
}

impl ConnectionListener for CloseCounter {
    fn connection_closed(&self, _service_name: &str, _on_error: bool) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Collect {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl MessageListener for Collect {
    fn process_message(&self, _chat: &Arc<Chat>, message: &Message) {
        let _ = self.tx.send(message.body.clone().unwrap_or_default());
    }
}

struct AttachOnNewChat {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl ChatListener for AttachOnNewChat {
    fn new_chat(&self, chat: &Arc<Chat>) {
        chat.add_message_listener(Arc::new(Collect {
            tx: self.tx.clone(),
        }));
    }
}

#[tokio::test]
async fn idle_streams_close_and_traffic_revives_them() {
    let hub = TestHub::new();
    // 400 ms idle threshold, watchdog every ~130 ms.
    let a = spawn_peer(&hub, "alice@host-a", fast_config(400)).await;
    let b = spawn_peer(&hub, "bob@host-b", fast_config(400)).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    a.add_chat_listener(Arc::new(AttachOnNewChat { tx }));

    let closes = Arc::new(CloseCounter::default());
    b.add_connection_listener(closes.clone());

    wait_for("mutual discovery", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some() && a.presence_of("bob@host-b").is_some()
    })
    .await;

    b.chat("alice@host-a")
        .expect("chat")
        .send_text("first")
        .await
        .expect("send");
    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("first message delivery")
        .expect("channel open");
    assert_eq!(first, "first");

    // Let both sides idle past the threshold; the stream must die.
    wait_for("idle close", Duration::from_secs(3), || {
        closes.closed.load(Ordering::SeqCst) >= 1
    })
    .await;

    // A new send dials a fresh stream transparently.
    b.chat("alice@host-a")
        .expect("chat")
        .send_text("second")
        .await
        .expect("revived send");
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("revived delivery")
        .expect("channel open");
    assert_eq!(second, "second");

    a.close().await;
    b.close().await;
}

/// Replies to IQ gets only after the request's stream has idled out, so
/// the reply must travel on a stream the requester never opened.
struct SlowResponder {
    service: LLService,
    delay: Duration,
}

impl PacketListener for SlowResponder {
    fn process_packet(&self, stanza: &Stanza) {
        let Stanza::Iq(iq) = stanza else { return };
        if iq.itype != IqType::Get {
            return;
        }
        let reply = iq.result_reply(None);
        let service = self.service.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            service
                .send_stanza(Stanza::Iq(reply))
                .await
                .expect("delayed reply send");
        });
    }
}

#[tokio::test]
async fn iq_reply_is_collected_across_streams() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", fast_config(300)).await;
    let b = spawn_peer(&hub, "bob@host-b", fast_config(300)).await;

    wait_for("mutual discovery", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some() && a.presence_of("bob@host-b").is_some()
    })
    .await;

    // A answers pings, but only after the original stream idled out.
    a.add_packet_listener(
        filter::iqs(),
        Arc::new(SlowResponder {
            service: a.clone(),
            delay: Duration::from_millis(900),
        }),
    );

    // Watch which direction carries traffic on B's side.
    let inbound_opens = Arc::new(AtomicUsize::new(0));
    let counter = inbound_opens.clone();
    struct OpenWatch {
        inbound: Arc<AtomicUsize>,
    }
    impl ConnectionListener for OpenWatch {
        fn connection_opened(&self, _service_name: &str, role: StreamRole) {
            if role == StreamRole::Responder {
                self.inbound.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    b.add_connection_listener(Arc::new(OpenWatch { inbound: counter }));

    let iq = Iq {
        id: "q-cross".to_string(),
        to: Some("alice@host-a".to_string()),
        from: None,
        itype: IqType::Get,
        payload: None,
        error: None,
    };
    let reply = b.get_iq_response(iq).await.expect("cross-stream reply");
    assert_eq!(reply.id, "q-cross");
    assert_eq!(reply.itype, IqType::Result);
    // The reply came in on a stream A dialed to B.
    assert!(inbound_opens.load(Ordering::SeqCst) >= 1);

    a.close().await;
    b.close().await;
}
