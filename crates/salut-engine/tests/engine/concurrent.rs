//! Concurrent-dial reconciliation: both peers dial at once, both end up
//! usable, and no message is duplicated across the dual streams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use salut_engine::{Chat, ChatListener, Message, MessageListener};

use crate::support::{spawn_peer, test_config, wait_for, TestHub};

struct CountBodies {
    count: Arc<AtomicUsize>,
}

impl MessageListener for CountBodies {
    fn process_message(&self, _chat: &Arc<Chat>, _message: &Message) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

struct AttachCounter {
    count: Arc<AtomicUsize>,
}

impl ChatListener for AttachCounter {
    fn new_chat(&self, chat: &Arc<Chat>) {
        chat.add_message_listener(Arc::new(CountBodies {
            count: self.count.clone(),
        }));
    }
}

#[tokio::test]
async fn simultaneous_dials_converge_and_deliver_exactly_once() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    let a_received = Arc::new(AtomicUsize::new(0));
    let b_received = Arc::new(AtomicUsize::new(0));
    a.add_chat_listener(Arc::new(AttachCounter {
        count: a_received.clone(),
    }));
    b.add_chat_listener(Arc::new(AttachCounter {
        count: b_received.clone(),
    }));

    wait_for("mutual discovery", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some() && a.presence_of("bob@host-b").is_some()
    })
    .await;

    // Dial each other within the race window.
    let (to_bob, to_alice) = tokio::join!(a.connect_to("bob@host-b"), b.connect_to("alice@host-a"));
    let to_bob = to_bob.expect("a's dial");
    let to_alice = to_alice.expect("b's dial");
    assert!(to_bob.is_open());
    assert!(to_alice.is_open());

    // Traffic flows both ways, each message delivered exactly once even
    // while two streams exist between the pair.
    a.chat("bob@host-b")
        .expect("chat")
        .send_text("from-a")
        .await
        .expect("a sends");
    b.chat("alice@host-a")
        .expect("chat")
        .send_text("from-b")
        .await
        .expect("b sends");

    wait_for("both deliveries", Duration::from_secs(2), || {
        a_received.load(Ordering::SeqCst) == 1 && b_received.load(Ordering::SeqCst) == 1
    })
    .await;

    // Give any duplicate a chance to show up before asserting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a_received.load(Ordering::SeqCst), 1);
    assert_eq!(b_received.load(Ordering::SeqCst), 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn get_connection_prefers_the_outbound_stream() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    wait_for("mutual discovery", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some() && a.presence_of("bob@host-b").is_some()
    })
    .await;

    let (ours, theirs) = tokio::join!(a.connect_to("bob@host-b"), b.connect_to("alice@host-a"));
    let ours = ours.expect("a dial");
    let _theirs = theirs.expect("b dial");

    // Repeated lookups return the same stream we dialed — the stable
    // outbound tie-break.
    let again = a.connect_to("bob@host-b").await.expect("lookup");
    assert!(Arc::ptr_eq(&ours, &again));

    a.close().await;
    b.close().await;
}
