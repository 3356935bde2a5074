//! Discovery scenarios: presence propagation, renames, withdrawals.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use salut_engine::{Error, Message, Mode, ServiceStateListener};

use crate::support::{spawn_peer, test_config, wait_for, TestHub};

#[tokio::test]
async fn peers_discover_each_other_with_full_presence() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    wait_for("b to see alice", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some()
    })
    .await;

    let alice = b.presence_of("alice@host-a").expect("alice resolved");
    assert_eq!(alice.host(), "127.0.0.1");
    assert_eq!(alice.port(), a.local_presence().port());
    assert_eq!(alice.status, Mode::Avail);

    wait_for("a to see bob", Duration::from_secs(5), || {
        a.presence_of("bob@host-b").is_some()
    })
    .await;

    a.close().await;
    b.close().await;
}

#[derive(Default)]
struct RenameWatcher {
    renames: Mutex<Vec<(String, String)>>,
}

impl ServiceStateListener for RenameWatcher {
    fn service_name_changed(&self, new_name: &str, old_name: &str) {
        self.renames
            .lock()
            .unwrap()
            .push((new_name.to_string(), old_name.to_string()));
    }
}

#[tokio::test]
async fn second_registration_of_same_name_is_renamed() {
    let hub = TestHub::new();
    let first = spawn_peer(&hub, "alice@host", test_config()).await;

    let watcher = Arc::new(RenameWatcher::default());
    let presence = salut_engine::LLPresence::with_addr("alice@host", "127.0.0.1", 0);
    let discovery = hub.join();
    let second = salut_engine::LLService::new(presence, discovery, test_config());
    second.add_state_listener(watcher.clone());
    second.init().await.expect("second init");

    assert_eq!(first.local_presence().service_name(), "alice@host");
    assert_eq!(second.local_presence().service_name(), "alice@host (2)");
    assert_eq!(
        watcher.renames.lock().unwrap().as_slice(),
        &[("alice@host (2)".to_string(), "alice@host".to_string())]
    );

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn sending_to_withdrawn_peer_fails_with_peer_unavailable() {
    let hub = TestHub::new();
    let a = spawn_peer(&hub, "alice@host-a", test_config()).await;
    let b = spawn_peer(&hub, "bob@host-b", test_config()).await;

    wait_for("b to see alice", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_some()
    })
    .await;

    // Alice withdraws; Bob's store drops her, and sends start failing.
    a.make_unavailable().expect("unregister");
    wait_for("alice to vanish from b", Duration::from_secs(5), || {
        b.presence_of("alice@host-a").is_none()
    })
    .await;

    let err = b
        .send_message(Message::chat("alice@host-a", "anyone home?"))
        .await
        .expect_err("send must fail");
    assert!(matches!(err, Error::PeerUnavailable(name) if name == "alice@host-a"));

    a.close().await;
    b.close().await;
}
