//! Shared harness: an in-process discovery hub and peer spawning helpers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use salut_core::config::ServiceConfig;
use salut_engine::{Discovery, DiscoveryObserver, LLPresence, LLService};
use salut_core::Result;

/// One simulated link. Every [`TestDiscovery`] joined to the hub sees the
/// registrations of all the others, with rename-on-collision the way a
/// real mDNS responder does it ("name (2)", "name (3)", ...).
pub struct TestHub {
    inner: Mutex<HubInner>,
}

struct HubInner {
    next_id: usize,
    /// instance name → (owner id, presence as advertised)
    peers: HashMap<String, (usize, LLPresence)>,
    members: Vec<Arc<TestDiscovery>>,
}

impl TestHub {
    pub fn new() -> Arc<TestHub> {
        Arc::new(TestHub {
            inner: Mutex::new(HubInner {
                next_id: 0,
                peers: HashMap::new(),
                members: Vec::new(),
            }),
        })
    }

    pub fn join(self: &Arc<Self>) -> Arc<TestDiscovery> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let member = Arc::new(TestDiscovery {
            id,
            hub: self.clone(),
            observers: RwLock::new(Vec::new()),
            registered: Mutex::new(None),
        });
        inner.members.push(member.clone());
        member
    }
}

pub struct TestDiscovery {
    id: usize,
    hub: Arc<TestHub>,
    observers: RwLock<Vec<Arc<dyn DiscoveryObserver>>>,
    registered: Mutex<Option<String>>,
}

impl TestDiscovery {
    fn observers(&self) -> Vec<Arc<dyn DiscoveryObserver>> {
        self.observers.read().unwrap().clone()
    }

    fn notify_resolved(&self, presence: LLPresence) {
        for o in self.observers() {
            o.service_resolved(presence.clone());
        }
    }

    fn notify_removed(&self, name: &str) {
        for o in self.observers() {
            o.service_removed(name);
        }
    }
}

impl Discovery for TestDiscovery {
    fn register(&self, presence: &LLPresence) -> Result<String> {
        let (advertised, others) = {
            let mut inner = self.hub.inner.lock().unwrap();
            let requested = presence.service_name().to_string();
            let mut name = requested.clone();
            let mut suffix = 2;
            while inner
                .peers
                .get(&name)
                .is_some_and(|(owner, _)| *owner != self.id)
            {
                name = format!("{requested} ({suffix})");
                suffix += 1;
            }
            let mut advertised = presence.clone();
            advertised.set_service_name(&name);
            inner.peers.insert(name.clone(), (self.id, advertised.clone()));
            *self.registered.lock().unwrap() = Some(name);
            let others: Vec<Arc<TestDiscovery>> = inner
                .members
                .iter()
                .filter(|m| m.id != self.id)
                .cloned()
                .collect();
            (advertised, others)
        };
        for member in others {
            member.notify_resolved(advertised.clone());
        }
        Ok(advertised.service_name().to_string())
    }

    fn unregister(&self) -> Result<()> {
        let Some(name) = self.registered.lock().unwrap().take() else {
            return Ok(());
        };
        let others: Vec<Arc<TestDiscovery>> = {
            let mut inner = self.hub.inner.lock().unwrap();
            inner.peers.remove(&name);
            inner
                .members
                .iter()
                .filter(|m| m.id != self.id)
                .cloned()
                .collect()
        };
        for member in others {
            member.notify_removed(&name);
        }
        Ok(())
    }

    fn reannounce(&self) -> Result<()> {
        let (presence, others) = {
            let inner = self.hub.inner.lock().unwrap();
            let name = self.registered.lock().unwrap().clone();
            let Some(name) = name else { return Ok(()) };
            let Some((_, presence)) = inner.peers.get(&name) else {
                return Ok(());
            };
            (
                presence.clone(),
                inner
                    .members
                    .iter()
                    .filter(|m| m.id != self.id)
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        };
        for member in others {
            member.notify_resolved(presence.clone());
        }
        Ok(())
    }

    fn update_txt(&self, presence: &LLPresence) -> Result<()> {
        let name = self.registered.lock().unwrap().clone();
        let Some(name) = name else { return Ok(()) };
        let mut advertised = presence.clone();
        advertised.set_service_name(&name);
        self.hub
            .inner
            .lock()
            .unwrap()
            .peers
            .insert(name, (self.id, advertised));
        Ok(())
    }

    fn browse(&self) -> Result<()> {
        let foreign: Vec<LLPresence> = {
            let inner = self.hub.inner.lock().unwrap();
            inner
                .peers
                .values()
                .filter(|(owner, _)| *owner != self.id)
                .map(|(_, p)| p.clone())
                .collect()
        };
        for presence in foreign {
            self.notify_resolved(presence);
        }
        Ok(())
    }

    fn subscribe(&self, observer: Arc<dyn DiscoveryObserver>) {
        self.observers.write().unwrap().push(observer);
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// ── Peer helpers ──────────────────────────────────────────────────────────────

/// Default engine config with a short probe window — the hub double
/// answers browses synchronously, so there is nothing to wait for.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.network.probe_delay_ms = 10;
    config
}

pub fn fast_config(idle_ms: u64) -> ServiceConfig {
    let mut config = test_config();
    config.stream.idle_timeout_ms = idle_ms;
    config.stream.watchdog_tick_ms = idle_ms / 3;
    config
}

/// Spawn a service on the hub, listening on localhost, and wait for it
/// to come up.
pub async fn spawn_peer(hub: &Arc<TestHub>, name: &str, config: ServiceConfig) -> LLService {
    let presence = LLPresence::with_addr(name, "127.0.0.1", 0);
    let discovery = hub.join();
    let service = LLService::new(presence, discovery, config);
    service.init().await.expect("service init should succeed");
    service
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
