//! `mdns-sd` binding for the [`Discovery`] trait.
//!
//! One daemon per adapter instance — nothing is process-global, so a test
//! harness (or a multi-homed host) can run several side by side. The
//! adapter owns a small resolve cache keyed by instance name; it is what
//! collision detection and post-rename eviction operate on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use salut_core::{txt, Error, LLPresence, Result};

use crate::{Discovery, DiscoveryObserver, SERVICE_TYPE};

struct Registration {
    instance: String,
    fullname: String,
    info: ServiceInfo,
}

pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    observers: Arc<RwLock<Vec<Arc<dyn DiscoveryObserver>>>>,
    registration: Mutex<Option<Registration>>,
    local_instance: Arc<RwLock<Option<String>>>,
    /// instance name → host, for everything currently resolved on the link.
    seen: Arc<RwLock<HashMap<String, String>>>,
    browsing: AtomicBool,
}

fn discovery_err(e: mdns_sd::Error) -> Error {
    Error::Discovery(e.to_string())
}

/// The instance label of a DNS-SD fullname
/// (`alice@host._presence._tcp.local.` → `alice@host`).
fn instance_of(fullname: &str) -> &str {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(fullname)
}

/// mDNS host names are rooted in `.local.`.
fn qualify_host(host: &str) -> String {
    if host.ends_with(".local.") {
        host.to_string()
    } else if host.ends_with(".local") {
        format!("{host}.")
    } else {
        format!("{host}.local.")
    }
}

/// Choose the instance label to register: the requested one, or the
/// first free "name (2)", "name (3)", ... (RFC 6762 §9 renaming
/// convention). A label counts as taken only when a peer on a
/// *different* host holds it; our own stale advert does not.
fn pick_instance_name(requested: &str, our_host: &str, seen: &HashMap<String, String>) -> String {
    let taken = |name: &str| seen.get(name).is_some_and(|host| host != our_host);
    let mut instance = requested.to_string();
    let mut suffix = 2;
    while taken(&instance) {
        instance = format!("{requested} ({suffix})");
        suffix += 1;
    }
    instance
}

/// Decode a resolved service into a presence.
///
/// The library hands us parsed properties; they are flattened back into
/// the raw length-prefixed TXT payload and run through the wire codec,
/// so record semantics — bare keys dropped, invalid UTF-8 a hard
/// failure for that presence only — live in exactly one place.
fn presence_from_info(instance: &str, info: &ServiceInfo) -> Result<LLPresence> {
    let mut raw = Vec::new();
    for prop in info.get_properties().iter() {
        let mut record = prop.key().as_bytes().to_vec();
        if let Some(val) = prop.val() {
            record.push(b'=');
            record.extend_from_slice(val);
        }
        // Wire records are length-prefixed by a single byte; anything
        // longer cannot have come off a real TXT record.
        if record.len() > 255 {
            continue;
        }
        raw.push(record.len() as u8);
        raw.extend_from_slice(&record);
    }
    let pairs = txt::decode(&raw)?;
    Ok(LLPresence::from_txt(
        instance,
        info.get_hostname(),
        info.get_port(),
        &pairs,
    ))
}

impl MdnsDiscovery {
    pub fn new() -> Result<MdnsDiscovery> {
        let daemon = ServiceDaemon::new().map_err(discovery_err)?;
        Ok(MdnsDiscovery {
            daemon,
            observers: Arc::new(RwLock::new(Vec::new())),
            registration: Mutex::new(None),
            local_instance: Arc::new(RwLock::new(None)),
            seen: Arc::new(RwLock::new(HashMap::new())),
            browsing: AtomicBool::new(false),
        })
    }

    fn build_info(&self, instance: &str, presence: &LLPresence) -> Result<ServiceInfo> {
        let host = qualify_host(presence.host());
        // Normalize the TXT map through the wire codec so records carry
        // the DNS per-record truncation before they reach the daemon.
        let props: HashMap<String, String> = txt::sanitize(&presence.to_txt()).into_iter().collect();
        let info = ServiceInfo::new(SERVICE_TYPE, instance, &host, "", presence.port(), props)
            .map_err(discovery_err)?
            .enable_addr_auto();
        Ok(info)
    }
}

impl Discovery for MdnsDiscovery {
    fn register(&self, presence: &LLPresence) -> Result<String> {
        if presence.host().is_empty() {
            return Err(Error::Discovery(
                "local presence has no host name".to_string(),
            ));
        }
        let requested = presence.service_name().to_string();
        let our_host = qualify_host(presence.host());

        // Collision handling against everything browsing has resolved so
        // far. The caller browses (and waits out the probe window) before
        // registering, so peers already on the link are visible here.
        let instance = {
            let seen = self.seen.read().expect("seen cache poisoned");
            pick_instance_name(&requested, &our_host, &seen)
        };

        let info = self.build_info(&instance, presence)?;
        self.daemon.register(info.clone()).map_err(discovery_err)?;

        if instance != requested {
            // The original label belongs to someone else now; any cached
            // resolution of it under our host is a ghost. Purge so later
            // lookups cannot read stale data.
            let stale = {
                let mut seen = self.seen.write().expect("seen cache poisoned");
                seen.get(&requested)
                    .is_some_and(|host| host == &our_host)
                    .then(|| seen.remove(&requested))
                    .flatten()
            };
            if stale.is_some() {
                for o in self.observers.read().expect("observers poisoned").iter() {
                    o.service_removed(&requested);
                }
            }
            tracing::info!(
                requested = %requested,
                registered = %instance,
                "service name collision, registered under altered label"
            );
        } else {
            tracing::info!(name = %instance, port = presence.port(), "service registered");
        }

        *self
            .local_instance
            .write()
            .expect("local instance poisoned") = Some(instance.clone());
        *self.registration.lock().expect("registration poisoned") = Some(Registration {
            instance: instance.clone(),
            fullname: info.get_fullname().to_string(),
            info,
        });
        Ok(instance)
    }

    fn unregister(&self) -> Result<()> {
        let Some(reg) = self
            .registration
            .lock()
            .expect("registration poisoned")
            .take()
        else {
            return Ok(());
        };
        let _ = self.daemon.unregister(&reg.fullname).map_err(discovery_err)?;
        tracing::info!(name = %reg.instance, "service unregistered");
        Ok(())
    }

    fn reannounce(&self) -> Result<()> {
        let guard = self.registration.lock().expect("registration poisoned");
        let Some(reg) = guard.as_ref() else {
            return Err(Error::Discovery("service is not registered".to_string()));
        };
        // Re-registering an already-known service re-broadcasts its records.
        self.daemon
            .register(reg.info.clone())
            .map_err(discovery_err)?;
        tracing::debug!(name = %reg.instance, "service reannounced");
        Ok(())
    }

    fn update_txt(&self, presence: &LLPresence) -> Result<()> {
        let mut guard = self.registration.lock().expect("registration poisoned");
        let Some(reg) = guard.as_mut() else {
            return Err(Error::Discovery("service is not registered".to_string()));
        };
        let instance = reg.instance.clone();
        let info = self.build_info(&instance, presence)?;
        self.daemon.register(info.clone()).map_err(discovery_err)?;
        reg.info = info;
        Ok(())
    }

    fn browse(&self) -> Result<()> {
        if self.browsing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let receiver = self.daemon.browse(SERVICE_TYPE).map_err(discovery_err)?;
        let observers = self.observers.clone();
        let seen = self.seen.clone();
        let local_instance = self.local_instance.clone();

        tokio::spawn(async move {
            let snapshot = |observers: &Arc<RwLock<Vec<Arc<dyn DiscoveryObserver>>>>| {
                observers.read().expect("observers poisoned").clone()
            };
            let is_local = |name: &str| {
                local_instance
                    .read()
                    .expect("local instance poisoned")
                    .as_deref()
                    == Some(name)
            };
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceFound(_ty, fullname) => {
                        let name = instance_of(&fullname);
                        if is_local(name) {
                            continue;
                        }
                        // mdns-sd resolves found services on its own; the
                        // resolved event follows without an explicit request.
                        for o in snapshot(&observers).iter() {
                            o.service_added(name);
                        }
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        let name = instance_of(info.get_fullname()).to_string();
                        if is_local(&name) {
                            continue;
                        }
                        match presence_from_info(&name, &info) {
                            Ok(presence) => {
                                seen.write()
                                    .expect("seen cache poisoned")
                                    .insert(name.clone(), presence.host().to_string());
                                for o in snapshot(&observers).iter() {
                                    o.service_resolved(presence.clone());
                                }
                            }
                            Err(e) => {
                                tracing::warn!(peer = %name, error = %e, "dropping mis-encoded presence");
                            }
                        }
                    }
                    ServiceEvent::ServiceRemoved(_ty, fullname) => {
                        let name = instance_of(&fullname);
                        if is_local(name) {
                            continue;
                        }
                        seen.write().expect("seen cache poisoned").remove(name);
                        for o in snapshot(&observers).iter() {
                            o.service_removed(name);
                        }
                    }
                    _ => {}
                }
            }
            tracing::debug!("mdns browse channel closed");
        });
        Ok(())
    }

    fn subscribe(&self, observer: Arc<dyn DiscoveryObserver>) {
        self.observers
            .write()
            .expect("observers poisoned")
            .push(observer);
    }

    fn shutdown(&self) -> Result<()> {
        let _ = self.daemon.shutdown().map_err(discovery_err)?;
        Ok(())
    }
}
