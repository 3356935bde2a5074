//! The link-local session manager.
//!
//! `LLService` owns everything: the listening socket, both stream tables
//! (inbound = we responded, outbound = we dialed), the presence store,
//! the chat registry, packet listeners and cross-stream collectors. All
//! inbound stanzas — from every stream — pass through one dispatcher
//! task, which gives listeners a consistent notification order and makes
//! collectors cross-stream for free.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use salut_core::config::ServiceConfig;
use salut_core::filter::{self, StanzaFilter};
use salut_core::{Error, Iq, IqType, LLPresence, Message, MessageType, Result, Stanza};
use salut_mdns::{Discovery, PresenceListener, PresenceStore};

use crate::chat::Chat;
use crate::collector::{CollectorInner, PacketCollector};
use crate::listener::{
    ChatListener, ConnectionListener, PacketInterceptor, PacketListener, ServiceStateListener,
};
use crate::stream::{PeerStream, StreamRole};

#[derive(Clone)]
struct ListenerEntry {
    id: u64,
    filter: StanzaFilter,
    listener: Arc<dyn PacketListener>,
}

#[derive(Clone)]
struct InterceptorEntry {
    id: u64,
    filter: StanzaFilter,
    interceptor: Arc<dyn PacketInterceptor>,
}

pub(crate) struct ServiceInner {
    pub(crate) config: ServiceConfig,
    pub(crate) store: Arc<PresenceStore>,
    discovery: Arc<dyn Discovery>,
    local: RwLock<LLPresence>,

    /// Streams the peer dialed, keyed by remote service name.
    inbound: DashMap<String, Arc<PeerStream>>,
    /// Streams we dialed, keyed by remote service name.
    outbound: DashMap<String, Arc<PeerStream>>,
    chats: DashMap<String, Arc<Chat>>,

    packet_listeners: RwLock<Vec<ListenerEntry>>,
    send_listeners: RwLock<Vec<ListenerEntry>>,
    interceptors: RwLock<Vec<InterceptorEntry>>,
    next_listener_id: AtomicU64,
    state_listeners: RwLock<Vec<Arc<dyn ServiceStateListener>>>,
    chat_listeners: RwLock<Vec<Arc<dyn ChatListener>>>,
    connection_listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    collectors: RwLock<Vec<Arc<CollectorInner>>>,

    dispatch_tx: mpsc::UnboundedSender<(Arc<PeerStream>, Stanza)>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<(Arc<PeerStream>, Stanza)>>>,
    shutdown_tx: broadcast::Sender<()>,
    initialized: AtomicBool,
    closed: AtomicBool,
    weak_self: Weak<ServiceInner>,
}

impl ServiceInner {
    pub(crate) fn local_name(&self) -> String {
        self.local
            .read()
            .expect("local presence poisoned")
            .service_name()
            .to_string()
    }

    pub(crate) fn enqueue_dispatch(&self, stream: Arc<PeerStream>, stanza: Stanza) {
        // Receiver only disappears at close; drops are fine then.
        let _ = self.dispatch_tx.send((stream, stanza));
    }

    /// A stream reached OPEN. Record it in the table matching its role.
    pub(crate) fn stream_opened(&self, stream: &Arc<PeerStream>) {
        let Some(name) = stream.remote_name() else {
            return;
        };
        match stream.role() {
            StreamRole::Initiator => {
                self.outbound.insert(name.clone(), stream.clone());
            }
            StreamRole::Responder => {
                self.inbound.insert(name.clone(), stream.clone());
            }
        }
        for l in self.connection_listeners() {
            l.connection_opened(&name, stream.role());
        }
    }

    /// A stream died. Drop the table entry — but only if it is still this
    /// very stream; the concurrent-dial window can put a replacement
    /// under the same name.
    pub(crate) fn stream_closed(&self, stream: &PeerStream, on_error: bool) {
        let Some(name) = stream.remote_name() else {
            return;
        };
        let ptr = stream as *const PeerStream;
        let table = match stream.role() {
            StreamRole::Initiator => &self.outbound,
            StreamRole::Responder => &self.inbound,
        };
        table.remove_if(&name, |_, entry| std::ptr::eq(Arc::as_ptr(entry), ptr));
        for l in self.connection_listeners() {
            l.connection_closed(&name, on_error);
        }
    }

    pub(crate) fn remove_collector(&self, collector: &Arc<CollectorInner>) {
        self.collectors
            .write()
            .expect("collectors poisoned")
            .retain(|c| !Arc::ptr_eq(c, collector));
    }

    /// Get the chat for a peer, creating it if the peer's presence is
    /// known. There is never more than one chat per service name.
    pub(crate) fn chat_for(self: &Arc<Self>, service_name: &str) -> Result<Arc<Chat>> {
        if let Some(chat) = self.chats.get(service_name) {
            return Ok(chat.clone());
        }
        if !self.store.contains(service_name) {
            return Err(Error::PeerUnavailable(service_name.to_string()));
        }
        let entry = self.chats.entry(service_name.to_string());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let chat = Chat::new(self.weak_self.clone(), service_name.to_string());
                v.insert(chat.clone());
                tracing::debug!(peer = service_name, "chat session created");
                for l in self
                    .chat_listeners
                    .read()
                    .expect("chat listeners poisoned")
                    .clone()
                {
                    l.new_chat(&chat);
                }
                Ok(chat)
            }
        }
    }

    /// A usable stream to the peer, dialing when none exists. During the
    /// concurrent-dial window both directions may exist; the outbound one
    /// wins, so both sides converge on same-direction streams.
    pub(crate) async fn connect_to(self: &Arc<Self>, service_name: &str) -> Result<Arc<PeerStream>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if let Some(stream) = self.outbound.get(service_name).map(|e| e.value().clone()) {
            if stream.is_open() {
                return Ok(stream);
            }
            self.outbound
                .remove_if(service_name, |_, entry| Arc::ptr_eq(entry, &stream));
        }
        if let Some(stream) = self.inbound.get(service_name).map(|e| e.value().clone()) {
            if stream.is_open() {
                return Ok(stream);
            }
        }

        let presence = self
            .store
            .get(service_name)
            .ok_or_else(|| Error::PeerUnavailable(service_name.to_string()))?;
        let host = presence.host().trim_end_matches('.').to_string();
        tracing::debug!(peer = service_name, host = %host, port = presence.port(), "dialing");
        let tcp = tokio::net::TcpStream::connect((host.as_str(), presence.port())).await?;
        let stream = PeerStream::initiate(self, tcp, service_name);
        stream.wait_open(self.config.open_timeout()).await?;
        Ok(stream)
    }

    /// Stamp `from`, run interceptors, and deliver over a (possibly
    /// fresh) stream to `to`. Send listeners fire once the stanza is
    /// queued for the wire.
    pub(crate) async fn send_stanza(self: &Arc<Self>, mut stanza: Stanza) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let to = stanza
            .to()
            .map(str::to_string)
            .ok_or_else(|| Error::StreamProtocol("outbound stanza has no 'to'".to_string()))?;
        stanza.set_from(self.local_name());

        let interceptors = self
            .interceptors
            .read()
            .expect("interceptors poisoned")
            .clone();
        for entry in &interceptors {
            if (entry.filter)(&stanza) {
                entry.interceptor.intercept_packet(&mut stanza);
            }
        }

        let stream = self.connect_to(&to).await?;
        stream.send(stanza.clone()).await?;

        let send_listeners = self
            .send_listeners
            .read()
            .expect("send listeners poisoned")
            .clone();
        for entry in &send_listeners {
            if (entry.filter)(&stanza) {
                entry.listener.process_packet(&stanza);
            }
        }
        Ok(())
    }

    /// Route one inbound stanza: collectors first, then filtered packet
    /// listeners, then chat delivery for chat-class messages, and finally
    /// the automatic error reply for IQ requests nobody handled.
    async fn dispatch(self: &Arc<Self>, stream: &Arc<PeerStream>, stanza: Stanza) {
        let collectors = self.collectors.read().expect("collectors poisoned").clone();
        for collector in &collectors {
            collector.offer(&stanza);
        }

        let listeners = self
            .packet_listeners
            .read()
            .expect("packet listeners poisoned")
            .clone();
        let mut accepted = false;
        for entry in &listeners {
            if (entry.filter)(&stanza) {
                entry.listener.process_packet(&stanza);
                accepted = true;
            }
        }

        match &stanza {
            Stanza::Message(message)
                if matches!(
                    message.mtype,
                    MessageType::Chat | MessageType::Normal | MessageType::Error
                ) =>
            {
                self.deliver_to_chat(message);
            }
            Stanza::Iq(iq) if !accepted && matches!(iq.itype, IqType::Get | IqType::Set) => {
                let mut reply = iq.feature_not_implemented_reply();
                if reply.to.is_none() {
                    reply.to = stream.remote_name();
                }
                reply.from = Some(self.local_name());
                tracing::debug!(id = %iq.id, "auto-replying feature-not-implemented");
                if let Err(e) = stream.send(Stanza::Iq(reply)).await {
                    tracing::debug!(error = %e, "failed to send iq auto-reply");
                }
            }
            _ => {}
        }
    }

    fn deliver_to_chat(self: &Arc<Self>, message: &Message) {
        let Some(from) = message.from.clone().filter(|f| !f.is_empty()) else {
            tracing::debug!("message without 'from', treating as unknown origin");
            self.notify_unknown_origin(message);
            return;
        };
        match self.chat_for(&from) {
            Ok(chat) => chat.deliver(message.clone()),
            Err(_) => {
                tracing::debug!(peer = %from, "message from unknown origin");
                self.notify_unknown_origin(message);
            }
        }
    }

    fn notify_unknown_origin(&self, message: &Message) {
        for l in self
            .state_listeners
            .read()
            .expect("state listeners poisoned")
            .clone()
        {
            l.unknown_origin_message(message);
        }
    }

    fn state_listeners(&self) -> Vec<Arc<dyn ServiceStateListener>> {
        self.state_listeners
            .read()
            .expect("state listeners poisoned")
            .clone()
    }

    fn connection_listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.connection_listeners
            .read()
            .expect("connection listeners poisoned")
            .clone()
    }
}

/// A running XEP-0174 link-local service. Cloning yields another handle
/// to the same service.
pub struct LLService {
    inner: Arc<ServiceInner>,
}

impl Clone for LLService {
    fn clone(&self) -> LLService {
        LLService {
            inner: self.inner.clone(),
        }
    }
}

impl LLService {
    /// Wire up a service around a discovery adapter. Call [`init`] to
    /// bind, register and start accepting.
    ///
    /// [`init`]: LLService::init
    pub fn new(
        presence: LLPresence,
        discovery: Arc<dyn Discovery>,
        config: ServiceConfig,
    ) -> LLService {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(4);
        let store = Arc::new(PresenceStore::new());

        let inner = Arc::new_cyclic(|weak_self: &Weak<ServiceInner>| ServiceInner {
            config,
            store: store.clone(),
            discovery: discovery.clone(),
            local: RwLock::new(presence),
            inbound: DashMap::new(),
            outbound: DashMap::new(),
            chats: DashMap::new(),
            packet_listeners: RwLock::new(Vec::new()),
            send_listeners: RwLock::new(Vec::new()),
            interceptors: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            state_listeners: RwLock::new(Vec::new()),
            chat_listeners: RwLock::new(Vec::new()),
            connection_listeners: RwLock::new(Vec::new()),
            collectors: RwLock::new(Vec::new()),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            shutdown_tx,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        // Discovery events land in the store; the engine reads from it.
        discovery.subscribe(store);
        LLService { inner }
    }

    /// Bootstrap: bind the first free port in the configured range,
    /// browse the link and wait out the probe window, register the
    /// presence (adopting a renamed label on collision), and spawn the
    /// acceptor and dispatcher.
    pub async fn init(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let config = &self.inner.config;
        let (listener, port) = bind_range(config.network.port_min, config.network.port_max).await?;
        self.inner
            .local
            .write()
            .expect("local presence poisoned")
            .set_port(port);

        // Watch the link before claiming a name on it: peers that resolve
        // during the probe window are what lets registration detect a
        // label someone else already holds.
        self.inner.discovery.browse()?;
        tokio::time::sleep(config.probe_delay()).await;

        let (requested, snapshot) = {
            let local = self.inner.local.read().expect("local presence poisoned");
            (local.service_name().to_string(), local.clone())
        };
        let registered = self.inner.discovery.register(&snapshot)?;
        if registered != requested {
            self.inner
                .local
                .write()
                .expect("local presence poisoned")
                .set_service_name(&registered);
            for l in self.inner.state_listeners() {
                l.service_name_changed(&registered, &requested);
            }
        }

        let acceptor_inner = self.inner.clone();
        let acceptor_shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(acceptor_task(acceptor_inner, listener, acceptor_shutdown));

        if let Some(rx) = self
            .inner
            .dispatch_rx
            .lock()
            .expect("dispatch receiver poisoned")
            .take()
        {
            let dispatcher_inner = self.inner.clone();
            let dispatcher_shutdown = self.inner.shutdown_tx.subscribe();
            tokio::spawn(dispatcher_task(dispatcher_inner, rx, dispatcher_shutdown));
        }

        tracing::info!(name = %registered, port, "link-local service started");
        Ok(())
    }

    /// Snapshot of the local presence.
    pub fn local_presence(&self) -> LLPresence {
        self.inner
            .local
            .read()
            .expect("local presence poisoned")
            .clone()
    }

    /// Presence of one peer, if resolved on the link.
    pub fn presence_of(&self, service_name: &str) -> Option<LLPresence> {
        self.inner.store.get(service_name)
    }

    /// All peers currently resolved on the link.
    pub fn known_presences(&self) -> Vec<LLPresence> {
        self.inner.store.snapshot()
    }

    /// A usable stream to the peer, dialing when none exists.
    pub async fn connect_to(&self, service_name: &str) -> Result<Arc<PeerStream>> {
        self.inner.connect_to(service_name).await
    }

    /// Send a stanza to the peer in its `to` attribute. `from` is
    /// stamped with the local service name regardless of what it held.
    pub async fn send_stanza(&self, stanza: Stanza) -> Result<()> {
        self.inner.send_stanza(stanza).await
    }

    /// Send a message stanza.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.send_stanza(Stanza::Message(message)).await
    }

    /// Send an IQ get/set and await its reply, correlated by id across
    /// all streams — the answer may well arrive on a different TCP
    /// connection than the request left on.
    pub async fn get_iq_response(&self, iq: Iq) -> Result<Iq> {
        let collector = self.create_collector(filter::iq_reply(&iq.id));
        if let Err(e) = self.send_stanza(Stanza::Iq(iq)).await {
            collector.cancel();
            return Err(e);
        }
        let reply = collector.next(self.inner.config.reply_timeout()).await;
        collector.cancel();
        match reply {
            Some(Stanza::Iq(reply)) => Ok(reply),
            _ => Err(Error::ReplyTimeout),
        }
    }

    /// Create a collector over all streams, current and future.
    pub fn create_collector(&self, filter: StanzaFilter) -> PacketCollector {
        let inner = CollectorInner::new(filter);
        self.inner
            .collectors
            .write()
            .expect("collectors poisoned")
            .push(inner.clone());
        PacketCollector::new(inner, Arc::downgrade(&self.inner))
    }

    /// The chat session for a peer, created on first use. Fails with
    /// `PeerUnavailable` when no presence is known.
    pub fn chat(&self, service_name: &str) -> Result<Arc<Chat>> {
        self.inner.chat_for(service_name)
    }

    /// Register a packet listener. It observes matching stanzas from all
    /// streams, including streams opened later. Returns a handle for
    /// [`remove_packet_listener`].
    ///
    /// [`remove_packet_listener`]: LLService::remove_packet_listener
    pub fn add_packet_listener(
        &self,
        filter: StanzaFilter,
        listener: Arc<dyn PacketListener>,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .packet_listeners
            .write()
            .expect("packet listeners poisoned")
            .push(ListenerEntry {
                id,
                filter,
                listener,
            });
        id
    }

    pub fn remove_packet_listener(&self, id: u64) {
        self.inner
            .packet_listeners
            .write()
            .expect("packet listeners poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Register an interceptor for outbound stanzas. Interceptors run
    /// after `from` stamping and before serialization, and may rewrite
    /// the stanza.
    pub fn add_packet_interceptor(
        &self,
        filter: StanzaFilter,
        interceptor: Arc<dyn PacketInterceptor>,
    ) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .interceptors
            .write()
            .expect("interceptors poisoned")
            .push(InterceptorEntry {
                id,
                filter,
                interceptor,
            });
        id
    }

    pub fn remove_packet_interceptor(&self, id: u64) {
        self.inner
            .interceptors
            .write()
            .expect("interceptors poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Register a listener for outbound stanzas; it observes each
    /// matching stanza once it has been handed to a stream's writer.
    pub fn add_send_listener(&self, filter: StanzaFilter, listener: Arc<dyn PacketListener>) -> u64 {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .send_listeners
            .write()
            .expect("send listeners poisoned")
            .push(ListenerEntry {
                id,
                filter,
                listener,
            });
        id
    }

    pub fn remove_send_listener(&self, id: u64) {
        self.inner
            .send_listeners
            .write()
            .expect("send listeners poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Every currently tracked stream, outbound first. Useful for
    /// layering features across all live connections.
    pub fn connections(&self) -> Vec<Arc<PeerStream>> {
        self.inner
            .outbound
            .iter()
            .map(|e| e.value().clone())
            .chain(self.inner.inbound.iter().map(|e| e.value().clone()))
            .collect()
    }

    pub fn add_state_listener(&self, listener: Arc<dyn ServiceStateListener>) {
        self.inner
            .state_listeners
            .write()
            .expect("state listeners poisoned")
            .push(listener);
    }

    pub fn add_chat_listener(&self, listener: Arc<dyn ChatListener>) {
        self.inner
            .chat_listeners
            .write()
            .expect("chat listeners poisoned")
            .push(listener);
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner
            .connection_listeners
            .write()
            .expect("connection listeners poisoned")
            .push(listener);
    }

    pub fn add_presence_listener(&self, listener: Arc<dyn PresenceListener>) {
        self.inner.store.add_listener(listener);
    }

    /// Merge new TXT-visible fields into the local presence and
    /// re-announce over mDNS.
    pub fn update_presence(&self, patch: &LLPresence) -> Result<()> {
        self.inner
            .local
            .write()
            .expect("local presence poisoned")
            .update(patch);
        if self.inner.initialized.load(Ordering::SeqCst) {
            let snapshot = self
                .inner
                .local
                .read()
                .expect("local presence poisoned")
                .clone();
            self.inner.discovery.update_txt(&snapshot)?;
            self.inner.discovery.reannounce()?;
        }
        Ok(())
    }

    /// Withdraw the advertised service without tearing down open streams.
    pub fn make_unavailable(&self) -> Result<()> {
        self.inner.discovery.unregister()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Shut everything down: withdraw the service, stop the acceptor and
    /// dispatcher, close every stream (writers drain best-effort within
    /// 150 ms) and release collector waiters.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(name = %self.inner.local_name(), "closing link-local service");
        if let Err(e) = self.inner.discovery.unregister() {
            tracing::warn!(error = %e, "unregister failed during close");
        }
        let _ = self.inner.shutdown_tx.send(());

        let streams: Vec<Arc<PeerStream>> = self
            .inner
            .outbound
            .iter()
            .map(|e| e.value().clone())
            .chain(self.inner.inbound.iter().map(|e| e.value().clone()))
            .collect();
        for stream in &streams {
            stream.close();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let collectors: Vec<Arc<CollectorInner>> = self
            .inner
            .collectors
            .write()
            .expect("collectors poisoned")
            .drain(..)
            .collect();
        for collector in collectors {
            collector.cancel();
        }

        if let Err(e) = self.inner.discovery.shutdown() {
            tracing::debug!(error = %e, "discovery shutdown failed");
        }
        for l in self.inner.state_listeners() {
            l.service_closed();
        }
    }
}

/// Bind the first free port in `[min, max]`.
async fn bind_range(min: u16, max: u16) -> Result<(TcpListener, u16)> {
    for port in min..=max {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(_) => continue,
        }
    }
    Err(Error::BindFailed(min, max))
}

/// Accept inbound connections. Each becomes a responder stream with its
/// own tasks, so two peers dialing at once never block each other.
async fn acceptor_task(
    inner: Arc<ServiceInner>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("acceptor shutting down");
                return;
            }

            accepted = listener.accept() => match accepted {
                Ok((tcp, addr)) => {
                    tracing::debug!(addr = %addr, "inbound connection");
                    PeerStream::accept(&inner, tcp);
                }
                Err(e) => {
                    if inner.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::error!(error = %e, "accept failed, acceptor stopping");
                    let error = Error::StreamIo(e);
                    for l in inner.state_listeners() {
                        l.service_closed_on_error(&error);
                    }
                    return;
                }
            }
        }
    }
}

/// The single per-service dispatcher: stanzas from all streams, in
/// arrival order per stream, with one consistent listener ordering.
async fn dispatcher_task(
    inner: Arc<ServiceInner>,
    mut rx: mpsc::UnboundedReceiver<(Arc<PeerStream>, Stanza)>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            next = rx.recv() => {
                let Some((stream, stanza)) = next else { return };
                inner.dispatch(&stream, stanza).await;
            }
        }
    }
}
