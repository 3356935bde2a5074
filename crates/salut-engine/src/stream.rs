//! Per-peer XMPP stream state machine.
//!
//! One `PeerStream` per TCP connection. Three tasks drive it: a reader
//! (framing + header handling + dispatch hand-off), a writer (bounded
//! in-order queue, drains on shutdown and emits the closing tag), and an
//! idle watchdog. Link-local peers can vanish without a FIN — suspend,
//! Wi-Fi roam — so any stream quiet past the idle threshold is torn down.
//!
//! The stream holds only a weak reference back to its service; the
//! service exclusively owns the stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};

use salut_core::xml::{self, StreamEvent, StreamFramer};
use salut_core::{Error, Result, Stanza};

use crate::service::ServiceInner;

/// Who opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// We dialed the peer.
    Initiator,
    /// The peer dialed us; its service name is learned from its header.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Initiator: header sent, waiting for the peer's.
    Connecting,
    /// Responder: waiting for the peer's opening header.
    AwaitingHeader,
    /// Both headers exchanged; stanzas flow.
    Open,
    /// Orderly teardown in progress.
    Closing,
    /// Gone, cleanly.
    Closed,
    /// Gone, on an I/O or protocol error.
    ClosedErr,
}

pub(crate) enum WriteCmd {
    Header { to: String, from: String },
    Stanza(Stanza),
}

pub struct PeerStream {
    role: StreamRole,
    local_name: String,
    remote_name: RwLock<Option<String>>,
    state_tx: watch::Sender<StreamState>,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last successful read or write.
    last_activity: AtomicU64,
    writer_tx: mpsc::Sender<WriteCmd>,
    shutdown_tx: broadcast::Sender<()>,
    closing: AtomicBool,
    service: Weak<ServiceInner>,
}

impl PeerStream {
    /// Dial-side construction: the opening header goes out immediately.
    pub(crate) fn initiate(
        service: &Arc<ServiceInner>,
        tcp: TcpStream,
        remote_name: &str,
    ) -> Arc<PeerStream> {
        let stream = PeerStream::spawn(
            service,
            tcp,
            StreamRole::Initiator,
            Some(remote_name.to_string()),
            StreamState::Connecting,
        );
        // Freshly created queue; this cannot fill.
        let _ = stream.writer_tx.try_send(WriteCmd::Header {
            to: remote_name.to_string(),
            from: stream.local_name.clone(),
        });
        stream
    }

    /// Accept-side construction: nothing is written until the peer's
    /// header identifies it.
    pub(crate) fn accept(service: &Arc<ServiceInner>, tcp: TcpStream) -> Arc<PeerStream> {
        PeerStream::spawn(
            service,
            tcp,
            StreamRole::Responder,
            None,
            StreamState::AwaitingHeader,
        )
    }

    fn spawn(
        service: &Arc<ServiceInner>,
        tcp: TcpStream,
        role: StreamRole,
        remote_name: Option<String>,
        initial: StreamState,
    ) -> Arc<PeerStream> {
        let config = &service.config;
        let (read_half, write_half) = tcp.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(config.stream.writer_queue);
        let (state_tx, _) = watch::channel(initial);
        let (shutdown_tx, _) = broadcast::channel(4);

        let stream = Arc::new(PeerStream {
            role,
            local_name: service.local_name(),
            remote_name: RwLock::new(remote_name),
            state_tx,
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
            writer_tx,
            shutdown_tx,
            closing: AtomicBool::new(false),
            service: Arc::downgrade(service),
        });
        stream.touch();

        tokio::spawn(reader_task(stream.clone(), read_half));
        tokio::spawn(writer_task(stream.clone(), write_half, writer_rx));
        tokio::spawn(watchdog_task(
            stream.clone(),
            config.idle_timeout(),
            config.watchdog_tick(),
        ));
        stream
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// The remote service name: known at dial time for initiators,
    /// learned from the inbound header for responders.
    pub fn remote_name(&self) -> Option<String> {
        self.remote_name
            .read()
            .expect("remote name poisoned")
            .clone()
    }

    /// Enqueue a stanza for the writer. Blocks when the queue (capacity
    /// 500) is full — back-pressure, not loss.
    pub async fn send(&self, stanza: Stanza) -> Result<()> {
        if matches!(self.state(), StreamState::Closed | StreamState::ClosedErr) {
            return Err(Error::StreamIo(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "stream is closed",
            )));
        }
        self.writer_tx
            .send(WriteCmd::Stanza(stanza))
            .await
            .map_err(|_| {
                Error::StreamIo(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "stream writer is gone",
                ))
            })
    }

    /// Wait until the stream reaches OPEN, with a deadline.
    pub(crate) async fn wait_open(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                StreamState::Open => return Ok(()),
                StreamState::Closed | StreamState::ClosedErr => {
                    return Err(Error::StreamProtocol(
                        "stream closed before it opened".to_string(),
                    ))
                }
                _ => {}
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(Error::StreamProtocol(
                        "stream closed before it opened".to_string(),
                    ))
                }
                Err(_) => {
                    return Err(Error::StreamIo(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "timed out waiting for the remote stream header",
                    )))
                }
            }
        }
    }

    pub(crate) fn touch(&self) {
        self.last_activity
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    fn set_state(&self, state: StreamState) {
        self.state_tx.send_replace(state);
    }

    /// Terminate the stream. Idempotent; the first caller wins. The
    /// writer gets its drain window, the reader and watchdog stop, and
    /// the owning service drops its table entry.
    pub(crate) fn shut_down(&self, error: bool) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.set_state(if error {
            StreamState::ClosedErr
        } else {
            StreamState::Closed
        });
        if let Some(service) = self.service.upgrade() {
            service.stream_closed(self, error);
        }
    }

    /// Ask for an orderly close (idle timeout, `</stream:stream>`, or
    /// service shutdown).
    pub fn close(&self) {
        if !self.closing.load(Ordering::SeqCst) {
            self.set_state(StreamState::Closing);
        }
        self.shut_down(false);
    }

    /// React to one framed stream event. Returns false when the stream
    /// is finished.
    async fn on_event(self: &Arc<Self>, event: StreamEvent) -> bool {
        match event {
            StreamEvent::Opened(header) => {
                let Some(service) = self.service.upgrade() else {
                    self.shut_down(false);
                    return false;
                };
                match self.role {
                    StreamRole::Initiator => {
                        // Table registration happens before the state flips
                        // so a dialer woken by OPEN always finds the entry.
                        service.stream_opened(self);
                        self.set_state(StreamState::Open);
                        true
                    }
                    StreamRole::Responder => {
                        let Some(from) = header.from else {
                            tracing::warn!("inbound stream header has no 'from', closing");
                            self.shut_down(true);
                            return false;
                        };
                        // `to` should name us; a mismatch usually means the
                        // peer resolved a stale advert. Not fatal.
                        if let Some(to) = &header.to {
                            if *to != self.local_name {
                                tracing::debug!(
                                    to = %to,
                                    local = %self.local_name,
                                    "stream header addressed to a different name"
                                );
                            }
                        }
                        // Streams are only kept for peers visible on the link.
                        if !service.store.contains(&from) {
                            tracing::warn!(
                                peer = %from,
                                "unknown service name in stream header, closing"
                            );
                            self.set_state(StreamState::Closing);
                            self.shut_down(false);
                            return false;
                        }
                        *self.remote_name.write().expect("remote name poisoned") =
                            Some(from.clone());
                        let reply = WriteCmd::Header {
                            to: from.clone(),
                            from: self.local_name.clone(),
                        };
                        if self.writer_tx.send(reply).await.is_err() {
                            self.shut_down(true);
                            return false;
                        }
                        service.stream_opened(self);
                        self.set_state(StreamState::Open);
                        tracing::debug!(peer = %from, "inbound stream open");
                        true
                    }
                }
            }
            StreamEvent::Stanza(stanza) => {
                if let Some(service) = self.service.upgrade() {
                    service.enqueue_dispatch(self.clone(), stanza);
                    true
                } else {
                    self.shut_down(false);
                    false
                }
            }
            StreamEvent::Closed => {
                tracing::debug!(peer = ?self.remote_name(), "peer closed the stream");
                self.close();
                false
            }
            StreamEvent::StreamError(condition) => {
                tracing::warn!(condition = %condition, "stream-level error from peer");
                self.shut_down(true);
                false
            }
        }
    }
}

async fn reader_task(stream: Arc<PeerStream>, mut read_half: OwnedReadHalf) {
    let mut framer = StreamFramer::new();
    let mut buf = vec![0u8; 8192];
    let mut shutdown = stream.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(peer = ?stream.remote_name(), "connection closed by peer");
                    stream.shut_down(false);
                    return;
                }
                Ok(n) => {
                    stream.touch();
                    framer.push(&buf[..n]);
                    loop {
                        match framer.next_event() {
                            Ok(Some(event)) => {
                                if !stream.on_event(event).await {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "stream parse failure");
                                stream.shut_down(true);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "stream read failed");
                    stream.shut_down(true);
                    return;
                }
            }
        }
    }
}

async fn writer_task(
    stream: Arc<PeerStream>,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WriteCmd>,
) {
    let mut shutdown = stream.shutdown_tx.subscribe();
    let mut header_sent = false;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                let xml = render(&cmd, &mut header_sent);
                if let Err(e) = write_half.write_all(xml.as_bytes()).await {
                    tracing::debug!(error = %e, "stream write failed");
                    stream.shut_down(true);
                    return;
                }
                stream.touch();
            }
        }
    }

    // Shutdown: flush what is already queued, best effort within 150 ms,
    // then close the stream properly.
    let deadline = Instant::now() + Duration::from_millis(150);
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(cmd) => {
                let xml = render(&cmd, &mut header_sent);
                if write_half.write_all(xml.as_bytes()).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    if header_sent {
        let _ = write_half.write_all(xml::STREAM_CLOSE.as_bytes()).await;
    }
    let _ = write_half.shutdown().await;
}

fn render(cmd: &WriteCmd, header_sent: &mut bool) -> String {
    match cmd {
        WriteCmd::Header { to, from } => {
            *header_sent = true;
            xml::stream_header(to, from)
        }
        WriteCmd::Stanza(stanza) => stanza.to_xml(),
    }
}

async fn watchdog_task(stream: Arc<PeerStream>, idle_timeout: Duration, tick: Duration) {
    let mut shutdown = stream.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,

            _ = tokio::time::sleep(tick) => {
                if stream.idle_for() > idle_timeout {
                    tracing::debug!(
                        peer = ?stream.remote_name(),
                        idle_ms = stream.idle_for().as_millis() as u64,
                        "stream idle past threshold, closing"
                    );
                    stream.close();
                    return;
                }
            }
        }
    }
}
