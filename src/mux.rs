//! Channel multiplexer
//!
//! Owns the message channels, runs one independent receive loop per channel,
//! and routes parsed messages to interested consumers by correlation key
//! (the parent header's message id). Status broadcasts update
//! [`SessionState`] directly. Messages that match no registration and are
//! not status updates are dropped with a diagnostic counter increment; that
//! is expected during startup races and is never fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::codec::MessageCodec;
use crate::session::{ExecutionState, SessionState};
use crate::transport::{ChannelKind, ChannelSocket, FrameSink, FrameSource};
use crate::wire::{msg_types, WireMessage};
use crate::{Error, Result};

/// The four message-bearing channel sockets (heartbeat is handled by the
/// bridge's monitor, not the multiplexer).
pub struct ChannelSet {
    pub shell: Box<dyn ChannelSocket>,
    pub control: Box<dyn ChannelSocket>,
    pub stdin: Box<dyn ChannelSocket>,
    pub iopub: Box<dyn ChannelSocket>,
}

/// A routed message tagged with the channel it arrived on.
#[derive(Debug)]
pub struct Arrival {
    pub channel: ChannelKind,
    pub message: WireMessage,
}

/// Live interest in one correlation key.
///
/// Dropping the registration deregisters the key and leaves a tombstone for
/// the retention window, so late output is absorbed instead of counting as
/// unrouted.
pub struct Registration {
    key: String,
    rx: mpsc::UnboundedReceiver<Arrival>,
    inner: Arc<MuxInner>,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next message for this key; `None` once the connection has failed.
    pub async fn recv(&mut self) -> Option<Arrival> {
        self.rx.recv().await
    }

    /// Drain without blocking; used to collect output that raced the
    /// terminal reply.
    pub fn try_recv(&mut self) -> Option<Arrival> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.deregister(&self.key);
    }
}

struct Registry {
    routes: HashMap<String, mpsc::UnboundedSender<Arrival>>,
    /// Deregistered keys still absorbing late output, with their expiry.
    tombstones: HashMap<String, Instant>,
}

struct MuxInner {
    codec: MessageCodec,
    session: Arc<SessionState>,
    registry: Mutex<Registry>,
    senders: Mutex<HashMap<ChannelKind, mpsc::UnboundedSender<Vec<Vec<u8>>>>>,
    shutdown: watch::Sender<bool>,
    tombstone_retention: Duration,
    unrouted: AtomicU64,
    closed: AtomicBool,
}

/// Fan-in dispatcher over the message channels.
#[derive(Clone)]
pub struct ChannelMultiplexer {
    inner: Arc<MuxInner>,
}

impl ChannelMultiplexer {
    /// Start the receive loops and return the running multiplexer.
    pub fn start(
        codec: MessageCodec,
        session: Arc<SessionState>,
        tombstone_retention: Duration,
        channels: ChannelSet,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(MuxInner {
            codec,
            session,
            registry: Mutex::new(Registry {
                routes: HashMap::new(),
                tombstones: HashMap::new(),
            }),
            senders: Mutex::new(HashMap::new()),
            shutdown,
            tombstone_retention,
            unrouted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let mux = Self { inner };
        for (kind, socket) in [
            (ChannelKind::Shell, channels.shell),
            (ChannelKind::Control, channels.control),
            (ChannelKind::Stdin, channels.stdin),
            (ChannelKind::IoPub, channels.iopub),
        ] {
            mux.attach(kind, socket);
        }
        mux
    }

    fn attach(&self, kind: ChannelKind, socket: Box<dyn ChannelSocket>) {
        let (sink, source) = socket.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock_senders().insert(kind, tx);

        tokio::spawn(send_loop(kind, sink, Arc::clone(&self.inner), rx));
        tokio::spawn(recv_loop(
            kind,
            source,
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        ));
    }

    /// Register interest in a correlation key before sending the request
    /// that carries it.
    pub fn register(&self, key: &str) -> Result<Registration> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("bridge is closed".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.inner.lock_registry();
        registry.tombstones.remove(key);
        registry.routes.insert(key.to_string(), tx);
        drop(registry);

        trace!("Registered correlation key {}", key);
        Ok(Registration {
            key: key.to_string(),
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Pre-tombstone a key whose reply is deliberately ignored
    /// (fire-and-forget requests like interrupt).
    pub fn expect_discard(&self, key: &str) {
        let deadline = Instant::now() + self.inner.tombstone_retention;
        self.inner
            .lock_registry()
            .tombstones
            .insert(key.to_string(), deadline);
    }

    /// Send a message on one channel.
    pub fn send(&self, kind: ChannelKind, msg: &WireMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("bridge is closed".to_string()));
        }
        let frames = self.inner.codec.encode(msg)?;
        let senders = self.inner.lock_senders();
        let tx = senders
            .get(&kind)
            .ok_or_else(|| Error::Protocol(format!("channel {} not attached", kind)))?;
        tx.send(frames)
            .map_err(|_| Error::Connection(format!("{} channel loop has stopped", kind)))
    }

    /// Count of dropped messages that matched no registration.
    pub fn unrouted_count(&self) -> u64 {
        self.inner.unrouted.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop all channel loops and fail pending registrations. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing channel multiplexer");
        // Dropping the outbound senders makes each send loop close its
        // socket; the watch stops the receive loops.
        self.inner.lock_senders().clear();
        let _ = self.inner.shutdown.send(true);
        self.inner.fail_registrations();
    }
}

impl MuxInner {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_senders(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ChannelKind, mpsc::UnboundedSender<Vec<Vec<u8>>>>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deregister(&self, key: &str) {
        let deadline = Instant::now() + self.tombstone_retention;
        let mut registry = self.lock_registry();
        registry.routes.remove(key);
        registry.tombstones.insert(key.to_string(), deadline);
        // Opportunistic GC of expired tombstones; the table stays tiny.
        let now = Instant::now();
        registry.tombstones.retain(|_, expiry| *expiry > now);
    }

    /// Route one decoded message. Short lock, O(1) lookups; delivery happens
    /// outside the lock.
    fn dispatch(&self, channel: ChannelKind, frames: &[Vec<u8>]) {
        let msg = match self.codec.decode(frames) {
            Ok(msg) => msg,
            Err(Error::Authentication(reason)) => {
                warn!(
                    "Discarding unauthenticated message on {}: {}",
                    channel, reason
                );
                return;
            }
            Err(e) => {
                warn!("Dropping malformed message on {}: {}", channel, e);
                return;
            }
        };

        let is_status = msg.msg_type() == msg_types::STATUS;
        if is_status {
            if let Some(state) = msg
                .content_str("execution_state")
                .and_then(ExecutionState::parse)
            {
                self.session.observe_execution_state(state);
            }
        }

        let route = match msg.parent_id() {
            Some(parent) => {
                let mut registry = self.lock_registry();
                if let Some(tx) = registry.routes.get(parent) {
                    Some(tx.clone())
                } else {
                    match registry.tombstones.get(parent).copied() {
                        Some(expiry) if expiry > Instant::now() => {
                            trace!(
                                "Absorbing late {} for aborted request {}",
                                msg.msg_type(),
                                parent
                            );
                            return;
                        }
                        Some(_) => {
                            registry.tombstones.remove(parent);
                            None
                        }
                        None => None,
                    }
                }
            }
            None => None,
        };

        match route {
            Some(tx) => {
                let _ = tx.send(Arrival {
                    channel,
                    message: msg,
                });
            }
            None if is_status => {}
            None => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Dropping unrouted {} message on {} (parent: {:?})",
                    msg.msg_type(),
                    channel,
                    msg.parent_id()
                );
            }
        }
    }

    fn fail_registrations(&self) {
        let mut registry = self.lock_registry();
        let pending = registry.routes.len();
        registry.routes.clear();
        registry.tombstones.clear();
        if pending > 0 {
            warn!("Failed {} pending registrations", pending);
        }
    }

    /// A channel loop died: close the bridge and fail every pending
    /// registration so waiting callers observe a connection error instead of
    /// hanging.
    fn fatal(&self, channel: ChannelKind, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        error!("{} channel failed: {}; closing bridge", channel, reason);
        self.lock_senders().clear();
        let _ = self.shutdown.send(true);
        self.fail_registrations();
    }
}

async fn send_loop(
    kind: ChannelKind,
    mut sink: Box<dyn FrameSink>,
    inner: Arc<MuxInner>,
    mut outbound: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
) {
    while let Some(frames) = outbound.recv().await {
        if let Err(e) = sink.send(frames).await {
            inner.fatal(kind, &e.to_string());
            break;
        }
    }
    let _ = sink.close().await;
    debug!("{} send loop stopped", kind);
}

async fn recv_loop(
    kind: ChannelKind,
    mut source: Box<dyn FrameSource>,
    inner: Arc<MuxInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("{} receive loop started", kind);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            inbound = source.recv() => match inbound {
                Ok(frames) => inner.dispatch(kind, &frames),
                Err(e) => {
                    inner.fatal(kind, &e.to_string());
                    break;
                }
            },
        }
    }
    debug!("{} receive loop stopped", kind);
}
