//! Kernel bridge lifecycle
//!
//! Resolves connection parameters, brings up the channel multiplexer and the
//! execution coordinator, and owns the heartbeat liveness check. `connect`
//! fails fast if the kernel does not answer the initial heartbeat within the
//! configured grace period; sustained heartbeat loss after that only flips
//! the reachability flag, leaving the restart decision to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec::MessageCodec;
use crate::config::BridgeConfig;
use crate::connection::ConnectionInfo;
use crate::execution::{AggregateResult, ExecutionCoordinator};
use crate::mux::{ChannelMultiplexer, ChannelSet};
use crate::session::{SessionState, StatusSnapshot};
use crate::transport::{ChannelKind, ChannelSocket, FrameSink, FrameSource, TcpChannelSocket};
use crate::{Error, Result};

/// A connected kernel bridge.
pub struct KernelBridge {
    mux: ChannelMultiplexer,
    coordinator: ExecutionCoordinator,
    session: Arc<SessionState>,
    config: BridgeConfig,
    hb_shutdown: watch::Sender<bool>,
}

impl KernelBridge {
    /// Connect to the kernel described by `info` over TCP.
    pub async fn connect(info: &ConnectionInfo, config: BridgeConfig) -> Result<Self> {
        info.validate()?;
        let codec = MessageCodec::new(info)?;

        let shell = TcpChannelSocket::connect(&info.addr(ChannelKind::Shell)).await?;
        let control = TcpChannelSocket::connect(&info.addr(ChannelKind::Control)).await?;
        let stdin = TcpChannelSocket::connect(&info.addr(ChannelKind::Stdin)).await?;
        let iopub = TcpChannelSocket::connect(&info.addr(ChannelKind::IoPub)).await?;
        let heartbeat = TcpChannelSocket::connect(&info.addr(ChannelKind::Heartbeat)).await?;

        Self::connect_with(
            codec,
            ChannelSet {
                shell: Box::new(shell),
                control: Box::new(control),
                stdin: Box::new(stdin),
                iopub: Box::new(iopub),
            },
            Box::new(heartbeat),
            config,
        )
        .await
    }

    /// Connect over already-established channel sockets. Used directly by
    /// tests; `connect` delegates here.
    pub async fn connect_with(
        codec: MessageCodec,
        channels: ChannelSet,
        heartbeat: Box<dyn ChannelSocket>,
        config: BridgeConfig,
    ) -> Result<Self> {
        let (mut hb_sink, mut hb_source) = heartbeat.into_split();

        // The kernel may still be starting; probe until the grace period is
        // spent before declaring the connection dead.
        let grace_deadline = Instant::now() + config.heartbeat_grace;
        loop {
            if heartbeat_probe(&mut hb_sink, &mut hb_source, config.heartbeat_timeout).await {
                break;
            }
            if Instant::now() >= grace_deadline {
                return Err(Error::Connection(format!(
                    "kernel did not answer the initial heartbeat within {:?}",
                    config.heartbeat_grace
                )));
            }
            sleep(Duration::from_millis(50)).await;
        }
        debug!("Initial heartbeat acknowledged");

        let session = Arc::new(SessionState::new());
        let mux = ChannelMultiplexer::start(
            codec,
            Arc::clone(&session),
            config.tombstone_retention,
            channels,
        );
        let coordinator = ExecutionCoordinator::new(
            mux.clone(),
            Arc::clone(&session),
            Uuid::new_v4().to_string(),
        );

        let (hb_shutdown, hb_rx) = watch::channel(false);
        tokio::spawn(heartbeat_loop(
            hb_sink,
            hb_source,
            Arc::clone(&session),
            config.clone(),
            hb_rx,
        ));

        info!("Kernel bridge connected");
        Ok(Self {
            mux,
            coordinator,
            session,
            config,
            hb_shutdown,
        })
    }

    /// Execute code, using the configured default timeout when none is
    /// given.
    pub async fn execute_code(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<AggregateResult> {
        let timeout = timeout.unwrap_or(self.config.default_execute_timeout);
        self.coordinator.execute(code, timeout).await
    }

    /// Fire-and-forget interrupt of the current kernel computation.
    pub fn interrupt(&self) -> Result<()> {
        self.coordinator.interrupt()
    }

    /// Protocol-level kernel restart; local counters are reset once the
    /// kernel acknowledges.
    pub async fn restart(&self) -> Result<()> {
        self.coordinator
            .restart(self.config.default_execute_timeout)
            .await
    }

    /// Non-blocking session snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.session.snapshot()
    }

    /// Diagnostic count of dropped messages that matched no registration.
    pub fn unrouted_count(&self) -> u64 {
        self.mux.unrouted_count()
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Stop all channel loops and the heartbeat monitor. Idempotent.
    pub fn close(&self) {
        let _ = self.hb_shutdown.send(true);
        self.mux.close();
    }
}

impl Drop for KernelBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// One echo probe: send a fresh opaque payload and require the identical
/// payload back within `timeout`.
///
/// Echoes of probes that already timed out may still be queued ahead of the
/// live one; those are drained and discarded so a single slow echo cannot
/// desynchronize every probe after it.
async fn heartbeat_probe(
    sink: &mut Box<dyn FrameSink>,
    source: &mut Box<dyn FrameSource>,
    timeout: Duration,
) -> bool {
    let payload = Uuid::new_v4().as_bytes().to_vec();
    if sink.send(vec![payload.clone()]).await.is_err() {
        return false;
    }
    let deadline = Instant::now() + timeout;
    loop {
        match timeout_at(deadline, source.recv()).await {
            Ok(Ok(frames)) => {
                if frames.len() == 1 && frames[0] == payload {
                    return true;
                }
                trace!("Discarding stale heartbeat echo");
            }
            _ => return false,
        }
    }
}

async fn heartbeat_loop(
    mut sink: Box<dyn FrameSink>,
    mut source: Box<dyn FrameSource>,
    session: Arc<SessionState>,
    config: BridgeConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut misses = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        if heartbeat_probe(&mut sink, &mut source, config.heartbeat_timeout).await {
            if misses > 0 {
                info!("Heartbeat recovered after {} missed echoes", misses);
            }
            misses = 0;
            session.set_reachable(true);
        } else {
            misses += 1;
            debug!("Missed heartbeat echo ({}/{})", misses, config.missed_heartbeat_limit);
            if misses >= config.missed_heartbeat_limit && session.is_reachable() {
                warn!(
                    "Kernel unresponsive: {} consecutive heartbeats missed",
                    misses
                );
                session.set_reachable(false);
            }
        }
    }
    let _ = sink.close().await;
    debug!("Heartbeat monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryChannelSocket;

    fn quick_config() -> BridgeConfig {
        BridgeConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(50),
            heartbeat_grace: Duration::from_millis(200),
            missed_heartbeat_limit: 3,
            tombstone_retention: Duration::from_secs(1),
            default_execute_timeout: Duration::from_secs(1),
        }
    }

    fn channel_set() -> (ChannelSet, Vec<InMemoryChannelSocket>) {
        let (shell_b, shell_k) = InMemoryChannelSocket::pair();
        let (control_b, control_k) = InMemoryChannelSocket::pair();
        let (stdin_b, stdin_k) = InMemoryChannelSocket::pair();
        let (iopub_b, iopub_k) = InMemoryChannelSocket::pair();
        (
            ChannelSet {
                shell: Box::new(shell_b),
                control: Box::new(control_b),
                stdin: Box::new(stdin_b),
                iopub: Box::new(iopub_b),
            },
            vec![shell_k, control_k, stdin_k, iopub_k],
        )
    }

    /// Echo every heartbeat payload back, like a healthy kernel.
    fn spawn_echoer(mut socket: InMemoryChannelSocket) {
        tokio::spawn(async move {
            while let Ok(frames) = socket.recv().await {
                if socket.send(frames).await.is_err() {
                    break;
                }
            }
        });
    }

    #[tokio::test]
    async fn connect_fails_fast_without_initial_heartbeat() {
        let (channels, _kernel) = channel_set();
        let (hb_b, _hb_k) = InMemoryChannelSocket::pair();

        let result = KernelBridge::connect_with(
            MessageCodec::from_key(""),
            channels,
            Box::new(hb_b),
            quick_config(),
        )
        .await;

        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn connect_succeeds_with_echoing_heartbeat() {
        let (channels, _kernel) = channel_set();
        let (hb_b, hb_k) = InMemoryChannelSocket::pair();
        spawn_echoer(hb_k);

        let bridge = KernelBridge::connect_with(
            MessageCodec::from_key(""),
            channels,
            Box::new(hb_b),
            quick_config(),
        )
        .await
        .unwrap();

        assert!(bridge.status().reachable);
        bridge.close();
        bridge.close();
        assert!(bridge.is_closed());
    }

    #[tokio::test]
    async fn sustained_heartbeat_loss_flips_reachability() {
        let (channels, _kernel) = channel_set();
        let (hb_b, mut hb_k) = InMemoryChannelSocket::pair();

        // Answer only the initial probe, then go silent.
        tokio::spawn(async move {
            if let Ok(frames) = hb_k.recv().await {
                let _ = hb_k.send(frames).await;
            }
            // Keep the socket open but never echo again.
            loop {
                if hb_k.recv().await.is_err() {
                    break;
                }
            }
        });

        let bridge = KernelBridge::connect_with(
            MessageCodec::from_key(""),
            channels,
            Box::new(hb_b),
            quick_config(),
        )
        .await
        .unwrap();
        assert!(bridge.status().reachable);

        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.status().reachable {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("kernel should be marked unresponsive after three missed echoes");
    }

    #[tokio::test]
    async fn recovers_after_a_single_slow_echo() {
        let (channels, _kernel) = channel_set();
        let (hb_b, mut hb_k) = InMemoryChannelSocket::pair();

        tokio::spawn(async move {
            // Answer the initial connect probe promptly.
            if let Ok(frames) = hb_k.recv().await {
                let _ = hb_k.send(frames).await;
            }
            // Hold one echo past several probe periods, then answer
            // everything promptly again. The held echo arrives stale, ahead
            // of the live ones.
            if let Ok(frames) = hb_k.recv().await {
                sleep(Duration::from_millis(300)).await;
                let _ = hb_k.send(frames).await;
            }
            while let Ok(frames) = hb_k.recv().await {
                if hb_k.send(frames).await.is_err() {
                    break;
                }
            }
        });

        let bridge = KernelBridge::connect_with(
            MessageCodec::from_key(""),
            channels,
            Box::new(hb_b),
            quick_config(),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.status().reachable {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stalled echoes should mark the kernel unresponsive");

        tokio::time::timeout(Duration::from_secs(2), async {
            while !bridge.status().reachable {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("prompt echoes after the stall should restore reachability");
    }
}
