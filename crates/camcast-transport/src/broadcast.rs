//! Single-threaded UDP broadcast loop.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use camcast_buffer::RelayBuffer;
use camcast_capture::CaptureManager;
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::BroadcastConfig;
use crate::error::TransportError;
use crate::protocol::{ControlMessage, MAX_CONTROL_DATAGRAM};
use crate::registry::SubscriptionRegistry;
use crate::stats::BroadcastStats;
use crate::TransportResult;

/// What woke an iteration up.
enum LoopEvent {
    Control(io::Result<(usize, SocketAddr)>),
    Data,
    Tick,
}

/// Serves subscribers from one UDP socket.
///
/// The loop owns the registry and the session flag, so starting and
/// stopping capture is never split from the registry change that caused it.
/// A session runs while at least one subscriber is registered. If the
/// encoder exits on its own the session ends and the next login restarts it.
pub struct BroadcastLoop {
    config: BroadcastConfig,
    socket: UdpSocket,
    buffer: Arc<RelayBuffer>,
    capture: Arc<CaptureManager>,
    registry: SubscriptionRegistry,
    streaming: bool,
    stats: Arc<BroadcastStats>,
    session_started: Option<Instant>,
    last_stats_log: Instant,
}

impl BroadcastLoop {
    /// Bind the socket and create the relay buffer.
    pub async fn bind(config: BroadcastConfig, capture: Arc<CaptureManager>) -> TransportResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        info!(addr = %socket.local_addr()?, "Broadcast socket listening");
        Ok(Self::with_socket(config, socket, capture))
    }

    /// Use an already bound socket.
    pub fn with_socket(
        config: BroadcastConfig,
        socket: UdpSocket,
        capture: Arc<CaptureManager>,
    ) -> Self {
        let buffer = Arc::new(RelayBuffer::with_capacity(config.buffer_capacity));
        Self {
            config,
            socket,
            buffer,
            capture,
            registry: SubscriptionRegistry::new(),
            streaming: false,
            stats: Arc::new(BroadcastStats::new()),
            session_started: None,
            last_stats_log: Instant::now(),
        }
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<RelayBuffer> {
        &self.buffer
    }

    pub fn stats(&self) -> Arc<BroadcastStats> {
        Arc::clone(&self.stats)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_subscribed(&self, addr: &SocketAddr) -> bool {
        self.registry.contains(addr)
    }

    /// Whether a capture session is running.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Run forever.
    pub async fn run(&mut self) -> TransportResult<()> {
        loop {
            self.step().await?;
        }
    }

    /// Run until `shutdown` completes, then stop any active session.
    pub async fn run_until<F>(&mut self, shutdown: F) -> TransportResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break Ok(());
                }
                stepped = self.step() => {
                    if let Err(e) = stepped {
                        break Err(e);
                    }
                }
            }
        };

        self.stop_session("shutdown");
        result
    }

    /// One iteration: wait for a control datagram, buffered data or the
    /// poll interval, handle it, then check the encoder and evict stale
    /// subscribers.
    ///
    /// Cancel-safe: nothing is mutated before the wait completes.
    pub async fn step(&mut self) -> TransportResult<()> {
        let mut control = [0u8; MAX_CONTROL_DATAGRAM];

        let event = tokio::select! {
            received = self.socket.recv_from(&mut control) => LoopEvent::Control(received),
            () = self.buffer.readable() => LoopEvent::Data,
            () = tokio::time::sleep(self.config.poll_interval_time()) => LoopEvent::Tick,
        };

        match event {
            LoopEvent::Control(Ok((len, peer))) => self.handle_control(&control[..len], peer),
            LoopEvent::Control(Err(e)) => handle_recv_error(e)?,
            LoopEvent::Data => self.fan_out(),
            LoopEvent::Tick => {}
        }

        self.supervise_session();
        self.evict_stale(Instant::now());
        self.log_stats();
        Ok(())
    }

    fn handle_control(&mut self, payload: &[u8], peer: SocketAddr) {
        match ControlMessage::parse(payload) {
            Some(ControlMessage::Login) => self.handle_login(peer),
            Some(ControlMessage::Ping) => {
                if self.registry.refresh(peer, Instant::now()) {
                    trace!(peer = %peer, "Keep-alive");
                } else {
                    debug!(peer = %peer, "Ping from unsubscribed peer ignored");
                }
            }
            None => {
                self.stats.record_ignored();
                trace!(peer = %peer, len = payload.len(), "Unrecognized datagram ignored");
            }
        }
    }

    fn handle_login(&mut self, peer: SocketAddr) {
        if !self.streaming {
            if let Err(e) = self.start_session() {
                warn!(peer = %peer, error = %e, "Failed to start capture for subscriber");
                return;
            }
        }

        if self.registry.touch(peer, Instant::now()) {
            self.stats.record_join();
            info!(
                peer = %peer,
                subscribers = self.registry.len(),
                "Subscriber joined"
            );
        } else {
            trace!(peer = %peer, "Repeated login treated as keep-alive");
        }
    }

    #[instrument(name = "start_session", skip(self))]
    fn start_session(&mut self) -> TransportResult<()> {
        self.capture.start_streaming(Arc::clone(&self.buffer))?;
        self.streaming = true;
        self.session_started = Some(Instant::now());
        self.last_stats_log = Instant::now();
        self.stats.record_session();
        info!("Capture session started");
        Ok(())
    }

    /// Halt the producer and discard buffered bytes.
    #[instrument(name = "stop_session", skip(self))]
    fn stop_session(&mut self, reason: &str) {
        if !self.streaming {
            return;
        }

        self.streaming = false;
        self.buffer.stop();

        let uptime = self
            .session_started
            .take()
            .map(|started| started.elapsed().as_secs_f32())
            .unwrap_or_default();
        info!(uptime_secs = uptime, "Capture session stopped");
    }

    /// End a session whose encoder exited without being asked to.
    fn supervise_session(&mut self) {
        if !self.streaming || self.capture.is_streaming() {
            return;
        }

        warn!(
            subscribers = self.registry.len(),
            "Capture ended unexpectedly, waiting for a login to restart"
        );
        self.stop_session("encoder exited");
    }

    /// Drain one bounded chunk and send it to every subscriber.
    fn fan_out(&self) {
        let Some(chunk) = self.buffer.try_read(Some(self.config.read_limit())) else {
            return;
        };
        if self.registry.is_empty() {
            debug!(bytes = chunk.len(), "No subscribers, chunk discarded");
            return;
        }

        for datagram in chunk.chunks(self.config.datagram_limit()) {
            for peer in self.registry.addrs() {
                match self.socket.try_send_to(datagram, peer) {
                    Ok(sent) => self.stats.record_sent(sent),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        self.stats.record_send_failure();
                        trace!(peer = %peer, "Socket not writable, datagram dropped");
                    }
                    Err(e) => {
                        self.stats.record_send_failure();
                        debug!(peer = %peer, error = %e, "Send failed");
                    }
                }
            }
        }
    }

    fn evict_stale(&mut self, now: Instant) {
        let evicted = self
            .registry
            .evict_stale(now, self.config.subscriber_timeout_time());
        if evicted.is_empty() {
            return;
        }

        for peer in &evicted {
            info!(peer = %peer, "Subscriber timed out");
        }
        self.stats.record_evictions(evicted.len());

        if self.registry.is_empty() {
            self.stop_session("no subscribers");
        }
    }

    fn log_stats(&mut self) {
        if !self.streaming || self.last_stats_log.elapsed() < self.config.stats_interval_time() {
            return;
        }

        let stats = self.stats.snapshot();
        let buffer = self.buffer.stats();
        info!(
            subscribers = self.registry.len(),
            datagrams_sent = stats.datagrams_sent,
            bytes_sent = stats.bytes_sent,
            send_failures = stats.send_failures,
            buffered = buffer.buffered,
            dropped = buffer.bytes_dropped,
            "Stream stats"
        );
        self.last_stats_log = Instant::now();
    }
}

/// ICMP errors from earlier sends surface on `recv_from`; they concern a
/// single peer and never end the loop.
fn handle_recv_error(e: io::Error) -> TransportResult<()> {
    match e.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => {
            trace!(error = %e, "Transient receive error");
            Ok(())
        }
        _ => Err(TransportError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camcast_capture::{CaptureConfig, SyntheticCamera, SyntheticConfig, SyntheticProbe};

    use super::*;

    struct Harness {
        lp: BroadcastLoop,
        capture: Arc<CaptureManager>,
        probe: Arc<SyntheticProbe>,
        server: SocketAddr,
    }

    async fn harness(config: BroadcastConfig) -> Harness {
        let probe = SyntheticProbe::new();
        let factory = SyntheticCamera::factory(
            SyntheticConfig {
                chunk_size: 256,
                chunk_interval_ms: 5,
            },
            Arc::clone(&probe),
        );
        let capture = Arc::new(CaptureManager::new(CaptureConfig::default(), factory));

        let config = config.bind("127.0.0.1:0".parse().unwrap());
        let lp = BroadcastLoop::bind(config, Arc::clone(&capture)).await.unwrap();
        let server = lp.local_addr().unwrap();

        Harness {
            lp,
            capture,
            probe,
            server,
        }
    }

    async fn client() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn step_until(lp: &mut BroadcastLoop, mut done: impl FnMut(&BroadcastLoop) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !done(lp) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            lp.step().await.unwrap();
        }
    }

    fn slow_poll() -> BroadcastConfig {
        BroadcastConfig::default().poll_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_first_login_starts_session_and_later_login_does_not_restart() {
        let mut h = harness(slow_poll().subscriber_timeout(Duration::from_millis(300))).await;
        let (a, a_addr) = client().await;
        let (b, b_addr) = client().await;

        a.send_to(b"login", h.server).await.unwrap();
        step_until(&mut h.lp, |lp| lp.is_subscribed(&a_addr)).await;

        assert!(h.lp.is_streaming());
        assert!(h.capture.is_streaming());
        assert_eq!(h.probe.recordings_started(), 1);

        b.send_to(b"login", h.server).await.unwrap();
        step_until(&mut h.lp, |lp| lp.is_subscribed(&b_addr)).await;

        assert_eq!(h.lp.subscriber_count(), 2);
        assert_eq!(h.probe.recordings_started(), 1);

        // No keep-alives: both time out and the session ends.
        step_until(&mut h.lp, |lp| lp.subscriber_count() == 0).await;

        assert!(!h.lp.is_streaming());
        assert!(!h.capture.is_streaming());
        assert_eq!(h.probe.recordings_stopped(), 1);
        assert!(h.lp.buffer().is_empty());
        assert_eq!(h.lp.stats().snapshot().evictions, 2);
    }

    #[tokio::test]
    async fn test_subscribers_receive_stream_bytes() {
        let mut h = harness(slow_poll()).await;
        let (a, a_addr) = client().await;

        a.send_to(b"login", h.server).await.unwrap();
        step_until(&mut h.lp, |lp| lp.is_subscribed(&a_addr)).await;
        let stats = h.lp.stats();
        step_until(&mut h.lp, |_| stats.snapshot().datagrams_sent > 0).await;

        let mut buf = vec![0u8; 65_536];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(from, h.server);
        assert!(len > 0);
        assert_eq!(&buf[..4], &[0x00, 0x00, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn test_large_chunks_split_into_datagrams() {
        let mut h = harness(slow_poll().max_datagram_size(100)).await;
        let (a, a_addr) = client().await;

        a.send_to(b"login", h.server).await.unwrap();
        step_until(&mut h.lp, |lp| lp.is_subscribed(&a_addr)).await;
        let stats = h.lp.stats();
        step_until(&mut h.lp, |_| stats.snapshot().datagrams_sent >= 3).await;

        let mut buf = vec![0u8; 65_536];
        for _ in 0..3 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), a.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(len <= 100);
        }
    }

    #[tokio::test]
    async fn test_send_failure_to_one_subscriber_does_not_affect_others() {
        let mut h = harness(slow_poll()).await;
        let (a, a_addr) = client().await;

        a.send_to(b"login", h.server).await.unwrap();
        step_until(&mut h.lp, |lp| lp.is_subscribed(&a_addr)).await;

        // An IPv6 peer can never be reached from the IPv4 socket.
        let unreachable: SocketAddr = "[::1]:9".parse().unwrap();
        h.lp.registry.touch(unreachable, Instant::now());

        let stats = h.lp.stats();
        step_until(&mut h.lp, |_| {
            let s = stats.snapshot();
            s.datagrams_sent > 0 && s.send_failures > 0
        })
        .await;

        let mut buf = vec![0u8; 65_536];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, h.server);
        assert!(len > 0);
        assert!(h.lp.is_subscribed(&unreachable));
        assert!(h.lp.is_streaming());
    }

    #[tokio::test]
    async fn test_login_restarts_session_after_encoder_exit() {
        let mut h = harness(slow_poll()).await;
        let (a, a_addr) = client().await;
        h.probe.set_chunks_per_recording(1);

        a.send_to(b"login", h.server).await.unwrap();
        step_until(&mut h.lp, |lp| lp.is_subscribed(&a_addr)).await;
        step_until(&mut h.lp, |lp| !lp.is_streaming()).await;

        assert!(!h.capture.is_streaming());
        assert_eq!(h.probe.recordings_started(), 1);
        assert!(h.lp.is_subscribed(&a_addr));

        h.probe.set_chunks_per_recording(0);
        a.send_to(b"login", h.server).await.unwrap();
        let probe = Arc::clone(&h.probe);
        step_until(&mut h.lp, |lp| {
            lp.is_streaming() && probe.recordings_started() == 2
        })
        .await;

        assert!(h.capture.is_streaming());
        assert_eq!(h.lp.subscriber_count(), 1);
        let snapshot = h.lp.stats().snapshot();
        assert_eq!(snapshot.joins, 1);
        assert_eq!(snapshot.sessions, 2);
    }

    #[tokio::test]
    async fn test_ping_keeps_subscription_alive() {
        let mut h = harness(slow_poll().subscriber_timeout(Duration::from_millis(200))).await;
        let (a, a_addr) = client().await;

        a.send_to(b"login", h.server).await.unwrap();
        step_until(&mut h.lp, |lp| lp.is_subscribed(&a_addr)).await;

        let until = Instant::now() + Duration::from_millis(500);
        let mut next_ping = Instant::now();
        while Instant::now() < until {
            if Instant::now() >= next_ping {
                a.send_to(b"ping", h.server).await.unwrap();
                next_ping = Instant::now() + Duration::from_millis(50);
            }
            h.lp.step().await.unwrap();
        }

        assert!(h.lp.is_subscribed(&a_addr));
        assert!(h.lp.is_streaming());
    }

    #[tokio::test]
    async fn test_ping_from_unknown_peer_and_garbage_are_ignored() {
        let mut h = harness(slow_poll()).await;
        let (a, _) = client().await;

        a.send_to(b"ping", h.server).await.unwrap();
        a.send_to(b"hello there", h.server).await.unwrap();
        h.lp.step().await.unwrap();
        h.lp.step().await.unwrap();

        assert_eq!(h.lp.subscriber_count(), 0);
        assert!(!h.lp.is_streaming());
        assert_eq!(h.probe.opened(), 0);
        assert_eq!(h.lp.stats().snapshot().ignored, 1);
    }

    #[tokio::test]
    async fn test_failed_capture_start_does_not_register() {
        let mut h = harness(slow_poll()).await;
        let (a, a_addr) = client().await;
        h.probe.set_fail_open(true);

        a.send_to(b"login", h.server).await.unwrap();
        h.lp.step().await.unwrap();

        assert!(!h.lp.is_subscribed(&a_addr));
        assert!(!h.lp.is_streaming());

        h.probe.set_fail_open(false);
        a.send_to(b"login", h.server).await.unwrap();
        step_until(&mut h.lp, |lp| lp.is_subscribed(&a_addr)).await;
        assert!(h.lp.is_streaming());
    }

    #[tokio::test]
    async fn test_run_until_stops_session() {
        let mut h = harness(slow_poll()).await;
        let (a, _) = client().await;

        a.send_to(b"login", h.server).await.unwrap();
        h.lp
            .run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert!(!h.lp.is_streaming());
        assert!(!h.capture.is_streaming());
        assert_eq!(h.probe.recordings_stopped(), 1);
        assert!(h.lp.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_address() {
        let h = harness(slow_poll()).await;
        let config = BroadcastConfig::default().bind(h.server);

        let result = BroadcastLoop::bind(config, Arc::clone(&h.capture)).await;
        assert!(matches!(result, Err(TransportError::Bind { addr, .. }) if addr == h.server));
    }
}
