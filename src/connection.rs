use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::config::ReconnectConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    ClosedRetrying,
    ClosedFinal,
}

/// Published snapshot of the link, for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub warning: Option<String>,
}

/// Lifecycle notifications forwarded to the owner of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    /// Raw inbound payload, never interpreted here.
    Message(String),
    /// `reconnect_in` is `None` once the link has been torn down for good.
    Closed { reconnect_in: Option<Duration> },
    Errored(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub attempt_cap: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base: Duration::from_millis(2000),
            max: Duration::from_millis(30000),
            attempt_cap: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: Option<&ReconnectConfig>) -> Self {
        let defaults = Self::default();
        let Some(config) = config else {
            return defaults;
        };
        ReconnectPolicy {
            base: config
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base),
            max: config
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max),
            attempt_cap: config.attempt_cap.unwrap_or(defaults.attempt_cap),
        }
    }

    /// `min(base * 2^attempts, max)`, with `attempts` clamped to the cap.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempts.min(self.attempt_cap))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Connection bookkeeping with no socket attached: the state transitions,
/// attempt counter and warning text.
#[derive(Debug)]
struct LinkMachine {
    policy: ReconnectPolicy,
    status: LinkStatus,
    teardown: bool,
}

impl LinkMachine {
    fn new(policy: ReconnectPolicy) -> Self {
        LinkMachine {
            policy,
            status: LinkStatus {
                state: ConnectionState::Connecting,
                attempts: 0,
                warning: None,
            },
            teardown: false,
        }
    }

    fn connecting(&mut self) {
        self.status.state = ConnectionState::Connecting;
    }

    fn opened(&mut self) {
        self.status.state = ConnectionState::Open;
        self.status.attempts = 0;
        self.status.warning = None;
    }

    fn errored(&mut self, err: &str) {
        self.status.warning = Some(format!("Connection error ({err}), retrying..."));
    }

    fn request_teardown(&mut self) {
        self.teardown = true;
    }

    /// Returns the delay before the next attempt, or `None` when the link is
    /// finished.
    fn closed(&mut self) -> Option<Duration> {
        if self.teardown {
            self.status.state = ConnectionState::ClosedFinal;
            self.status.warning = None;
            return None;
        }
        self.status.state = ConnectionState::ClosedRetrying;
        self.status.attempts = (self.status.attempts + 1).min(self.policy.attempt_cap);
        self.status.warning = Some("Connection to the device lost, retrying...".to_string());
        Some(self.policy.delay_for(self.status.attempts))
    }
}

/// Owns the real-time channel to one device host and keeps reconnecting
/// until torn down.
pub struct ConnectionManager {
    url: Url,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Owner-side handle to a running [`ConnectionManager`].
pub struct ConnectionHandle {
    writer: watch::Receiver<Option<mpsc::UnboundedSender<String>>>,
    status: watch::Receiver<LinkStatus>,
    teardown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Best-effort send. Returns false unless the channel is open right now;
    /// nothing is queued for a later connection.
    #[allow(dead_code)]
    pub fn send(&self, payload: String) -> bool {
        match self.writer.borrow().as_ref() {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }

    /// Sets the one-way teardown flag and waits for the link to wind down.
    pub async fn shutdown(self) {
        self.teardown.send_replace(true);
        if let Err(err) = self.task.await {
            warn!("Connection task ended abnormally: {err}");
        }
    }
}

fn teardown_requested(rx: &watch::Receiver<bool>) -> bool {
    // A dropped handle can never clear the flag, so it counts as teardown.
    *rx.borrow() || rx.has_changed().is_err()
}

async fn wait_for_teardown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl ConnectionManager {
    pub fn new(
        url: Url,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        ConnectionManager {
            url,
            policy,
            events,
        }
    }

    pub fn spawn(self) -> ConnectionHandle {
        let machine = LinkMachine::new(self.policy);
        let (status_tx, status_rx) = watch::channel(machine.status.clone());
        let (writer_tx, writer_rx) = watch::channel(None);
        let (teardown_tx, teardown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(machine, status_tx, writer_tx, teardown_rx));
        ConnectionHandle {
            writer: writer_rx,
            status: status_rx,
            teardown: teardown_tx,
            task,
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            debug!("Connection event dropped, owner is gone");
        }
    }

    async fn run(
        self,
        mut machine: LinkMachine,
        status: watch::Sender<LinkStatus>,
        writer: watch::Sender<Option<mpsc::UnboundedSender<String>>>,
        mut teardown: watch::Receiver<bool>,
    ) {
        loop {
            machine.connecting();
            status.send_replace(machine.status.clone());
            info!("Connecting to {}", self.url);

            let attempt = tokio::select! {
                res = connect_async(self.url.as_str()) => Some(res),
                _ = wait_for_teardown(&mut teardown) => None,
            };
            match attempt {
                Some(Ok((stream, _))) => {
                    machine.opened();
                    status.send_replace(machine.status.clone());
                    info!("Connected to {}", self.url);
                    self.emit(ConnectionEvent::Opened);

                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    writer.send_replace(Some(out_tx));
                    let result = self.pump(stream, out_rx, &mut teardown).await;
                    writer.send_replace(None);
                    if let Err(err) = result {
                        warn!("Connection to {} failed: {err}", self.url);
                        machine.errored(&err.to_string());
                        self.emit(ConnectionEvent::Errored(err.to_string()));
                    }
                }
                Some(Err(err)) => {
                    warn!("Could not connect to {}: {err}", self.url);
                    machine.errored(&err.to_string());
                    self.emit(ConnectionEvent::Errored(err.to_string()));
                }
                None => {}
            }

            if teardown_requested(&teardown) {
                machine.request_teardown();
            }
            let next = machine.closed();
            status.send_replace(machine.status.clone());
            self.emit(ConnectionEvent::Closed { reconnect_in: next });
            let Some(delay) = next else {
                info!("Connection to {} closed for good", self.url);
                break;
            };
            info!(
                "Reconnecting to {} in {}ms (attempt {})",
                self.url,
                delay.as_millis(),
                machine.status.attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_teardown(&mut teardown) => {
                    machine.request_teardown();
                    machine.closed();
                    status.send_replace(machine.status.clone());
                    self.emit(ConnectionEvent::Closed { reconnect_in: None });
                    break;
                }
            }
        }
    }

    async fn pump(
        &self,
        stream: WsStream,
        mut outbound: mpsc::UnboundedReceiver<String>,
        teardown: &mut watch::Receiver<bool>,
    ) -> Result<(), tungstenite::Error> {
        let (mut sink, mut source) = stream.split();
        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.emit(ConnectionEvent::Message(text)),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.emit(ConnectionEvent::Message(text)),
                        Err(_) => debug!("Dropping binary frame that is not UTF-8"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Server closed the channel: {frame:?}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                },
                Some(payload) = outbound.recv() => sink.send(Message::Text(payload)).await?,
                _ = wait_for_teardown(teardown) => {
                    if let Err(err) = sink.send(Message::Close(None)).await {
                        debug!("Close frame not delivered: {err}");
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            attempt_cap: 5,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    async fn next_non_error(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        loop {
            let event = next_event(rx).await;
            if !matches!(event, ConnectionEvent::Errored(_)) {
                return event;
            }
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (1..=5).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![4000, 8000, 16000, 30000, 30000]);
        assert_eq!(policy.delay_for(40), Duration::from_millis(30000));
    }

    #[test]
    fn test_attempts_capped_and_reset_on_open() {
        let mut machine = LinkMachine::new(ReconnectPolicy::default());
        for _ in 0..10 {
            machine.connecting();
            machine.closed();
        }
        assert_eq!(machine.status.attempts, 5);
        assert_eq!(machine.status.state, ConnectionState::ClosedRetrying);
        assert!(machine.status.warning.is_some());
        machine.opened();
        assert_eq!(machine.status.attempts, 0);
        assert!(machine.status.warning.is_none());
    }

    #[test]
    fn test_close_replaces_error_warning() {
        let mut machine = LinkMachine::new(ReconnectPolicy::default());
        machine.errored("handshake failed");
        assert!(machine.status.warning.as_deref().unwrap().contains("handshake failed"));
        machine.closed();
        assert_eq!(
            machine.status.warning.as_deref(),
            Some("Connection to the device lost, retrying...")
        );
    }

    #[test]
    fn test_teardown_is_final() {
        let mut machine = LinkMachine::new(ReconnectPolicy::default());
        machine.opened();
        machine.request_teardown();
        assert_eq!(machine.closed(), None);
        assert_eq!(machine.status.state, ConnectionState::ClosedFinal);
        assert_eq!(machine.closed(), None);
    }

    #[test]
    fn test_policy_from_config() {
        let config = ReconnectConfig {
            base_delay_ms: Some(500),
            max_delay_ms: None,
            attempt_cap: Some(2),
        };
        let policy = ReconnectPolicy::from_config(Some(&config));
        assert_eq!(policy.base, Duration::from_millis(500));
        assert_eq!(policy.max, Duration::from_millis(30000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_payloads_forwarded_unmodified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::Text("{not json".to_string())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"status","status":"cooldown"}"#.to_string()))
                .await
                .unwrap();
            match ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                other => panic!("unexpected frame {other:?}"),
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let handle = ConnectionManager::new(url, fast_policy(), tx).spawn();

        assert_eq!(next_non_error(&mut rx).await, ConnectionEvent::Opened);
        assert_eq!(
            next_non_error(&mut rx).await,
            ConnectionEvent::Message("{not json".to_string())
        );
        assert_eq!(
            next_non_error(&mut rx).await,
            ConnectionEvent::Message(r#"{"type":"status","status":"cooldown"}"#.to_string())
        );
        assert_eq!(handle.status().state, ConnectionState::Open);
        assert!(handle.send("hello".to_string()));
        assert_eq!(server.await.unwrap(), "hello");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            drop(ws);
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            // Keep the second connection open until the client leaves.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let handle = ConnectionManager::new(url, fast_policy(), tx).spawn();

        assert_eq!(next_non_error(&mut rx).await, ConnectionEvent::Opened);
        assert_eq!(
            next_non_error(&mut rx).await,
            ConnectionEvent::Closed {
                reconnect_in: Some(Duration::from_millis(20))
            }
        );
        assert_eq!(next_non_error(&mut rx).await, ConnectionEvent::Opened);
        let status = handle.status();
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(status.attempts, 0);

        let mut watcher = handle.subscribe();
        handle.shutdown().await;
        assert_eq!(watcher.borrow_and_update().state, ConnectionState::ClosedFinal);
        assert_eq!(
            next_non_error(&mut rx).await,
            ConnectionEvent::Closed { reconnect_in: None }
        );
    }

    #[tokio::test]
    async fn test_send_fails_when_not_open() {
        // Nothing listens on this port once the listener is dropped.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let handle = ConnectionManager::new(url, fast_policy(), tx).spawn();
        assert!(matches!(
            next_non_error(&mut rx).await,
            ConnectionEvent::Closed { reconnect_in: Some(_) }
        ));
        assert!(!handle.send("dropped".to_string()));
        assert_ne!(handle.status().state, ConnectionState::Open);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_handshake_reports_error_then_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Hang up on every client before the upgrade completes.
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let handle = ConnectionManager::new(url, fast_policy(), tx).spawn();

        assert!(matches!(next_event(&mut rx).await, ConnectionEvent::Errored(_)));
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed {
                reconnect_in: Some(Duration::from_millis(20))
            }
        );
        let status = handle.status();
        assert_ne!(status.state, ConnectionState::Open);
        assert!(status.attempts >= 1);
        assert!(status.warning.is_some());
        assert!(!handle.send("dropped".to_string()));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_is_final() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let slow = ReconnectPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
            attempt_cap: 5,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let handle = ConnectionManager::new(url, slow, tx).spawn();

        assert_eq!(
            next_non_error(&mut rx).await,
            ConnectionEvent::Closed {
                reconnect_in: Some(Duration::from_secs(20))
            }
        );
        assert_eq!(handle.status().state, ConnectionState::ClosedRetrying);

        let watcher = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown waited for the backoff to elapse");
        assert_eq!(watcher.borrow().state, ConnectionState::ClosedFinal);
        assert_eq!(
            next_event(&mut rx).await,
            ConnectionEvent::Closed { reconnect_in: None }
        );
    }
}
