//! ---
//! shdr_section: "04-agent-client"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Agent-side SHDR client and line routing."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use shdr_codec::control::PING;
use shdr_codec::{ControlLine, Observation};
use shdr_common::config::AgentConfig;
use shdr_common::time::now_micros;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::device::{observation_kind, DeviceModel};
use crate::heartbeat::HeartbeatState;
use crate::ingest::ObservationSink;
use crate::metrics::ClientMetrics;
use crate::router::{LineRouter, Routed};
use crate::{ClientError, Result};

const EVENT_CAPACITY: usize = 256;

/// Longest line accepted from an adapter; a longer one ends the session.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Lifecycle notifications published by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A connection attempt started.
    Connecting {
        /// `host:port` of the adapter.
        endpoint: String,
    },
    /// The connection is up and the initial PING was sent.
    Connected {
        /// `host:port` of the adapter.
        endpoint: String,
    },
    /// The connection attempt failed.
    ConnectFailed {
        /// `host:port` of the adapter.
        endpoint: String,
        /// Failure description.
        message: String,
    },
    /// A PONG changed the heartbeat period.
    Heartbeat {
        /// New period in milliseconds.
        heartbeat_ms: u64,
    },
    /// The adapter sent a `* name: value` command.
    Command {
        /// Command name.
        name: String,
        /// Command argument.
        value: String,
    },
    /// An established connection ended and its data items were made unavailable.
    Disconnected {
        /// `host:port` of the adapter.
        endpoint: String,
        /// Why the connection ended.
        reason: String,
    },
    /// The client stopped.
    Stopped,
}

enum SessionEnd {
    Shutdown,
    Failed(String),
}

struct Inner {
    config: AgentConfig,
    device: Arc<dyn DeviceModel>,
    sink: Arc<dyn ObservationSink>,
    metrics: Option<ClientMetrics>,
    events: broadcast::Sender<ClientEvent>,
}

/// Reconnecting agent-side SHDR client.
pub struct ShdrClient {
    inner: Inner,
}

impl ShdrClient {
    /// Build a client that routes lines against `device` and reports into `sink`.
    pub fn new(
        config: AgentConfig,
        device: Arc<dyn DeviceModel>,
        sink: Arc<dyn ObservationSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Inner {
                config,
                device,
                sink,
                metrics: None,
                events,
            },
        }
    }

    /// Record line and reconnect counts into `metrics`.
    pub fn with_metrics(mut self, metrics: ClientMetrics) -> Self {
        self.inner.metrics = Some(metrics);
        self
    }

    /// Subscribe to lifecycle events. Subscribe before [`ShdrClient::start`] to
    /// see the first connection.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the connection loop.
    pub fn start(self) -> ClientHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = self.inner.events.clone();
        let inner = Arc::new(self.inner);
        let task = tokio::spawn(run(inner, shutdown_rx));
        ClientHandle {
            shutdown: shutdown_tx,
            events,
            task,
        }
    }
}

/// Handle for a running client.
pub struct ClientHandle {
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<ClientEvent>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Close the connection and stop reconnecting.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await?;
        Ok(())
    }
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn connect(&self, endpoint: &str) -> Result<TcpStream> {
        match timeout(self.config.connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ClientError::Connect {
                endpoint: endpoint.to_owned(),
                source,
            }),
            Err(_) => Err(ClientError::ConnectTimeout {
                endpoint: endpoint.to_owned(),
            }),
        }
    }

    async fn write_line(&self, write: &mut OwnedWriteHalf, line: &str) -> Result<()> {
        let payload = format!("{}\n", line);
        timeout(self.config.write_timeout, write.write_all(payload.as_bytes()))
            .await
            .map_err(|_| ClientError::WriteTimeout)??;
        Ok(())
    }

    async fn session(
        &self,
        stream: TcpStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (read, mut write) = stream.into_split();
        let mut heartbeat = HeartbeatState::new(self.config.heartbeat, Instant::now());
        tokio::select! {
            _ = shutdown.changed() => return SessionEnd::Shutdown,
            written = self.write_line(&mut write, PING) => {
                if let Err(err) = written {
                    return SessionEnd::Failed(err.to_string());
                }
            }
        }
        heartbeat.on_ping_sent(Instant::now());

        let mut router = LineRouter::new(Arc::clone(&self.device));
        let mut reader = BufReader::new(read);
        let mut buffer = Vec::new();

        loop {
            let wait = heartbeat.time_until_ping(Instant::now());
            let remaining = (MAX_LINE_BYTES + 1).saturating_sub(buffer.len()) as u64;
            let mut limited = (&mut reader).take(remaining);
            tokio::select! {
                _ = shutdown.changed() => return SessionEnd::Shutdown,
                read = limited.read_until(b'\n', &mut buffer) => match read {
                    Ok(0) => return SessionEnd::Failed("connection closed by adapter".to_owned()),
                    Ok(_) if buffer.ends_with(b"\n") => {
                        let line = String::from_utf8_lossy(&buffer).into_owned();
                        buffer.clear();
                        self.dispatch(&mut router, &mut heartbeat, &line);
                    }
                    Ok(_) if buffer.len() > MAX_LINE_BYTES => {
                        if let Some(metrics) = &self.metrics {
                            metrics.observe_dropped();
                        }
                        return SessionEnd::Failed(format!(
                            "line exceeds {} bytes without a newline",
                            MAX_LINE_BYTES
                        ));
                    }
                    // Partial line before EOF; the next read reports the close.
                    Ok(_) => {}
                    Err(err) => return SessionEnd::Failed(err.to_string()),
                },
                _ = tokio::time::sleep(wait) => {
                    let now = Instant::now();
                    if heartbeat.should_ping(now) {
                        trace!(heartbeat_ms = heartbeat.heartbeat().as_millis() as u64, "sending ping");
                        if let Err(err) = self.write_line(&mut write, PING).await {
                            return SessionEnd::Failed(err.to_string());
                        }
                        heartbeat.on_ping_sent(now);
                    }
                }
            }
        }
    }

    fn dispatch(&self, router: &mut LineRouter, heartbeat: &mut HeartbeatState, line: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_received();
        }
        match router.route(line, now_micros()) {
            Routed::Control(ControlLine::Pong(period)) => {
                if heartbeat.on_pong(period, Instant::now()) {
                    let heartbeat_ms = heartbeat.heartbeat().as_millis() as u64;
                    debug!(heartbeat_ms, "adapter heartbeat updated");
                    self.emit(ClientEvent::Heartbeat { heartbeat_ms });
                }
            }
            Routed::Control(ControlLine::Command { name, value }) => {
                info!(command = %name, value = %value, "adapter command");
                self.emit(ClientEvent::Command { name, value });
            }
            Routed::Control(other) => {
                debug!(control = ?other, "ignoring control line");
            }
            Routed::Observations(observations) if observations.is_empty() => {}
            Routed::Observations(mut observations) if observations.len() == 1 => {
                if let Some(observation) = observations.pop() {
                    self.sink.add_observation(observation);
                }
            }
            Routed::Observations(observations) => self.sink.add_observations(observations),
            Routed::Asset(asset) => self.sink.add_asset(asset),
            Routed::Pending => {}
            Routed::Dropped(reason) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_dropped();
                }
                debug!(reason = ?reason, line = %line.trim_end(), "dropped line");
            }
        }
    }

    /// Report every data item of the device as unavailable in one batch.
    fn mark_unavailable(&self, timestamp: i64) {
        let observations: Vec<_> = self
            .device
            .data_items()
            .iter()
            .map(|descriptor| {
                Observation::unavailable(descriptor.id.clone(), observation_kind(descriptor))
                    .at(timestamp)
            })
            .collect();
        if !observations.is_empty() {
            self.sink.add_observations(observations);
        }
    }
}

async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let endpoint = inner.config.endpoint();
    let mut attempts: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        if attempts > 0 {
            if let Some(metrics) = &inner.metrics {
                metrics.observe_reconnect();
            }
        }
        attempts += 1;

        inner.emit(ClientEvent::Connecting {
            endpoint: endpoint.clone(),
        });
        let connected = tokio::select! {
            _ = shutdown.changed() => break,
            connected = inner.connect(&endpoint) => connected,
        };
        match connected {
            Ok(stream) => {
                info!(endpoint = %endpoint, device = %inner.device.name(), "connected to adapter");
                inner.emit(ClientEvent::Connected {
                    endpoint: endpoint.clone(),
                });
                let end = inner.session(stream, &mut shutdown).await;
                let reason = match &end {
                    SessionEnd::Shutdown => "client stopped".to_owned(),
                    SessionEnd::Failed(reason) => reason.clone(),
                };
                warn!(endpoint = %endpoint, reason = %reason, "adapter connection closed");
                inner.mark_unavailable(now_micros());
                inner.emit(ClientEvent::Disconnected {
                    endpoint: endpoint.clone(),
                    reason,
                });
                if matches!(end, SessionEnd::Shutdown) {
                    break;
                }
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "adapter connection failed");
                inner.emit(ClientEvent::ConnectFailed {
                    endpoint: endpoint.clone(),
                    message: err.to_string(),
                });
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(inner.config.reconnect_interval) => {}
        }
    }

    inner.emit(ClientEvent::Stopped);
    info!(endpoint = %endpoint, "client stopped");
}
