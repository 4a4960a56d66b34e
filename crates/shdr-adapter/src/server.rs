//! ---
//! shdr_section: "03-adapter-server"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Change-tracked store and SHDR broadcast server."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shdr_codec::control::command_line;
use shdr_codec::{
    encode_asset, encode_observations, Asset, DataSetEntry, FaultState, Observation,
    ObservationKind, TableEntry,
};
use shdr_common::config::AdapterConfig;
use shdr_common::time::now_micros;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{self, ClientRegistry, Rejected};
use crate::events::{AdapterEvent, ClientId};
use crate::metrics::AdapterMetrics;
use crate::store::ObservationStore;
use crate::{AdapterError, Result};

/// Protocol revision announced to agents on connect.
pub const SHDR_VERSION: &str = "2";

const EVENT_CAPACITY: usize = 256;
const MIN_TICK_SLEEP: Duration = Duration::from_millis(1);

/// State shared by the façade, the background loops and every connection task.
pub(crate) struct Shared {
    pub(crate) config: AdapterConfig,
    pub(crate) store: ObservationStore,
    pub(crate) registry: ClientRegistry,
    pub(crate) metrics: Option<AdapterMetrics>,
    events: broadcast::Sender<AdapterEvent>,
}

impl Shared {
    pub(crate) fn emit(&self, event: AdapterEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    pub(crate) fn client_count_changed(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_clients_connected(self.registry.len());
        }
    }

    /// Remove a client whose connection ended. Only the first caller reports it.
    pub(crate) fn disconnect(&self, client_id: ClientId, reason: String) {
        if let Some(address) = self.registry.remove(client_id) {
            info!(client_id = %client_id, address = %address, reason = %reason, "agent disconnected");
            self.client_count_changed();
            self.emit(AdapterEvent::ClientDisconnected {
                client_id,
                address,
                reason,
            });
        }
    }

    /// Remove a client after a failed write.
    pub(crate) fn fail_client(&self, client_id: ClientId, message: String) {
        if let Some(address) = self.registry.remove(client_id) {
            self.report_failure(Rejected {
                client_id,
                address,
                message,
            });
        }
    }

    fn report_failure(&self, rejected: Rejected) {
        let Rejected {
            client_id,
            address,
            message,
        } = rejected;
        warn!(client_id = %client_id, address = %address, error = %message, "dropping agent after write failure");
        if let Some(metrics) = &self.metrics {
            metrics.observe_send_error();
        }
        self.client_count_changed();
        self.emit(AdapterEvent::WriteFailed {
            client_id,
            message: message.clone(),
        });
        self.emit(AdapterEvent::ClientDisconnected {
            client_id,
            address,
            reason: message,
        });
    }

    /// Timestamp for a delta line.
    fn delta_timestamp(&self, timestamp: i64, now: i64) -> i64 {
        match (self.config.output_timestamps, timestamp) {
            (false, _) => 0,
            (true, 0) => now,
            (true, timestamp) => timestamp,
        }
    }

    /// Timestamp for a snapshot line: replays always carry the replay time.
    fn replay_timestamp(&self, now: i64) -> i64 {
        if self.config.output_timestamps {
            now
        } else {
            0
        }
    }

    fn greeting(&self) -> Vec<String> {
        let mut lines = vec![
            command_line("shdrVersion", SHDR_VERSION),
            command_line("adapterVersion", env!("CARGO_PKG_VERSION")),
        ];
        lines.extend(
            self.config
                .commands
                .iter()
                .map(|(name, value)| command_line(name, value)),
        );
        lines
    }

    /// Commands followed by the full store, stamped with the current time.
    pub(crate) fn replay_lines(&self) -> Vec<String> {
        let now = self.replay_timestamp(now_micros());
        let snapshot = self.store.snapshot();
        let observations: Vec<_> = snapshot
            .observations
            .into_iter()
            .map(|observation| observation.at(now))
            .collect();

        let mut lines = self.greeting();
        lines.extend(encode_observations(&observations));
        for asset in snapshot.assets {
            lines.extend(encode_asset(&asset.at(now)));
        }
        lines
    }

    /// Encode and queue every pending value. Returns the number of lines queued.
    pub(crate) fn flush(&self) -> usize {
        let now = now_micros();
        let mut lines = Vec::new();

        for kind in ObservationKind::ALL {
            let pending = self.store.pending(kind);
            if pending.is_empty() {
                continue;
            }
            let stamped: Vec<_> = pending
                .iter()
                .map(|observation| {
                    let timestamp = self.delta_timestamp(observation.timestamp, now);
                    observation.clone().at(timestamp)
                })
                .collect();
            lines.extend(encode_observations(&stamped));
            self.store.mark_sent(kind, &pending);
        }

        let assets = self.store.pending_assets();
        for asset in &assets {
            let timestamp = self.delta_timestamp(asset.timestamp, now);
            lines.extend(encode_asset(&asset.clone().at(timestamp)));
        }
        self.store.mark_assets_sent(&assets);

        if lines.is_empty() {
            return 0;
        }
        let count = lines.len();
        for rejected in self.registry.broadcast(&Arc::new(lines)) {
            self.report_failure(rejected);
        }
        count
    }
}

/// Adapter façade: producers add values, agents receive them over TCP.
#[derive(Clone)]
pub struct ShdrAdapter {
    shared: Arc<Shared>,
}

impl ShdrAdapter {
    /// Create an adapter without metrics.
    pub fn new(config: AdapterConfig) -> Self {
        Self::build(config, None)
    }

    /// Create an adapter that records into `metrics`.
    pub fn with_metrics(config: AdapterConfig, metrics: AdapterMetrics) -> Self {
        Self::build(config, Some(metrics))
    }

    fn build(config: AdapterConfig, metrics: Option<AdapterMetrics>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                store: ObservationStore::new(),
                registry: ClientRegistry::default(),
                metrics,
                events,
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &AdapterConfig {
        &self.shared.config
    }

    /// Backing store.
    pub fn store(&self) -> &ObservationStore {
        &self.shared.store
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.shared.events.subscribe()
    }

    /// Number of attached agents.
    pub fn connected_clients(&self) -> usize {
        self.shared.registry.len()
    }

    /// Store an observation of any kind. Returns true when it will be sent.
    pub fn add_observation(&self, observation: Observation) -> bool {
        self.shared.store.upsert(observation)
    }

    /// Store several observations.
    pub fn add_observations(&self, observations: impl IntoIterator<Item = Observation>) {
        for observation in observations {
            self.shared.store.upsert(observation);
        }
    }

    /// Store a SAMPLE or EVENT value.
    pub fn add_data_item(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        self.add_observation(Observation::value(key, value))
    }

    /// Store a condition with one active fault state.
    pub fn add_condition(&self, key: impl Into<String>, state: FaultState) -> bool {
        self.add_observation(Observation::condition(key, state))
    }

    /// Store a data set.
    pub fn add_data_set(&self, key: impl Into<String>, entries: Vec<DataSetEntry>) -> bool {
        self.add_observation(Observation::data_set(key, entries))
    }

    /// Store a table.
    pub fn add_table(&self, key: impl Into<String>, rows: Vec<TableEntry>) -> bool {
        self.add_observation(Observation::table(key, rows))
    }

    /// Store a time series.
    pub fn add_time_series(
        &self,
        key: impl Into<String>,
        sample_rate: Option<f64>,
        samples: Vec<f64>,
    ) -> bool {
        self.add_observation(Observation::time_series(key, sample_rate, samples))
    }

    /// Store an asset document.
    pub fn add_asset(&self, asset: Asset) -> bool {
        self.shared.store.upsert_asset(asset)
    }

    /// Drive every stored observation to UNAVAILABLE on the next tick.
    pub fn set_unavailable(&self) -> usize {
        let changed = self.shared.store.set_unavailable(now_micros());
        info!(changed, "marked all observations unavailable");
        changed
    }

    /// Bind the listener and spawn the accept and broadcast loops.
    pub async fn start(&self) -> Result<AdapterHandle> {
        let requested = self.shared.config.listen;
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| AdapterError::Bind {
                address: requested,
                source,
            })?;
        let address = listener.local_addr()?;
        info!(address = %address, interval_ms = self.shared.config.interval.as_millis() as u64, "adapter listening");
        self.shared.emit(AdapterEvent::Listening { address });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            shutdown_rx.clone(),
        ));
        let broadcast = tokio::spawn(broadcast_loop(Arc::clone(&self.shared), shutdown_rx));

        Ok(AdapterHandle {
            address,
            shutdown: shutdown_tx,
            tasks: vec![accept, broadcast],
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Handle for a running adapter.
pub struct AdapterHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl AdapterHandle {
    /// Bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Number of attached agents.
    pub fn connected_clients(&self) -> usize {
        self.shared.registry.len()
    }

    /// Stop both loops, close the listener and disconnect every agent.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await?;
        }
        for (client_id, address) in self.shared.registry.clear() {
            self.shared.emit(AdapterEvent::ClientDisconnected {
                client_id,
                address,
                reason: "adapter stopped".to_owned(),
            });
        }
        self.shared.client_count_changed();
        self.shared.emit(AdapterEvent::Stopped);
        info!(address = %self.address, "adapter stopped");
        Ok(())
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => connection::attach(&shared, stream, address),
                Err(err) => warn!(error = %err, "failed to accept agent connection"),
            },
        }
    }
    debug!("accept loop exited");
}

async fn broadcast_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let interval = shared.config.interval;
    loop {
        let started = Instant::now();
        let lines = shared.flush();
        if lines > 0 {
            debug!(lines, clients = shared.registry.len(), "broadcast tick");
        }
        let sleep_for = interval
            .saturating_sub(started.elapsed())
            .max(MIN_TICK_SLEEP);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
    debug!("broadcast loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use shdr_codec::ConditionLevel;
    use shdr_common::time::parse_timestamp;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    fn test_config() -> AdapterConfig {
        AdapterConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            interval: Duration::from_millis(10),
            heartbeat: Duration::from_millis(5_000),
            ..AdapterConfig::default()
        }
    }

    async fn read_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> String {
        timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("line before timeout")
            .expect("read line")
            .expect("connection open")
    }

    async fn connect(
        handle: &AdapterHandle,
    ) -> (Lines<BufReader<OwnedReadHalf>>, tokio::net::tcp::OwnedWriteHalf) {
        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let (read, write) = stream.into_split();
        (BufReader::new(read).lines(), write)
    }

    fn strip_timestamp(line: &str) -> &str {
        let (stamp, rest) = line.split_once('|').expect("timestamped line");
        assert!(parse_timestamp(stamp).is_some(), "not a timestamp: {stamp}");
        rest
    }

    #[tokio::test]
    async fn new_agent_receives_commands_then_snapshot() {
        let mut config = test_config();
        config.commands.insert("serialNumber".into(), "1234".into());
        let adapter = ShdrAdapter::new(config);
        adapter.add_data_item("avail", "AVAILABLE");
        adapter.add_condition("system", FaultState::new(ConditionLevel::Normal));
        let handle = adapter.start().await.unwrap();

        let (mut lines, _write) = connect(&handle).await;
        assert_eq!(read_line(&mut lines).await, "* shdrVersion: 2");
        assert!(read_line(&mut lines).await.starts_with("* adapterVersion: "));
        assert_eq!(read_line(&mut lines).await, "* serialNumber: 1234");
        assert_eq!(strip_timestamp(&read_line(&mut lines).await), "avail|AVAILABLE");
        assert_eq!(strip_timestamp(&read_line(&mut lines).await), "system|NORMAL||||");

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn deltas_and_unavailable_reach_connected_agents() {
        let adapter = ShdrAdapter::new(test_config());
        let handle = adapter.start().await.unwrap();
        let (mut lines, _write) = connect(&handle).await;
        read_line(&mut lines).await;
        read_line(&mut lines).await;

        adapter.add_data_item("exec", "ACTIVE");
        assert_eq!(strip_timestamp(&read_line(&mut lines).await), "exec|ACTIVE");

        adapter.set_unavailable();
        assert_eq!(strip_timestamp(&read_line(&mut lines).await), "exec|UNAVAILABLE");

        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn ping_is_answered_with_heartbeat() {
        let adapter = ShdrAdapter::new(test_config());
        let mut events = adapter.subscribe();
        let handle = adapter.start().await.unwrap();
        let (mut lines, mut write) = connect(&handle).await;
        read_line(&mut lines).await;
        read_line(&mut lines).await;

        write.write_all(b"* PING\n").await.unwrap();
        assert_eq!(read_line(&mut lines).await, "* PONG 5000");

        let mut saw_ping = false;
        while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
            if matches!(event, AdapterEvent::PingReceived { .. }) {
                saw_ping = true;
                break;
            }
        }
        assert!(saw_ping);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn timestamps_can_be_left_to_the_reader() {
        let config = AdapterConfig {
            output_timestamps: false,
            ..test_config()
        };
        let adapter = ShdrAdapter::new(config);
        adapter.add_data_item("avail", "AVAILABLE");
        let handle = adapter.start().await.unwrap();
        let (mut lines, _write) = connect(&handle).await;
        read_line(&mut lines).await;
        read_line(&mut lines).await;
        assert_eq!(read_line(&mut lines).await, "avail|AVAILABLE");
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_reported() {
        let adapter = ShdrAdapter::new(test_config());
        let mut events = adapter.subscribe();
        let handle = adapter.start().await.unwrap();

        let (lines, write) = connect(&handle).await;
        drop(lines);
        drop(write);

        let mut reason = None;
        while let Ok(Ok(event)) = timeout(Duration::from_secs(2), events.recv()).await {
            if let AdapterEvent::ClientDisconnected { reason: why, .. } = event {
                reason = Some(why);
                break;
            }
        }
        assert!(reason.is_some());
        assert_eq!(handle.connected_clients(), 0);
        handle.stop().await.unwrap();
    }

    async fn next_event(events: &mut broadcast::Receiver<AdapterEvent>) -> AdapterEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event before timeout")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn stalled_agent_is_dropped_while_others_keep_receiving() {
        let config = AdapterConfig {
            write_timeout: Duration::from_millis(50),
            client_queue_capacity: 2,
            ..test_config()
        };
        let adapter = ShdrAdapter::new(config);
        let mut events = adapter.subscribe();
        let handle = adapter.start().await.unwrap();

        // Connected first and never read from.
        let stalled = TcpStream::connect(handle.local_addr()).await.unwrap();
        let stalled_id = loop {
            if let AdapterEvent::ClientConnected { client_id, .. } = next_event(&mut events).await {
                break client_id;
            }
        };

        let (mut lines, _healthy_write) = connect(&handle).await;
        let (seen_tx, mut seen) = tokio::sync::mpsc::unbounded_channel();
        let drain = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if line.contains("|Xpos|") {
                    let _ = seen_tx.send(line);
                }
            }
        });

        let blob = "x".repeat(256 * 1024);
        let mut failed = false;
        let mut disconnected = None;
        for round in 0..400 {
            adapter.add_data_item("blob", format!("{round}{blob}"));
            tokio::time::sleep(Duration::from_millis(10)).await;
            while let Ok(event) = events.try_recv() {
                match event {
                    AdapterEvent::WriteFailed { client_id, .. } if client_id == stalled_id => {
                        failed = true;
                    }
                    AdapterEvent::ClientDisconnected { client_id, .. } => {
                        disconnected = Some(client_id);
                    }
                    _ => {}
                }
            }
            if failed {
                break;
            }
        }
        assert!(failed, "stalled agent was never dropped");

        while disconnected.is_none() {
            if let AdapterEvent::ClientDisconnected { client_id, .. } = next_event(&mut events).await {
                disconnected = Some(client_id);
            }
        }
        assert_eq!(disconnected, Some(stalled_id));
        assert_eq!(handle.connected_clients(), 1);

        adapter.add_data_item("Xpos", "42");
        let line = timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("healthy agent keeps receiving")
            .expect("drain task running");
        assert!(line.ends_with("|Xpos|42"));

        drop(stalled);
        drain.abort();
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_returned() {
        let first = ShdrAdapter::new(test_config());
        let handle = first.start().await.unwrap();

        let second = ShdrAdapter::new(AdapterConfig {
            listen: handle.local_addr(),
            ..test_config()
        });
        assert!(matches!(
            second.start().await,
            Err(AdapterError::Bind { .. })
        ));
        handle.stop().await.unwrap();
    }

    #[test]
    fn flush_marks_values_sent_without_clients() {
        let adapter = ShdrAdapter::new(test_config());
        adapter.add_data_item("avail", "AVAILABLE");
        adapter.add_asset(Asset::new("T1", "CuttingTool", "<x/>"));
        assert_eq!(adapter.shared.flush(), 2);
        assert_eq!(adapter.shared.flush(), 0);
    }
}
