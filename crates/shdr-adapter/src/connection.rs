//! ---
//! shdr_section: "03-adapter-server"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Change-tracked store and SHDR broadcast server."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
//! Per-agent connection tasks and the registry of attached agents.
//!
//! Each connection owns a reader task and a writer task. The writer is the
//! only owner of the socket write half; everything else queues line batches
//! through a bounded channel. Dropping a registry slot drops its shutdown
//! sender, which ends both tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use shdr_codec::control::{parse_control, pong_line, ControlLine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::events::{AdapterEvent, ClientId};
use crate::server::Shared;

/// Lines queued for one write; shared between every client of a broadcast.
pub(crate) type Outbound = Arc<Vec<String>>;

pub(crate) struct ClientSlot {
    address: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    _shutdown: watch::Sender<bool>,
}

/// A client removed from the registry because its queue could not take a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejected {
    pub(crate) client_id: ClientId,
    pub(crate) address: SocketAddr,
    pub(crate) message: String,
}

fn describe(err: &TrySendError<Outbound>) -> &'static str {
    match err {
        TrySendError::Full(_) => "client queue full",
        TrySendError::Closed(_) => "client connection closed",
    }
}

fn rejection(client_id: ClientId, address: SocketAddr, err: &TrySendError<Outbound>) -> Rejected {
    Rejected {
        client_id,
        address,
        message: describe(err).to_owned(),
    }
}

#[derive(Default)]
pub(crate) struct ClientRegistry {
    clients: Mutex<IndexMap<ClientId, ClientSlot>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub(crate) fn allocate_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Queue the initial batch and insert the slot under one lock, so no
    /// broadcast can reach the client ahead of its snapshot.
    pub(crate) fn register(
        &self,
        client_id: ClientId,
        slot: ClientSlot,
        initial: impl FnOnce() -> Vec<String>,
    ) -> Result<(), Rejected> {
        let mut clients = self.clients.lock();
        let batch = Arc::new(initial());
        if let Err(err) = slot.outbound.try_send(batch) {
            return Err(rejection(client_id, slot.address, &err));
        }
        clients.insert(client_id, slot);
        Ok(())
    }

    pub(crate) fn remove(&self, client_id: ClientId) -> Option<SocketAddr> {
        self.clients
            .lock()
            .shift_remove(&client_id)
            .map(|slot| slot.address)
    }

    /// Queue `batch` for every client. Clients that cannot take it are removed
    /// and returned; the rest are unaffected.
    pub(crate) fn broadcast(&self, batch: &Outbound) -> Vec<Rejected> {
        let mut rejected = Vec::new();
        self.clients.lock().retain(|client_id, slot| {
            match slot.outbound.try_send(Arc::clone(batch)) {
                Ok(()) => true,
                Err(err) => {
                    rejected.push(rejection(*client_id, slot.address, &err));
                    false
                }
            }
        });
        rejected
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub(crate) fn clear(&self) -> Vec<(ClientId, SocketAddr)> {
        self.clients
            .lock()
            .drain(..)
            .map(|(client_id, slot)| (client_id, slot.address))
            .collect()
    }
}

/// Register an accepted connection, queue its snapshot and spawn its tasks.
pub(crate) fn attach(shared: &Arc<Shared>, stream: TcpStream, address: SocketAddr) {
    let client_id = shared.registry.allocate_id();
    if let Err(err) = stream.set_nodelay(true) {
        debug!(client_id = %client_id, error = %err, "failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.client_queue_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let slot = ClientSlot {
        address,
        outbound: outbound_tx.clone(),
        _shutdown: shutdown_tx,
    };
    if let Err(rejected) = shared
        .registry
        .register(client_id, slot, || shared.replay_lines())
    {
        warn!(
            client_id = %client_id,
            address = %address,
            error = %rejected.message,
            "could not queue snapshot for agent"
        );
        return;
    }

    shared.client_count_changed();
    info!(client_id = %client_id, address = %address, "agent connected");
    shared.emit(AdapterEvent::ClientConnected { client_id, address });

    tokio::spawn(writer_loop(
        Arc::clone(shared),
        client_id,
        write_half,
        outbound_rx,
        shutdown_rx.clone(),
    ));
    tokio::spawn(reader_loop(
        Arc::clone(shared),
        client_id,
        read_half,
        outbound_tx,
        shutdown_rx,
    ));
}

async fn writer_loop(
    shared: Arc<Shared>,
    client_id: ClientId,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let write_timeout = shared.config.write_timeout;
    loop {
        let batch = tokio::select! {
            _ = shutdown.changed() => break,
            batch = outbound.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let mut payload = String::with_capacity(batch.iter().map(|line| line.len() + 1).sum());
        for line in batch.iter() {
            payload.push_str(line);
            payload.push('\n');
        }

        match timeout(write_timeout, write_half.write_all(payload.as_bytes())).await {
            Ok(Ok(())) => {
                trace!(client_id = %client_id, lines = batch.len(), "wrote batch");
                if let Some(metrics) = &shared.metrics {
                    metrics.observe_lines_sent(batch.len());
                }
            }
            Ok(Err(err)) => {
                shared.fail_client(client_id, err.to_string());
                break;
            }
            Err(_) => {
                shared.fail_client(
                    client_id,
                    format!("write timed out after {} ms", write_timeout.as_millis()),
                );
                break;
            }
        }
    }
}

async fn reader_loop(
    shared: Arc<Shared>,
    client_id: ClientId,
    read_half: OwnedReadHalf,
    outbound: mpsc::Sender<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(reason) = handle_agent_line(&shared, client_id, &outbound, &line) {
                        shared.fail_client(client_id, reason);
                        return;
                    }
                }
                Ok(None) => break "connection closed by agent".to_owned(),
                Err(err) => break err.to_string(),
            },
        }
    };
    shared.disconnect(client_id, reason);
}

fn handle_agent_line(
    shared: &Shared,
    client_id: ClientId,
    outbound: &mpsc::Sender<Outbound>,
    line: &str,
) -> Result<(), String> {
    match parse_control(line) {
        Some(ControlLine::Ping) => {
            debug!(client_id = %client_id, "ping received");
            shared.emit(AdapterEvent::PingReceived { client_id });
            let pong = Arc::new(vec![pong_line(shared.config.heartbeat)]);
            outbound
                .try_send(pong)
                .map_err(|err| describe(&err).to_owned())
        }
        _ => {
            debug!(client_id = %client_id, line = %line.trim_end(), "ignoring agent line");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(capacity: usize) -> (ClientSlot, mpsc::Receiver<Outbound>, watch::Receiver<bool>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let slot = ClientSlot {
            address: SocketAddr::from(([127, 0, 0, 1], 9000 + capacity as u16)),
            outbound,
            _shutdown: shutdown,
        };
        (slot, rx, shutdown_rx)
    }

    #[test]
    fn snapshot_is_queued_before_registration() {
        let registry = ClientRegistry::default();
        let (first, mut rx, _shutdown) = slot(4);
        let id = registry.allocate_id();
        registry
            .register(id, first, || vec!["snapshot".to_owned()])
            .expect("register");
        registry.broadcast(&Arc::new(vec!["delta".to_owned()]));

        assert_eq!(rx.try_recv().expect("snapshot")[0], "snapshot");
        assert_eq!(rx.try_recv().expect("delta")[0], "delta");
    }

    #[test]
    fn failing_client_does_not_affect_others() {
        let registry = ClientRegistry::default();
        let (healthy, mut healthy_rx, _h) = slot(4);
        let (broken, broken_rx, _b) = slot(5);
        let healthy_id = registry.allocate_id();
        let broken_id = registry.allocate_id();
        registry.register(healthy_id, healthy, Vec::new).expect("register");
        registry.register(broken_id, broken, Vec::new).expect("register");
        drop(broken_rx);

        let rejected = registry.broadcast(&Arc::new(vec!["avail|AVAILABLE".to_owned()]));
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].client_id, broken_id);
        assert_eq!(rejected[0].message, "client connection closed");
        assert_eq!(registry.len(), 1);

        healthy_rx.try_recv().expect("initial batch");
        assert_eq!(healthy_rx.try_recv().expect("delta")[0], "avail|AVAILABLE");
    }

    #[test]
    fn stalled_client_is_dropped_when_its_queue_fills() {
        let registry = ClientRegistry::default();
        let (stalled, _rx, mut shutdown) = slot(1);
        let id = registry.allocate_id();
        registry.register(id, stalled, Vec::new).expect("register");

        let rejected = registry.broadcast(&Arc::new(vec!["x|1".to_owned()]));
        assert_eq!(rejected[0].message, "client queue full");
        assert_eq!(registry.len(), 0);
        assert!(shutdown.has_changed().is_err());
    }

    #[test]
    fn ids_are_unique() {
        let registry = ClientRegistry::default();
        assert_ne!(registry.allocate_id(), registry.allocate_id());
    }
}
