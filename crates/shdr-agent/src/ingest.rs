//! ---
//! shdr_section: "04-agent-client"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Agent-side SHDR client and line routing."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use shdr_codec::{Asset, Observation};
use tokio::sync::mpsc;
use tracing::warn;

/// Ingestion surface the client feeds decoded values into.
pub trait ObservationSink: Send + Sync {
    /// One decoded observation.
    fn add_observation(&self, observation: Observation);

    /// Several observations that belong together, such as a batched line.
    fn add_observations(&self, observations: Vec<Observation>) {
        for observation in observations {
            self.add_observation(observation);
        }
    }

    /// One decoded asset.
    fn add_asset(&self, asset: Asset);
}

/// Item delivered by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Observations from one line or one cleanup batch.
    Observations(Vec<Observation>),
    /// An asset document.
    Asset(Asset),
}

/// Sink that forwards everything to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Ingested>,
}

impl ChannelSink {
    /// Create the sink and the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Ingested>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, item: Ingested) {
        if self.tx.send(item).is_err() {
            warn!("observation receiver dropped; discarding ingested item");
        }
    }
}

impl ObservationSink for ChannelSink {
    fn add_observation(&self, observation: Observation) {
        self.forward(Ingested::Observations(vec![observation]));
    }

    fn add_observations(&self, observations: Vec<Observation>) {
        self.forward(Ingested::Observations(observations));
    }

    fn add_asset(&self, asset: Asset) {
        self.forward(Ingested::Asset(asset));
    }
}
