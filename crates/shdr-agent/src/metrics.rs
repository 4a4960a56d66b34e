//! ---
//! shdr_section: "04-agent-client"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Agent-side SHDR client and line routing."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use prometheus::{IntCounter, Opts, Registry};

/// Prometheus handles for agent-side client activity.
#[derive(Clone)]
pub struct ClientMetrics {
    lines_received: IntCounter,
    lines_dropped: IntCounter,
    reconnects: IntCounter,
}

impl ClientMetrics {
    /// Register client metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let lines_received = IntCounter::with_opts(Opts::new(
            "shdr_agent_lines_received_total",
            "SHDR lines read from the adapter",
        ))?;
        let lines_dropped = IntCounter::with_opts(Opts::new(
            "shdr_agent_lines_dropped_total",
            "SHDR lines discarded as malformed or unknown",
        ))?;
        let reconnects = IntCounter::with_opts(Opts::new(
            "shdr_agent_reconnects_total",
            "Connection attempts after the first",
        ))?;

        registry.register(Box::new(lines_received.clone()))?;
        registry.register(Box::new(lines_dropped.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;

        Ok(Self {
            lines_received,
            lines_dropped,
            reconnects,
        })
    }

    pub(crate) fn observe_received(&self) {
        self.lines_received.inc();
    }

    pub(crate) fn observe_dropped(&self) {
        self.lines_dropped.inc();
    }

    pub(crate) fn observe_reconnect(&self) {
        self.reconnects.inc();
    }
}
