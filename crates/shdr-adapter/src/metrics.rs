//! ---
//! shdr_section: "03-adapter-server"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Change-tracked store and SHDR broadcast server."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus handles for adapter activity.
#[derive(Clone)]
pub struct AdapterMetrics {
    lines_sent: IntCounter,
    clients_connected: IntGauge,
    send_errors: IntCounter,
}

impl AdapterMetrics {
    /// Register adapter metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let lines_sent = IntCounter::with_opts(Opts::new(
            "shdr_adapter_lines_sent_total",
            "SHDR lines written to agent connections",
        ))?;
        let clients_connected = IntGauge::with_opts(Opts::new(
            "shdr_adapter_clients_connected",
            "Agent connections currently attached",
        ))?;
        let send_errors = IntCounter::with_opts(Opts::new(
            "shdr_adapter_send_errors_total",
            "Agent connections dropped after a failed or stalled write",
        ))?;

        registry.register(Box::new(lines_sent.clone()))?;
        registry.register(Box::new(clients_connected.clone()))?;
        registry.register(Box::new(send_errors.clone()))?;

        Ok(Self {
            lines_sent,
            clients_connected,
            send_errors,
        })
    }

    pub(crate) fn observe_lines_sent(&self, count: usize) {
        self.lines_sent.inc_by(count as u64);
    }

    pub(crate) fn set_clients_connected(&self, count: usize) {
        self.clients_connected.set(count as i64);
    }

    pub(crate) fn observe_send_error(&self) {
        self.send_errors.inc();
    }
}
