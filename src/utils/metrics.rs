//! Prometheus metrics mirroring the communicator's telemetry counters.

use crate::comm::Communicator;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};

/// Gauges for one communicator's counters. Call
/// [`CommMetrics::observe`] between steps to refresh them.
pub struct CommMetrics {
    pub registry: Registry,
    pub bytes_sent: IntGauge,
    pub bytes_received: IntGauge,
    pub model_barriers: IntGauge,
    pub intermodel_barriers: IntGauge,
    pub global_barriers: IntGauge,
}

impl CommMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let bytes_sent = IntGauge::with_opts(Opts::new(
            "comm_bytes_sent",
            "Bytes handed to the transport by this rank",
        ))?;
        let bytes_received = IntGauge::with_opts(Opts::new(
            "comm_bytes_received",
            "Bytes received from the transport by this rank",
        ))?;
        let model_barriers = IntGauge::with_opts(Opts::new(
            "comm_model_barriers",
            "Barriers over the model communicator",
        ))?;
        let intermodel_barriers = IntGauge::with_opts(Opts::new(
            "comm_intermodel_barriers",
            "Barriers over the inter-model communicator",
        ))?;
        let global_barriers = IntGauge::with_opts(Opts::new(
            "comm_global_barriers",
            "Barriers over the world",
        ))?;

        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(model_barriers.clone()))?;
        registry.register(Box::new(intermodel_barriers.clone()))?;
        registry.register(Box::new(global_barriers.clone()))?;

        Ok(Self {
            registry,
            bytes_sent,
            bytes_received,
            model_barriers,
            intermodel_barriers,
            global_barriers,
        })
    }

    /// Copy the communicator's counters into the gauges.
    pub fn observe(&self, comm: &Communicator) {
        self.bytes_sent.set(comm.bytes_sent() as i64);
        self.bytes_received.set(comm.bytes_received() as i64);
        self.model_barriers.set(comm.num_model_barriers() as i64);
        self.intermodel_barriers
            .set(comm.num_intermodel_barriers() as i64);
        self.global_barriers.set(comm.num_global_barriers() as i64);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut out)
            .expect("text encoding never fails for gauges");
        String::from_utf8(out).expect("prometheus text output is utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_register_and_render() {
        let metrics = CommMetrics::new().unwrap();
        metrics.bytes_sent.set(128);
        let text = metrics.render();
        assert!(text.contains("comm_bytes_sent 128"));
        assert!(text.contains("comm_global_barriers 0"));
    }
}
