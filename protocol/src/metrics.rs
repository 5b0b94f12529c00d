use crate::{blame::Fault, Phase};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Label for packets dropped during ingestion.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabel {
    /// Why the packet was dropped
    pub reason: String,
}

impl DropLabel {
    pub fn new(reason: &'static str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

/// Label for accusations raised.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FaultLabel {
    /// Fault the accusation claims
    pub fault: String,
}

impl From<Fault> for FaultLabel {
    fn from(fault: Fault) -> Self {
        Self {
            fault: fault.to_string(),
        }
    }
}

/// Label for packets sent or received in a given phase.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabel {
    /// Phase the packet was stamped with
    pub phase: String,
}

impl From<Phase> for PhaseLabel {
    fn from(phase: Phase) -> Self {
        Self {
            phase: phase.to_string(),
        }
    }
}

/// Metrics for a [crate::Machine] and its [crate::Round].
///
/// Clones share the underlying counters.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Number of packets sent by phase
    pub sent: Family<PhaseLabel, Counter>,
    /// Number of packets accepted by phase
    pub received: Family<PhaseLabel, Counter>,
    /// Number of packets dropped by reason
    pub dropped: Family<DropLabel, Counter>,
    /// Number of accusations raised by fault
    pub accusations: Family<FaultLabel, Counter>,
    /// Number of blame rounds entered
    pub blame_rounds: Counter,
    /// Number of attempts started
    pub attempts: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register("sent", "Number of packets sent by phase", metrics.sent.clone());
        registry.register(
            "received",
            "Number of packets accepted by phase",
            metrics.received.clone(),
        );
        registry.register(
            "dropped",
            "Number of packets dropped by reason",
            metrics.dropped.clone(),
        );
        registry.register(
            "accusations",
            "Number of accusations raised by fault",
            metrics.accusations.clone(),
        );
        registry.register(
            "blame_rounds",
            "Number of blame rounds entered",
            metrics.blame_rounds.clone(),
        );
        registry.register(
            "attempts",
            "Number of attempts started",
            metrics.attempts.clone(),
        );
        metrics
    }
}
