use crate::types::Message;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Inbound {
    pub message: String,
}

impl Inbound {
    pub fn new(message: &Message) -> Self {
        Self {
            message: message.kind().to_string(),
        }
    }
}

#[derive(Default)]
pub struct Metrics {
    pub current_view: Gauge,
    pub low_watermark: Gauge,
    pub last_executed: Gauge,
    pub view_changes: Counter,
    pub state_transfers: Counter,
    pub faults: Counter,
    pub inbound: Family<Inbound, Counter>,
    pub dropped: Family<Inbound, Counter>,
}

impl Metrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register("current_view", "current view", self.current_view.clone());
        registry.register(
            "low_watermark",
            "sequence of the stable checkpoint",
            self.low_watermark.clone(),
        );
        registry.register(
            "last_executed",
            "last executed sequence",
            self.last_executed.clone(),
        );
        registry.register(
            "view_changes",
            "number of view changes started",
            self.view_changes.clone(),
        );
        registry.register(
            "state_transfers",
            "number of state transfers requested",
            self.state_transfers.clone(),
        );
        registry.register(
            "faults",
            "number of faults observed",
            self.faults.clone(),
        );
        registry.register(
            "inbound_messages",
            "number of inbound messages",
            self.inbound.clone(),
        );
        registry.register(
            "dropped_messages",
            "number of inbound messages dropped",
            self.dropped.clone(),
        );
    }
}
