//! Prometheus metrics for the replica runtime.
//!
//! The crate registers its collectors in a private registry; embedders expose
//! it over whatever surface they already serve (see [`registry`]).

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Opts, Registry};

lazy_static! {
    static ref REGISTRY_INSTANCE: Registry = {
        let registry = Registry::new();
        let _ = registry.register(Box::new(PROPOSALS_TOTAL.clone()));
        let _ = registry.register(Box::new(APPLIED_ENTRIES_TOTAL.clone()));
        let _ = registry.register(Box::new(SNAPSHOTS_TOTAL.clone()));
        let _ = registry.register(Box::new(PEER_SEND_FAILURES_TOTAL.clone()));
        registry
    };

    /// Proposals submitted to the consensus primitive, by kind.
    pub static ref PROPOSALS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("replica_proposals_total", "proposals submitted by kind"),
        &["kind"]
    )
    .unwrap();

    /// Committed entries published to the state machine.
    pub static ref APPLIED_ENTRIES_TOTAL: Counter = Counter::new(
        "replica_applied_entries_total",
        "committed entries applied to the fsm"
    )
    .unwrap();

    /// Snapshot files written.
    pub static ref SNAPSHOTS_TOTAL: Counter = Counter::new(
        "replica_snapshots_total",
        "snapshot files written"
    )
    .unwrap();

    /// Failed message deliveries to remote members.
    pub static ref PEER_SEND_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "replica_peer_send_failures_total",
            "failed message deliveries by member id"
        ),
        &["member"]
    )
    .unwrap();
}

/// Registry holding every collector of this crate.
pub fn registry() -> &'static Registry {
    &REGISTRY_INSTANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_collects() {
        PROPOSALS_TOTAL.with_label_values(&["replicate"]).inc();
        let families = registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "replica_proposals_total"));
    }
}
