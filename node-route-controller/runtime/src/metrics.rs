use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    syncs: Family<SyncLabels, Counter>,
    installed_nodes: Gauge,
    requeues: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SyncLabels {
    result: String,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub(crate) enum SyncResult {
    Ok,
    Conflict,
    NotReady,
    Invalid,
    Error,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let syncs = Family::default();
        prom.register(
            "syncs",
            "Count of node route reconciliations by result",
            syncs.clone(),
        );

        let installed_nodes = Gauge::default();
        prom.register(
            "installed_nodes",
            "Number of remote nodes with installed routes",
            installed_nodes.clone(),
        );

        let requeues = Counter::default();
        prom.register(
            "requeues",
            "Count of nodes requeued after a failed reconciliation",
            requeues.clone(),
        );

        Self {
            syncs,
            installed_nodes,
            requeues,
        }
    }

    pub(crate) fn sync(&self, result: SyncResult) {
        self.syncs.get_or_create(&result.into()).inc();
    }

    pub(crate) fn requeued(&self) {
        self.requeues.inc();
    }

    pub(crate) fn set_installed(&self, count: usize) {
        self.installed_nodes.set(count as i64);
    }

    #[cfg(test)]
    pub(crate) fn syncs(&self, result: SyncResult) -> u64 {
        self.syncs.get_or_create(&result.into()).get()
    }

    #[cfg(test)]
    pub(crate) fn installed(&self) -> i64 {
        self.installed_nodes.get()
    }
}

impl From<SyncResult> for SyncLabels {
    fn from(result: SyncResult) -> Self {
        let result = match result {
            SyncResult::Ok => "ok",
            SyncResult::Conflict => "conflict",
            SyncResult::NotReady => "not_ready",
            SyncResult::Invalid => "invalid",
            SyncResult::Error => "error",
        };
        Self {
            result: result.to_string(),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
