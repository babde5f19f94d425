use kubert::index::{ClusterRemoved, IndexClusterResource};
use noderoute_controller_k8s_api::ResourceExt;
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps a cluster-scoped index to record how it is updated.
#[derive(Debug)]
pub struct IndexMetrics<T> {
    inner: T,

    index_size: Family<IndexLabels, Gauge>,
    index_applies: Family<IndexLabels, Counter>,
    index_deletes: Family<IndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

pub trait SizedIndex {
    fn size(&self) -> usize;
}

impl<T: SizedIndex> SizedIndex for Arc<RwLock<T>> {
    fn size(&self) -> usize {
        self.read().size()
    }
}

impl SizedIndex for crate::NodeIndex {
    fn size(&self) -> usize {
        self.len()
    }
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl<T> IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex,
{
    fn update_size<R>(&self)
    where
        R: ResourceExt<DynamicType = ()>,
    {
        self.index_size
            .get_or_create(&IndexLabels::of::<R>())
            .set(self.inner.size() as i64);
    }
}

impl<R, T> IndexClusterResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex,
    T: IndexClusterResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        self.index_applies
            .get_or_create(&IndexLabels::of::<R>())
            .inc();
        self.inner.write().apply(resource);
        self.update_size::<R>();
    }

    fn delete(&mut self, name: String) {
        self.index_deletes
            .get_or_create(&IndexLabels::of::<R>())
            .inc();
        self.inner.write().delete(name);
        self.update_size::<R>();
    }

    fn reset(&mut self, resources: Vec<R>, removed: ClusterRemoved) {
        self.index_resets
            .get_or_create(&IndexLabels::of::<R>())
            .inc();
        self.inner.write().reset(resources, removed);
        self.update_size::<R>();
    }
}

// === impl IndexLabels ===

impl IndexLabels {
    fn of<R: ResourceExt<DynamicType = ()>>() -> Self {
        Self {
            kind: R::kind(&()).to_string(),
        }
    }
}
