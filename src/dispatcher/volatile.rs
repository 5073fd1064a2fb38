//! Reference-counted hand-off of per-generation dispatch state
//!
//! The live [`VolatileItems`] sit behind an `ArcSwap`. Every operation takes
//! a [`VolatileLease`], which bumps the in-flight count. Reconfiguration swaps
//! in new items and drops the count the old items held for being current.
//! Whoever brings the count to zero runs cleanup, once.

use crate::cluster::{LoadBalancer, TopologySnapshot};
use crate::invoker::InvokerFactory;
use arc_swap::ArcSwap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

pub(crate) struct VolatileItems {
    generation: u64,
    topology: Arc<TopologySnapshot>,
    load_balancer: Arc<LoadBalancer>,
    invoker_factory: Arc<InvokerFactory>,
    /// One for being current, plus one per outstanding lease
    inflight: AtomicUsize,
    cleaned: AtomicBool,
}

impl VolatileItems {
    pub(crate) fn new(
        generation: u64,
        topology: Arc<TopologySnapshot>,
        load_balancer: Arc<LoadBalancer>,
        invoker_factory: Arc<InvokerFactory>,
    ) -> Self {
        Self {
            generation,
            topology,
            load_balancer,
            invoker_factory,
            inflight: AtomicUsize::new(1),
            cleaned: AtomicBool::new(false),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn topology(&self) -> &Arc<TopologySnapshot> {
        &self.topology
    }

    pub(crate) fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub(crate) fn invoker_factory(&self) -> &Arc<InvokerFactory> {
        &self.invoker_factory
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// Increment unless the count already reached zero.
    fn try_count_up(&self) -> bool {
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then(|| n + 1)
            })
            .is_ok()
    }

    pub(crate) fn count_down(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        if self
            .cleaned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.invoker_factory.close();
            info!(generation = self.generation, "Retired dispatch generation");
        }
    }
}

/// Keeps one generation of dispatch state alive while an operation uses it.
pub(crate) struct VolatileLease {
    items: Arc<VolatileItems>,
}

impl VolatileLease {
    /// Lease the current items. Retries if they were retired between the
    /// load and the increment.
    pub(crate) fn acquire(current: &ArcSwap<VolatileItems>) -> Self {
        loop {
            let items = current.load_full();
            if items.try_count_up() {
                return Self { items };
            }
        }
    }
}

impl Deref for VolatileLease {
    type Target = VolatileItems;

    fn deref(&self) -> &VolatileItems {
        &self.items
    }
}

impl Drop for VolatileLease {
    fn drop(&mut self) {
        self.items.count_down();
    }
}
