use std::sync::Arc;

use crate::error::Result;
use crate::models::{Proxy, ProxyType, RoundRobinOrder};
use crate::store::SharedStore;

/// Round-robin over the available pool with a cursor kept in the shared store
///
/// The cursor is scoped per proxy type (or global when no type is requested),
/// so replicas sharing a store hand out proxies in one sequence.
#[derive(Clone)]
pub struct RoundRobin {
    store: Arc<dyn SharedStore>,
    order: RoundRobinOrder,
}

impl RoundRobin {
    pub fn new(store: Arc<dyn SharedStore>, order: RoundRobinOrder) -> Self {
        Self { store, order }
    }

    /// Pick the next proxy from `pool`, which arrives latency-sorted
    pub async fn next(
        &self,
        mut pool: Vec<Proxy>,
        scope: Option<ProxyType>,
    ) -> Result<Option<Proxy>> {
        if pool.is_empty() {
            return Ok(None);
        }

        if self.order == RoundRobinOrder::Id {
            pool.sort_by_key(|p| p.id);
        }

        let index = self.store.advance_cursor(scope, pool.len()).await?;
        Ok(Some(pool.swap_remove(index % pool.len())))
    }
}
