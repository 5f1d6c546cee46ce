//! Ranking functions over the available pool
//!
//! Each function picks from a slice of available proxies and never fails; an
//! empty slice yields `None`. Assignment counts missing from the map are zero.

use std::collections::HashMap;

use crate::models::Proxy;

/// Weight of one assigned identity in the auto score, in milliseconds
pub const AUTO_LOAD_WEIGHT_MS: i64 = 100;

fn assigned(counts: &HashMap<i32, i64>, proxy: &Proxy) -> i64 {
    counts.get(&proxy.id).copied().unwrap_or(0)
}

/// Lowest response time
pub fn fastest(pool: &[Proxy]) -> Option<&Proxy> {
    pool.iter().min_by_key(|p| (p.response_time_ms, p.id))
}

/// Fewest assigned identities, then lowest response time
pub fn least_used<'a>(pool: &'a [Proxy], counts: &HashMap<i32, i64>) -> Option<&'a Proxy> {
    pool.iter()
        .min_by_key(|p| (assigned(counts, p), p.response_time_ms, p.id))
}

/// `assigned * 100 + response_time_ms`, lowest wins
pub fn auto_score(proxy: &Proxy, counts: &HashMap<i32, i64>) -> i64 {
    assigned(counts, proxy) * AUTO_LOAD_WEIGHT_MS + proxy.response_time_ms as i64
}

pub fn auto<'a>(pool: &'a [Proxy], counts: &HashMap<i32, i64>) -> Option<&'a Proxy> {
    pool.iter().min_by_key(|p| (auto_score(p, counts), p.id))
}
