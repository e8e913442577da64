//! The run-wide proxy pool.
//!
//! The active set and the per-proxy strike counters live behind one async mutex. The
//! set is reloaded wholesale from the proxy table once the refresh TTL has elapsed,
//! lazily from inside [`ProxyPool::acquire`]. Evicted endpoints are remembered for the
//! rest of the run and filtered out of every reload.

use crate::error::CrawlError;
use crate::store::{Mutation, RowStore, ScanFilter};
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Column family of proxy marker rows.
pub const PROXY_FAMILY: &str = "cf";
/// Qualifier of proxy marker rows.
pub const PROXY_QUALIFIER: &str = "0";
/// Upper bound on rows read by one refresh.
const REFRESH_SCAN_LIMIT: usize = 10_000;

/// Address of an outbound relay, e.g. `http://10.0.0.1:8080`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyEndpoint(String);

impl ProxyEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProxyEndpoint {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Result of banning a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionOutcome {
    /// The endpoint was active until this call.
    pub newly_evicted: bool,
    /// No active endpoint is left.
    pub pool_empty: bool,
}

/// Result of recording one failure against a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeOutcome {
    /// Below the threshold; carries the current strike count.
    Counted(u32),
    /// The threshold was reached and the proxy was banned.
    Evicted(EvictionOutcome),
    /// The endpoint is not in the active set (already banned or never loaded).
    Inactive,
}

#[derive(Default)]
struct PoolState {
    /// Active endpoint -> consecutive failures.
    active: HashMap<ProxyEndpoint, u32>,
    evicted: HashSet<ProxyEndpoint>,
    refreshed_at: Option<Instant>,
}

impl PoolState {
    fn ban(&mut self, endpoint: &ProxyEndpoint) -> EvictionOutcome {
        let newly_evicted = self.active.remove(endpoint).is_some();
        self.evicted.insert(endpoint.clone());
        EvictionOutcome {
            newly_evicted,
            pool_empty: self.active.is_empty(),
        }
    }
}

pub struct ProxyPool {
    store: Arc<dyn RowStore>,
    refresh_ttl: Duration,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(store: Arc<dyn RowStore>, refresh_ttl: Duration) -> Self {
        Self {
            store,
            refresh_ttl,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Picks a uniformly random active proxy, reloading the set first when stale.
    ///
    /// Fails fast with [`CrawlError::EmptyProxyPool`] when no endpoint is active.
    pub async fn acquire(&self) -> Result<ProxyEndpoint, CrawlError> {
        let mut state = self.state.lock().await;

        let stale = state
            .refreshed_at
            .map(|at| at.elapsed() >= self.refresh_ttl)
            .unwrap_or(true);
        if stale {
            if let Err(e) = self.reload(&mut state).await {
                warn!("Proxy refresh failed, keeping {} proxies: {}", state.active.len(), e);
                state.refreshed_at = Some(Instant::now());
            }
        }

        state
            .active
            .keys()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(CrawlError::EmptyProxyPool)
    }

    /// Reloads the active set from the store now. Returns the active count.
    pub async fn refresh(&self) -> Result<usize, CrawlError> {
        let mut state = self.state.lock().await;
        self.reload(&mut state).await
    }

    async fn reload(&self, state: &mut PoolState) -> Result<usize, CrawlError> {
        let rows = self
            .store
            .scan(&ScanFilter::all(), REFRESH_SCAN_LIMIT)
            .await?;

        let mut active = HashMap::with_capacity(rows.len());
        for row in rows {
            let endpoint = ProxyEndpoint::new(row.row);
            if state.evicted.contains(&endpoint) {
                continue;
            }
            let strikes = state.active.get(&endpoint).copied().unwrap_or(0);
            active.insert(endpoint, strikes);
        }

        let before = state.active.len();
        state.active = active;
        state.refreshed_at = Some(Instant::now());
        info!(
            "Proxy pool refreshed from '{}': {} -> {} active, {} banned",
            self.store.table(),
            before,
            state.active.len(),
            state.evicted.len()
        );
        Ok(state.active.len())
    }

    /// Bans `endpoint` for the rest of the run and deletes its row from the store.
    pub async fn evict(&self, endpoint: &ProxyEndpoint) -> EvictionOutcome {
        let outcome = self.state.lock().await.ban(endpoint);
        if outcome.newly_evicted {
            warn!("Removed proxy: {}", endpoint);
            self.delete_remote(endpoint).await;
        }
        outcome
    }

    /// Records one failure against `endpoint`, banning it once `threshold` is reached.
    pub async fn strike(&self, endpoint: &ProxyEndpoint, threshold: u32) -> StrikeOutcome {
        let outcome = {
            let mut state = self.state.lock().await;
            let Some(strikes) = state.active.get_mut(endpoint) else {
                return StrikeOutcome::Inactive;
            };
            *strikes += 1;
            let count = *strikes;
            debug!("Proxy {} failed {} time(s)", endpoint, count);
            if count < threshold {
                return StrikeOutcome::Counted(count);
            }
            state.ban(endpoint)
        };

        warn!("Removed proxy after {} failures: {}", threshold, endpoint);
        self.delete_remote(endpoint).await;
        StrikeOutcome::Evicted(outcome)
    }

    async fn delete_remote(&self, endpoint: &ProxyEndpoint) {
        if let Err(e) = self.store.delete(endpoint.as_str()).await {
            warn!(
                "Proxy {} banned in memory but its row could not be deleted: {}",
                endpoint, e
            );
        }
    }

    /// Writes a proxy row so the next refresh picks it up.
    pub async fn publish(&self, endpoint: &ProxyEndpoint) -> Result<(), CrawlError> {
        self.store
            .put(
                endpoint.as_str(),
                vec![Mutation::marker(PROXY_FAMILY, PROXY_QUALIFIER)],
            )
            .await?;
        Ok(())
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn is_active(&self, endpoint: &ProxyEndpoint) -> bool {
        self.state.lock().await.active.contains_key(endpoint)
    }

    pub async fn is_evicted(&self, endpoint: &ProxyEndpoint) -> bool {
        self.state.lock().await.evicted.contains(endpoint)
    }

    pub async fn strikes(&self, endpoint: &ProxyEndpoint) -> Option<u32> {
        self.state.lock().await.active.get(endpoint).copied()
    }
}
