//! Market state cache.
//!
//! Holds the last mark price and funding rate read per market so the
//! liquidation scan and status queries do not hit the price endpoint for
//! every lookup. The engine always reads fresh state before validating.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use perpx_core::{MarketId, Price};

use crate::types::MarketState;

#[derive(Debug, Clone, Copy)]
struct CachedState {
    state: MarketState,
    fetched_at: Instant,
}

/// Thread-safe cache for market state.
#[derive(Debug)]
pub struct MarketStateCache {
    states: DashMap<MarketId, CachedState>,
    max_age: Duration,
}

impl MarketStateCache {
    /// Create a cache whose entries expire after `max_age`.
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            states: DashMap::new(),
            max_age,
        }
    }

    pub fn update(&self, market: &MarketId, state: MarketState) {
        self.states.insert(
            market.clone(),
            CachedState {
                state,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Fresh state for `market`, or `None` if missing or older than `max_age`.
    #[must_use]
    pub fn get(&self, market: &MarketId) -> Option<MarketState> {
        self.states
            .get(market)
            .filter(|c| c.fetched_at.elapsed() <= self.max_age)
            .map(|c| c.state)
    }

    #[must_use]
    pub fn get_mark_px(&self, market: &MarketId) -> Option<Price> {
        self.get(market).map(|s| s.price)
    }

    pub fn remove(&self, market: &MarketId) {
        self.states.remove(market);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
