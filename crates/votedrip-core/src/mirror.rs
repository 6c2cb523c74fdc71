//! Mirror-mode vote-bit controller.
//!
//! In mirror mode a ballot's yes/no bit is not fixed at build time; it is
//! chosen just before signing so that our own approval ratio tracks the
//! public one. The cache refreshes its view of the stats at most once per
//! refresh interval and applies our own casts to the local counts
//! immediately, so consecutive decisions see each other without hammering
//! the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::{VOTE_BIT_NO, VOTE_BIT_YES};
use crate::stats::VoteStats;

/// Source of fresh own/public vote stats for one proposal.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Returns `(me, them)` stats for `token`.
    async fn fetch(&self, token: &str) -> Result<(VoteStats, VoteStats), String>;
}

#[derive(Debug, Default)]
struct MirrorState {
    // Zero on construction so the first decision always refreshes.
    last_refresh: Option<DateTime<Utc>>,
    me: VoteStats,
    them: VoteStats,
}

/// Rate-limited snapshot of own and public vote counts.
pub struct MirrorCache {
    token: String,
    refresh: Duration,
    source: Arc<dyn StatsSource>,
    state: Mutex<MirrorState>,
}

impl MirrorCache {
    /// Creates a cache for `token` that refreshes at most every `refresh`.
    #[must_use]
    pub fn new(token: &str, refresh: Duration, source: Arc<dyn StatsSource>) -> Self {
        Self {
            token: token.to_string(),
            refresh,
            source,
            state: Mutex::new(MirrorState::default()),
        }
    }

    /// Yields the next vote bit: NO when our approval ratio is running
    /// ahead of the public's, YES otherwise. A failed refresh keeps the
    /// stale snapshot.
    pub async fn vote_bit(&self) -> String {
        let mut state = self.state.lock().await;

        let stale = match state.last_refresh {
            None => true,
            Some(last) => {
                let age = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
                age > self.refresh
            }
        };
        if stale {
            match self.source.fetch(&self.token).await {
                Ok((me, them)) => {
                    state.me = me;
                    state.them = them;
                    state.last_refresh = Some(Utc::now());
                }
                Err(err) => debug!(token = %self.token, error = %err, "stats refresh failed"),
            }
        }

        debug!(
            me_rate = state.me.rate(),
            them_rate = state.them.rate(),
            "mirror decision"
        );
        if state.me.rate() > state.them.rate() {
            VOTE_BIT_NO.to_string()
        } else {
            VOTE_BIT_YES.to_string()
        }
    }

    /// Applies one of our own casts to the local snapshot: a pending ticket
    /// moves into the side that was just voted.
    pub async fn update_vote_bit(&self, bit: &str) {
        let mut state = self.state.lock().await;
        if bit == VOTE_BIT_YES {
            state.me.yes += 1;
            state.me.yet = state.me.yet.saturating_sub(1);
        } else if bit == VOTE_BIT_NO {
            state.me.no += 1;
            state.me.yet = state.me.yet.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct ScriptedSource {
        snapshots: StdMutex<Vec<(VoteStats, VoteStats)>>,
    }

    #[async_trait]
    impl StatsSource for ScriptedSource {
        async fn fetch(&self, _token: &str) -> Result<(VoteStats, VoteStats), String> {
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.len() > 1 {
                Ok(snapshots.remove(0))
            } else {
                snapshots.first().copied().ok_or_else(|| "empty".to_string())
            }
        }
    }

    fn cache_with(refresh: Duration, snapshots: Vec<(VoteStats, VoteStats)>) -> MirrorCache {
        MirrorCache::new(
            "token",
            refresh,
            Arc::new(ScriptedSource {
                snapshots: StdMutex::new(snapshots),
            }),
        )
    }

    #[tokio::test]
    async fn mirrors_public_ratio() {
        // Public is at 75% approval; we are behind it, so vote YES until we
        // overtake, then NO.
        let me = VoteStats { yes: 0, no: 0, yet: 4 };
        let them = VoteStats { yes: 3, no: 1, yet: 0 };
        let cache = cache_with(Duration::from_secs(3600), vec![(me, them)]);

        let mut bits = Vec::new();
        for _ in 0..4 {
            let bit = cache.vote_bit().await;
            cache.update_vote_bit(&bit).await;
            bits.push(bit);
        }
        // Rates: 0.5 vs 0.75 -> YES; 1.0 -> NO; 0.5 -> YES; 0.67 -> YES.
        assert_eq!(bits, vec!["2", "1", "2", "2"]);
    }

    #[tokio::test]
    async fn refresh_swaps_direction() {
        let ahead = VoteStats { yes: 3, no: 1, yet: 0 };
        let behind = VoteStats { yes: 1, no: 3, yet: 0 };
        let ours = VoteStats { yes: 1, no: 1, yet: 2 };
        // Zero refresh interval: every decision refetches.
        let cache = cache_with(Duration::ZERO, vec![(ours, ahead), (ours, behind)]);

        // them.rate = 0.75 > ours 0.5 -> YES.
        assert_eq!(cache.vote_bit().await, VOTE_BIT_YES);
        // After refresh them.rate = 0.25 < ours 0.5 -> NO.
        assert_eq!(cache.vote_bit().await, VOTE_BIT_NO);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_snapshot() {
        let cache = cache_with(Duration::ZERO, vec![]);
        // No snapshot at all: balanced rates fall through to YES.
        assert_eq!(cache.vote_bit().await, VOTE_BIT_YES);
    }
}
