//! The concurrent trickler.
//!
//! One cooperative task per ballot: sleep until the ballot's fire time,
//! submit it, and classify the outcome. Retryable transport failures loop
//! with a jittered backoff and no attempt cap; per-ballot server errors
//! journal and finish the task; a closed voting window aborts the whole
//! group. All suspension points watch the stop signal, so Ctrl-C or a
//! sibling's fatal error interrupts sleeps and in-flight submissions alike.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

use crate::api::{CastBallot, CastVote, CastVoteReply, VoteErrorCode};
use crate::client::RequestError;
use crate::journal::{Journal, JournalError};
use crate::mirror::MirrorCache;
use crate::wallet::WalletError;

/// Inclusive bounds of the retry jitter, in seconds.
const RETRY_JITTER_SECS: (u64, u64) = (3, 17);

/// A vote and the absolute time it will first be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteAlarm {
    /// The signed vote.
    pub vote: CastVote,
    /// When the submission fires.
    pub at: DateTime<Utc>,
    /// Payout address that signs for this ticket; needed when mirror mode
    /// re-signs at fire time.
    pub address: String,
}

/// Errors that end a ballot task or the whole run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrickleError {
    /// The stop signal interrupted a sleep or submission.
    #[error("{at} vote {id} failed: cancelled")]
    Cancelled {
        /// Wall-clock time of the cancellation.
        at: String,
        /// Human-readable ballot number.
        id: usize,
    },

    /// The voting window closed mid-run; siblings are cancelled.
    #[error("vote has ended; forced exit of the vote queue")]
    WindowClosed,

    /// Non-retryable transport failure.
    #[error("unrecoverable error: {0}")]
    Unrecoverable(String),

    /// Journal write failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Mirror-mode re-signing failure.
    #[error("re-sign failed: {0}")]
    Resign(#[from] WalletError),
}

/// Submits single-vote ballots. The production implementation is the HTTPS
/// client; tests script their own.
#[async_trait]
pub trait BallotCaster: Send + Sync {
    /// Submits one ballot and returns its receipt.
    async fn cast(&self, ballot: &CastBallot) -> Result<CastVoteReply, RequestError>;
}

/// Signs a single vote message at fire time, for mirror mode.
#[async_trait]
pub trait VoteSigner: Send + Sync {
    /// Returns the hex-encoded signature for the (re-bitted) vote.
    async fn resign(&self, vote: &CastVote, address: &str) -> Result<String, WalletError>;
}

/// Mirror-mode collaborators.
pub struct MirrorHooks {
    /// Bit decision cache.
    pub cache: Arc<MirrorCache>,
    /// Fire-time signer.
    pub signer: Arc<dyn VoteSigner>,
}

/// Shared run counters. One writer lock guards the results and both
/// counters; progress printing happens under the same lock so lines cannot
/// interleave with the increments they report.
#[derive(Debug, Default)]
pub struct Tally {
    /// Receipts in completion order.
    pub results: Vec<CastVoteReply>,
    /// Successful yes casts.
    pub voted_yes: u64,
    /// Successful no casts.
    pub voted_no: u64,
    expected: usize,
}

impl Tally {
    /// Number of ballots this run set out to cast.
    #[must_use]
    pub const fn expected(&self) -> usize {
        self.expected
    }

    /// Ballots that never produced a receipt (in flight at interruption).
    #[must_use]
    pub fn not_cast(&self) -> usize {
        self.expected.saturating_sub(self.results.len())
    }
}

// Classified server reply, per the terminal-error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    // No error code, or TicketAlreadyVoted (idempotence under replay).
    Success,
    // The server puked; retry later to see if it recovered.
    ServerTransient,
    // Per-ballot terminal: journal the reply and finish cleanly.
    Terminal,
    // Voting period is over; abort the run.
    WindowClosed,
}

fn classify(reply: &CastVoteReply) -> Outcome {
    match reply.error_code {
        None | Some(VoteErrorCode::TicketAlreadyVoted) => Outcome::Success,
        Some(VoteErrorCode::InternalError) => Outcome::ServerTransient,
        Some(VoteErrorCode::VoteStatusInvalid) => Outcome::WindowClosed,
        Some(_) => Outcome::Terminal,
    }
}

pub(crate) fn view_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn retry_jitter() -> Duration {
    Duration::from_secs(OsRng.gen_range(RETRY_JITTER_SECS.0..=RETRY_JITTER_SECS.1))
}

/// The trickler: spawns one task per alarm and waits the group out.
pub struct Trickler {
    caster: Arc<dyn BallotCaster>,
    journal: Journal,
    tally: Arc<RwLock<Tally>>,
    bit_yes: String,
    mirror: Option<Arc<MirrorHooks>>,
    emulate: bool,
    interval_stats: Option<Duration>,
}

impl Trickler {
    /// Creates a trickler writing into `tally`.
    #[must_use]
    pub fn new(
        caster: Arc<dyn BallotCaster>,
        journal: Journal,
        tally: Arc<RwLock<Tally>>,
        bit_yes: &str,
    ) -> Self {
        Self {
            caster,
            journal,
            tally,
            bit_yes: bit_yes.to_string(),
            mirror: None,
            emulate: false,
            interval_stats: None,
        }
    }

    /// Enables mirror mode: bits are chosen and re-signed at fire time.
    #[must_use]
    pub fn with_mirror(mut self, hooks: MirrorHooks) -> Self {
        self.mirror = Some(Arc::new(hooks));
        self
    }

    /// Enables emulation: every ballot fabricates a success reply and the
    /// server is never contacted.
    #[must_use]
    pub const fn with_emulation(mut self, emulate: bool) -> Self {
        self.emulate = emulate;
        self
    }

    /// Prints a progress line at this interval while the run is live.
    #[must_use]
    pub const fn with_interval_stats(mut self, interval: Option<Duration>) -> Self {
        self.interval_stats = interval;
        self
    }

    /// Journals the work queue, spawns one task per alarm, and waits for
    /// the group. The first task error cancels the rest.
    ///
    /// # Errors
    ///
    /// Returns the first task error; partial results stay in the tally.
    pub async fn run(
        &self,
        token: &str,
        alarms: Vec<VoteAlarm>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TrickleError> {
        self.journal.work(token, &alarms)?;

        let total = alarms.len();
        {
            let mut tally = self.tally.write().unwrap_or_else(PoisonError::into_inner);
            tally.expected = total;
            tally.results.reserve(total);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        // Forward the external shutdown signal into the group stop.
        let forwarder = {
            let stop_tx = Arc::clone(&stop_tx);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                let already_signalled = *shutdown.borrow();
                if already_signalled || shutdown.changed().await.is_ok() {
                    let _ = stop_tx.send(true);
                }
            })
        };

        let stats_task = self.interval_stats.map(|interval| {
            let tally = Arc::clone(&self.tally);
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {
                            let tally = tally.read().unwrap_or_else(PoisonError::into_inner);
                            println!(
                                "{} progress {}/{} (yes {} no {})",
                                view_time(Utc::now()),
                                tally.results.len(),
                                tally.expected,
                                tally.voted_yes,
                                tally.voted_no,
                            );
                        }
                        _ = stop.changed() => break,
                    }
                }
            })
        });

        let mut set = JoinSet::new();
        for (id, alarm) in alarms.into_iter().enumerate() {
            let task = VoteTask {
                caster: Arc::clone(&self.caster),
                journal: self.journal.clone(),
                tally: Arc::clone(&self.tally),
                token: token.to_string(),
                bit_yes: self.bit_yes.clone(),
                mirror: self.mirror.clone(),
                emulate: self.emulate,
                stop: stop_rx.clone(),
                total,
            };
            let stop_tx = Arc::clone(&stop_tx);
            set.spawn(async move {
                let result = task.vote_ticket(id, alarm).await;
                if result.is_err() {
                    // First error cancels the peer tasks.
                    let _ = stop_tx.send(true);
                }
                result
            });
        }
        drop(stop_rx);

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    let _ = stop_tx.send(true);
                    if first_err.is_none() {
                        first_err = Some(TrickleError::Unrecoverable(join_err.to_string()));
                    }
                }
            }
        }

        forwarder.abort();
        if let Some(task) = stats_task {
            task.abort();
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// Per-ballot task state; everything shared sits behind an Arc.
struct VoteTask {
    caster: Arc<dyn BallotCaster>,
    journal: Journal,
    tally: Arc<RwLock<Tally>>,
    token: String,
    bit_yes: String,
    mirror: Option<Arc<MirrorHooks>>,
    emulate: bool,
    stop: watch::Receiver<bool>,
    total: usize,
}

impl VoteTask {
    async fn wait_for(&mut self, duration: Duration, id: usize) -> Result<(), TrickleError> {
        if *self.stop.borrow() {
            return Err(TrickleError::Cancelled {
                at: view_time(Utc::now()),
                id,
            });
        }
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            _ = self.stop.changed() => Err(TrickleError::Cancelled {
                at: view_time(Utc::now()),
                id,
            }),
        }
    }

    async fn wait_until(&mut self, at: DateTime<Utc>, id: usize) -> Result<(), TrickleError> {
        // A fire time already in the past submits immediately.
        let diff = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.wait_for(diff, id).await
    }

    fn record_success(&self, id: usize, side: &str, bit: &str, reply: CastVoteReply) {
        let mut tally = self.tally.write().unwrap_or_else(PoisonError::into_inner);
        tally.results.push(reply);
        if bit == self.bit_yes {
            tally.voted_yes += 1;
        } else {
            tally.voted_no += 1;
        }
        // Printed under the lock to keep the progress count consistent with
        // the increment it reports.
        println!(
            "{} finished vote {}({side}) -- total progress {}/{}",
            view_time(Utc::now()),
            id,
            tally.results.len(),
            self.total,
        );
    }

    async fn vote_ticket(mut self, index: usize, mut alarm: VoteAlarm) -> Result<(), TrickleError> {
        let id = index + 1; // make human readable

        if self.emulate {
            let reply = CastVoteReply {
                ticket: alarm.vote.ticket.clone(),
                receipt: "emulated".to_string(),
                error_code: None,
                error_context: String::new(),
            };
            self.journal.success(&self.token, &reply)?;
            let side = if alarm.vote.vote_bit == self.bit_yes { "yes" } else { "no" };
            self.record_success(id, side, &alarm.vote.vote_bit, reply);
            return Ok(());
        }

        self.wait_until(alarm.at, id).await?;

        // Mirror mode picks the bit at fire time. A changed bit invalidates
        // the signature, so the vote is re-signed before submission.
        if let Some(mirror) = self.mirror.clone() {
            let bit = mirror.cache.vote_bit().await;
            if bit != alarm.vote.vote_bit {
                alarm.vote.vote_bit = bit;
                alarm.vote.signature = mirror.signer.resign(&alarm.vote, &alarm.address).await?;
            }
        }

        let side = if alarm.vote.vote_bit == self.bit_yes { "yes" } else { "no" };

        let mut retry = 0u32;
        loop {
            if retry > 0 {
                let jitter = retry_jitter();
                debug!(vote = id, retry, jitter_secs = jitter.as_secs(), "retrying");
                self.wait_for(jitter, id).await?;
            }
            println!(
                "{} voting vote {id}({side}) {}",
                view_time(Utc::now()),
                alarm.vote.ticket,
            );

            let ballot = CastBallot {
                votes: vec![alarm.vote.clone()],
            };
            let reply = match self.caster.cast(&ballot).await {
                Ok(reply) => reply,
                Err(RequestError::Retry(err)) => {
                    println!("Vote rescheduled: {}", alarm.vote.ticket);
                    self.journal.failed_retry(&self.token, &ballot, &err)?;
                    retry += 1;
                    continue;
                }
                Err(err) => return Err(TrickleError::Unrecoverable(err.to_string())),
            };

            match classify(&reply) {
                Outcome::Success => {
                    self.journal.success(&self.token, &reply)?;
                    // The mirror counters only move on confirmed casts; a
                    // ballot that later fails must not skew the decisions
                    // of its siblings.
                    if let Some(mirror) = &self.mirror {
                        mirror.cache.update_vote_bit(&alarm.vote.vote_bit).await;
                    }
                    self.record_success(id, side, &alarm.vote.vote_bit, reply);
                    return Ok(());
                }
                Outcome::ServerTransient => {
                    retry += 1;
                }
                Outcome::Terminal => {
                    self.journal.failed_reply(&self.token, &reply)?;
                    let mut tally = self.tally.write().unwrap_or_else(PoisonError::into_inner);
                    tally.results.push(reply);
                    return Ok(());
                }
                Outcome::WindowClosed => {
                    self.journal.failed_reply(&self.token, &reply)?;
                    return Err(TrickleError::WindowClosed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_with(code: Option<VoteErrorCode>) -> CastVoteReply {
        CastVoteReply {
            ticket: "ab".repeat(32),
            receipt: String::new(),
            error_code: code,
            error_context: String::new(),
        }
    }

    #[test]
    fn classification_matches_error_table() {
        assert_eq!(classify(&reply_with(None)), Outcome::Success);
        assert_eq!(
            classify(&reply_with(Some(VoteErrorCode::TicketAlreadyVoted))),
            Outcome::Success
        );
        assert_eq!(
            classify(&reply_with(Some(VoteErrorCode::InternalError))),
            Outcome::ServerTransient
        );
        assert_eq!(
            classify(&reply_with(Some(VoteErrorCode::VoteStatusInvalid))),
            Outcome::WindowClosed
        );
        for terminal in [
            VoteErrorCode::TokenInvalid,
            VoteErrorCode::RecordNotFound,
            VoteErrorCode::MultipleRecordVotes,
            VoteErrorCode::VoteBitInvalid,
            VoteErrorCode::SignatureInvalid,
            VoteErrorCode::TicketNotEligible,
            VoteErrorCode::Unknown(99),
        ] {
            assert_eq!(classify(&reply_with(Some(terminal))), Outcome::Terminal);
        }
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..200 {
            let jitter = retry_jitter();
            assert!(jitter >= Duration::from_secs(3));
            assert!(jitter <= Duration::from_secs(17));
        }
    }
}
