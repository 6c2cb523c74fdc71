//! The long-lived voting runtime.
//!
//! A [`Voter`] owns everything one run needs: configuration, the HTTPS
//! client, the wallet handle, the journal, and the shared tally. The
//! command surface (vote, inventory, tally, stats, verify) hangs off it and
//! borrows those pieces; nothing global.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::api::{
    CastBallot, CastVoteReply, DetailsReply, Summary, VOTE_BIT_NO, VOTE_BIT_YES, VOTE_ID_NO,
    VOTE_ID_YES, VoteErrorCode, VoteStatus,
};
use crate::ballot::{self, BallotError, BallotPlan};
use crate::chain::{self, ChainError, Network, TicketHash};
use crate::chart;
use crate::client::{RequestError, ServerClient};
use crate::config::{Config, ConfigError};
use crate::distribution::{DistributionError, Scheduler, Strategy};
use crate::eligibility::{self, EligibilityError, Partition};
use crate::journal::{Journal, JournalError};
use crate::mirror::{MirrorCache, StatsSource};
use crate::stats::{self, VoteStats, VotesInfoGroup};
use crate::trickle::{
    BallotCaster, MirrorHooks, Tally, TrickleError, Trickler, VoteAlarm, VoteSigner, view_time,
};
use crate::verify;
use crate::wallet::{SignRequest, TicketAddress, Wallet, WalletError};

/// How often mirror mode refetches the public stats.
const MIRROR_REFRESH: Duration = Duration::from_secs(300);
/// Floor for an auto-computed vote duration.
const MIN_AUTO_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from the voting commands.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VoteError {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Server request failure.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Wallet RPC failure.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// Eligibility resolution failure.
    #[error(transparent)]
    Eligibility(#[from] EligibilityError),

    /// Ballot construction failure.
    #[error(transparent)]
    Ballot(#[from] BallotError),

    /// Fire-time generation failure.
    #[error(transparent)]
    Distribution(#[from] DistributionError),

    /// Trickler failure.
    #[error(transparent)]
    Trickle(#[from] TrickleError),

    /// Journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Chain parsing failure.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Argument or state validation failure, reported before any task
    /// spawns.
    #[error("{0}")]
    Validation(String),
}

fn invalid(message: impl Into<String>) -> VoteError {
    VoteError::Validation(message.into())
}

/// How the vote quotas are chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoteMode {
    /// Cast exactly this many yes and no votes.
    Number {
        /// Yes votes.
        yes: u64,
        /// No votes.
        no: u64,
    },
    /// Cast these fractions of the owned total.
    Percent {
        /// Yes fraction in `[0, 1]`.
        yes: f64,
        /// No fraction in `[0, 1]`.
        no: f64,
    },
    /// Track the public approval ratio, choosing bits at fire time.
    Mirror,
}

impl VoteMode {
    /// Whether this is mirror mode.
    #[must_use]
    pub const fn is_mirror(&self) -> bool {
        matches!(self, Self::Mirror)
    }
}

#[derive(Debug, Clone, Copy)]
struct ScheduleWindow {
    start: DateTime<Utc>,
    duration: Duration,
}

/// The client runtime: one per invocation.
pub struct Voter {
    cfg: Config,
    network: Network,
    run: DateTime<Utc>,
    client: Arc<ServerClient>,
    wallet: Arc<dyn Wallet>,
    journal: Journal,
    tally: Arc<RwLock<Tally>>,
    passphrase: Option<SecretString>,
    shutdown: watch::Receiver<bool>,
}

impl Voter {
    /// Builds the runtime. Fails fast on configuration problems.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError::Config`] or [`VoteError::Request`] when the
    /// configuration is invalid or the HTTP client cannot be built.
    pub fn new(
        cfg: Config,
        wallet: Arc<dyn Wallet>,
        passphrase: Option<SecretString>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, VoteError> {
        cfg.validate()?;
        let network = cfg.network()?;
        let run = Utc::now();
        let client = Arc::new(ServerClient::new(&cfg)?);
        let journal = Journal::new(&cfg.vote_dir, run);
        Ok(Self {
            cfg,
            network,
            run,
            client,
            wallet,
            journal,
            tally: Arc::new(RwLock::new(Tally::default())),
            passphrase,
            shutdown,
        })
    }

    /// The instant this run started; journal filenames carry it.
    #[must_use]
    pub const fn run_started(&self) -> DateTime<Utc> {
        self.run
    }

    fn passphrase(&self) -> Result<&[u8], VoteError> {
        self.passphrase
            .as_ref()
            .map(|p| p.expose_secret().as_bytes())
            .ok_or_else(|| invalid("wallet passphrase required"))
    }

    fn option_bits(details: &DetailsReply) -> Result<(String, String), VoteError> {
        let mut bit_yes = None;
        let mut bit_no = None;
        for option in &details.vote.params.options {
            if option.id == VOTE_ID_YES {
                bit_yes = Some(format!("{:x}", option.bit));
            }
            if option.id == VOTE_ID_NO {
                bit_no = Some(format!("{:x}", option.bit));
            }
        }
        match (bit_yes, bit_no) {
            (Some(yes), Some(no)) => Ok((yes, no)),
            _ => Err(invalid("proposal does not offer yes/no options")),
        }
    }

    // Committed tickets for the proposal's eligible set, failing when the
    // wallet holds none of them.
    async fn committed_for(&self, details: &DetailsReply) -> Result<Vec<TicketAddress>, VoteError> {
        let tickets = chain::convert_ticket_hashes(&details.vote.eligible_tickets)
            .map_err(|e| invalid(format!("ticket pool corrupt: {e}")))?;
        let committed = self.wallet.committed_tickets(&tickets).await?;
        Ok(committed)
    }

    async fn total_votes(&self, token: &str) -> Result<(VoteStats, VoteStats), VoteError> {
        self.wallet.verify_passphrase(0, self.passphrase()?).await?;
        let details = self.client.details(token).await?;
        let committed = self.committed_for(&details).await?;
        if committed.is_empty() {
            return Err(invalid("no eligible tickets found"));
        }
        let results = self.client.results(token).await?;
        let (me, them) =
            eligibility::stats_votes(self.wallet.as_ref(), &self.network, &results, &committed)
                .await?;
        Ok((me, them))
    }

    /// Casts votes on `token` according to `mode`, trickling them over the
    /// configured window. Mirror mode keeps going, window after window,
    /// until shut down.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError`] for validation problems before tasks spawn and
    /// for the first task failure afterwards.
    pub async fn vote(&self, token: &str, mode: VoteMode) -> Result<(), VoteError> {
        if self.cfg.emulate_vote == 0 {
            match self.client.proposal_names(&[token.to_string()]).await {
                Ok(names) => {
                    if let Some(name) = names.get(token) {
                        println!("Voting on      : {name}");
                    }
                }
                Err(err) => debug!(error = %err, "name lookup failed"),
            }
        }

        let result = self.vote_cycle(token, mode).await;
        self.report();
        result
    }

    async fn vote_cycle(&self, token: &str, mode: VoteMode) -> Result<(), VoteError> {
        loop {
            self.vote_once(token, mode).await?;
            if !mode.is_mirror() {
                return Ok(());
            }
            // Mirror mode re-evaluates once the window has elapsed.
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                () = tokio::time::sleep(self.cfg.vote_duration) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn vote_once(&self, token: &str, mode: VoteMode) -> Result<(), VoteError> {
        if self.cfg.emulate_vote > 0 {
            let (qty_yes, qty_no) = self.emulated_quotas(mode)?;
            return self.process_emulated(token, qty_yes, qty_no).await;
        }

        let summary = self.client.summary(token).await?;
        let best_block = self.wallet.best_block().await?;
        if summary.end_block_height <= best_block {
            return Err(invalid(format!(
                "vote has ended: end height {} <= best block {best_block}",
                summary.end_block_height,
            )));
        }

        let (qty_yes, qty_no, voted, total) = self.resolve_quotas(token, mode).await?;
        if voted == total {
            return Err(invalid("you voted all your tickets"));
        }
        if qty_yes == 0 && qty_no == 0 && !mode.is_mirror() {
            return Err(invalid("request vote yes and no = 0"));
        }

        self.process_vote(token, qty_yes, qty_no, mode.is_mirror(), &summary)
            .await
    }

    fn emulated_quotas(&self, mode: VoteMode) -> Result<(usize, usize), VoteError> {
        let total = self.cfg.emulate_vote as usize;
        if self.cfg.vote_duration.is_zero() {
            return Err(invalid("emulation requires an explicit vote duration"));
        }
        match mode {
            VoteMode::Mirror => Err(invalid("mirror mode does not work with emulation")),
            VoteMode::Number { yes, no } => {
                let (yes, no) = (yes as usize, no as usize);
                if yes + no > total {
                    return Err(invalid(format!(
                        "entered amount is greater than the emulated total: {total}"
                    )));
                }
                Ok((yes, no))
            }
            VoteMode::Percent { yes, no } => Ok((
                (total as f64 * yes).round() as usize,
                (total as f64 * no).round() as usize,
            )),
        }
    }

    // Turns the mode into outstanding yes/no quotas, netting out what
    // earlier sessions already cast.
    async fn resolve_quotas(
        &self,
        token: &str,
        mode: VoteMode,
    ) -> Result<(usize, usize, u64, u64), VoteError> {
        let (me, them) = self.total_votes(token).await?;
        let total = me.total();

        let (want_yes, want_no) = match mode {
            VoteMode::Mirror => {
                if self.cfg.vote_duration.is_zero() {
                    return Err(invalid("mirror mode requires voteduration to be set"));
                }
                let rate_yes = if them.total() == 0 {
                    0.5
                } else {
                    them.yes as f64 / them.total() as f64
                };
                let rate_no = if them.total() == 0 {
                    0.5
                } else {
                    them.no as f64 / them.total() as f64
                };
                (
                    (total as f64 * rate_yes).round() as u64,
                    (total as f64 * rate_no).round() as u64,
                )
            }
            VoteMode::Number { yes, no } => {
                if yes + no > total {
                    return Err(invalid(format!(
                        "entered amount is greater than your total own votes: {total}"
                    )));
                }
                (yes, no)
            }
            VoteMode::Percent { yes, no } => (
                (total as f64 * yes).round() as u64,
                (total as f64 * no).round() as u64,
            ),
        };
        // Rounding both sides can overshoot the pool by one; trim yes.
        let want_yes = want_yes.min(total.saturating_sub(want_no));

        let (voted_yes, voted_no) = (me.yes, me.no);
        if !mode.is_mirror() {
            if want_yes < voted_yes {
                return Err(invalid(format!(
                    "resume: require {want_yes} yes but {voted_yes} voted in a previous session"
                )));
            }
            if want_no < voted_no {
                return Err(invalid(format!(
                    "resume: require {want_no} no but {voted_no} voted in a previous session"
                )));
            }
        }
        let qty_yes = want_yes.saturating_sub(voted_yes) as usize;
        let qty_no = want_no.saturating_sub(voted_no) as usize;
        Ok((qty_yes, qty_no, voted_yes + voted_no, total))
    }

    async fn process_vote(
        &self,
        token: &str,
        qty_yes: usize,
        qty_no: usize,
        mirror: bool,
        summary: &Summary,
    ) -> Result<(), VoteError> {
        if summary.status != VoteStatus::Started {
            return Err(invalid(format!(
                "proposal vote is not active: {}",
                summary.status
            )));
        }

        self.client.version().await?;
        let details = self.client.details(token).await?;
        let (bit_yes, bit_no) = Self::option_bits(&details)?;

        let committed = self.committed_for(&details).await?;
        if committed.is_empty() {
            return Err(invalid("no eligible tickets found"));
        }

        let results = self.client.results(token).await?;
        let mut partition: Partition =
            eligibility::eligible_votes(self.wallet.as_ref(), &self.network, &results, &committed)
                .await?;
        if partition.eligible.is_empty() {
            return Err(invalid("no eligible tickets found"));
        }
        eligibility::shuffle_eligible(&mut partition.eligible);

        let mut plan =
            ballot::build_votes(token, &partition.eligible, qty_yes, qty_no, &bit_yes, &bit_no)?;
        ballot::sign_votes(self.wallet.as_ref(), self.passphrase()?, &mut plan).await?;

        let window = self.schedule_window(summary)?;
        let alarms = self.build_alarms(plan, window, &bit_yes)?;

        let mut trickler = Trickler::new(
            Arc::clone(&self.client) as Arc<dyn BallotCaster>,
            self.journal.clone(),
            Arc::clone(&self.tally),
            &bit_yes,
        )
        .with_interval_stats(
            (self.cfg.interval_stats_minutes > 0)
                .then(|| Duration::from_secs(self.cfg.interval_stats_minutes * 60)),
        );

        if mirror {
            let source = Arc::new(VoterStatsSource {
                client: Arc::clone(&self.client),
                wallet: Arc::clone(&self.wallet),
                network: self.network,
            });
            let signer = Arc::new(WalletResigner {
                wallet: Arc::clone(&self.wallet),
                passphrase: self
                    .passphrase
                    .clone()
                    .ok_or_else(|| invalid("wallet passphrase required"))?,
            });
            trickler = trickler.with_mirror(MirrorHooks {
                cache: Arc::new(MirrorCache::new(token, MIRROR_REFRESH, source)),
                signer,
            });
        }

        trickler
            .run(token, alarms, self.shutdown.clone())
            .await
            .map_err(VoteError::from)
    }

    async fn process_emulated(
        &self,
        token: &str,
        qty_yes: usize,
        qty_no: usize,
    ) -> Result<(), VoteError> {
        let total = self.cfg.emulate_vote as usize;
        let eligible: Vec<TicketAddress> = (0..total)
            .map(|i| {
                let mut raw = [0u8; 32];
                raw[..8].copy_from_slice(&(i as u64).to_le_bytes());
                TicketAddress {
                    ticket: TicketHash::from(raw),
                    address: String::new(),
                }
            })
            .collect();

        let plan = ballot::build_votes(
            token,
            &eligible,
            qty_yes,
            qty_no,
            VOTE_BIT_YES,
            VOTE_BIT_NO,
        )?;
        let window = ScheduleWindow {
            start: Utc::now(),
            duration: self.cfg.vote_duration,
        };
        let alarms = self.build_alarms(plan, window, VOTE_BIT_YES)?;

        let trickler = Trickler::new(
            Arc::clone(&self.client) as Arc<dyn BallotCaster>,
            self.journal.clone(),
            Arc::clone(&self.tally),
            VOTE_BIT_YES,
        )
        .with_emulation(true);
        trickler
            .run(token, alarms, self.shutdown.clone())
            .await
            .map_err(VoteError::from)
    }

    // The trickle window: explicit duration when configured (bounded by the
    // remaining vote time), otherwise the remaining time minus the safety
    // margin, which must come out to at least a day.
    fn schedule_window(&self, summary: &Summary) -> Result<ScheduleWindow, VoteError> {
        let blocks_left = u64::from(summary.end_block_height.saturating_sub(summary.best_block));
        let blocks_passed = u64::from(summary.best_block.saturating_sub(summary.start_block_height));
        let time_left = self.network.blocks_duration(blocks_left);
        let time_passed = self.network.blocks_duration(blocks_passed);

        let mut start = Utc::now();
        if self.cfg.resume {
            start = start - TimeDelta::from_std(time_passed).unwrap_or_else(|_| TimeDelta::zero());
        }

        let duration = if self.cfg.vote_duration.is_zero() {
            let mut duration = time_left.saturating_sub(self.cfg.hours_prior);
            if self.cfg.resume {
                duration = (time_left + time_passed).saturating_sub(self.cfg.hours_prior);
            }
            if duration < MIN_AUTO_DURATION {
                return Err(invalid(format!(
                    "only {} left in the vote; set voteduration explicitly when the remaining \
                     time is this low, e.g. --voteduration=6h",
                    humantime::format_duration(time_left),
                )));
            }
            duration
        } else {
            if self.cfg.vote_duration > time_left {
                return Err(invalid(format!(
                    "the requested voteduration {} exceeds the remaining vote time {}",
                    humantime::format_duration(self.cfg.vote_duration),
                    humantime::format_duration(time_left),
                )));
            }
            self.cfg.vote_duration
        };

        Ok(ScheduleWindow { start, duration })
    }

    fn build_alarms(
        &self,
        plan: BallotPlan,
        window: ScheduleWindow,
        bit_yes: &str,
    ) -> Result<Vec<VoteAlarm>, VoteError> {
        println!("Total number of votes  : {}", plan.all.len());
        println!("Start time             : {}", view_time(window.start));
        println!(
            "Vote duration          : {}",
            humantime::format_duration(window.duration)
        );

        let start = window.start;
        let end = start + TimeDelta::from_std(window.duration).unwrap_or_else(|_| TimeDelta::zero());

        let mut alarms: Vec<VoteAlarm> = plan
            .all
            .into_iter()
            .zip(plan.addresses)
            .map(|(vote, address)| VoteAlarm {
                vote,
                at: start,
                address,
            })
            .collect();

        let strategy = if self.cfg.gaussian {
            Strategy::Gaussian {
                variance: self.cfg.gaussian_deviate,
                chart_len: self.cfg.chart_cols,
            }
        } else if self.cfg.bunches >= 2 {
            Strategy::Bunched {
                bunches: self.cfg.bunches,
            }
        } else {
            Strategy::Uniform
        };
        let mut scheduler = Scheduler::new(strategy, start, end)?;
        scheduler.schedule(&mut alarms, bit_yes, Utc::now())?;

        if let Some((yes_graph, no_graph)) = scheduler.frame_counts() {
            println!("Yes votes over the window:");
            print!("{}", chart::render_bars(yes_graph, self.cfg.chart_rows));
            println!("No votes over the window:");
            print!("{}", chart::render_bars(no_graph, self.cfg.chart_rows));
        }
        Ok(alarms)
    }

    // Already-voted receipts count as successes; they happen when a network
    // error made a completed cast look failed and the retry was replayed.
    fn report(&self) {
        let tally = self.tally.read().unwrap_or_else(PoisonError::into_inner);
        let mut already_voted = 0usize;
        let failed: Vec<&CastVoteReply> = tally
            .results
            .iter()
            .filter(|reply| match reply.error_code {
                None => false,
                Some(VoteErrorCode::TicketAlreadyVoted) => {
                    already_voted += 1;
                    false
                }
                Some(_) => true,
            })
            .collect();

        debug!(already_voted, "already-voted errors counted as successful");
        println!(
            "Votes succeeded: {}(yes-{}/no-{})",
            tally.results.len() - failed.len(),
            tally.voted_yes,
            tally.voted_no,
        );
        println!("Votes failed   : {}", failed.len());
        if tally.not_cast() > 0 {
            println!("Votes not cast : {}", tally.not_cast());
        }
        for reply in failed {
            println!("Failed vote    : {} {}", reply.ticket, reply.error_context);
        }
    }

    /// Lists every proposal currently being voted on, with this wallet's
    /// standing in each.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError`] on server failures; per-proposal wallet
    /// problems are printed and skipped.
    pub async fn inventory(&self) -> Result<(), VoteError> {
        self.client.version().await?;
        let tokens = self.client.tokens_with_status(VoteStatus::Started).await?;
        if tokens.is_empty() {
            println!("No active votes found.");
            return Ok(());
        }
        let names = self.client.proposal_names(&tokens).await?;

        for token in &tokens {
            let details = match self.client.details(token).await {
                Ok(details) => details,
                Err(err) => {
                    println!("Failed to obtain vote details for {token}: {err}");
                    continue;
                }
            };
            let committed = match self.committed_for(&details).await {
                Ok(committed) => committed,
                Err(err) => {
                    println!("Ticket pool verification: {token} {err}");
                    continue;
                }
            };
            if committed.is_empty() {
                println!("No eligible tickets: {token}");
            }
            let results = match self.client.results(token).await {
                Ok(results) => results,
                Err(err) => {
                    println!("Failed to obtain vote results for {token}: {err}");
                    continue;
                }
            };
            let (me, _them) = eligibility::stats_votes(
                self.wallet.as_ref(),
                &self.network,
                &results,
                &committed,
            )
            .await?;

            println!("Vote: {token}");
            if let Some(name) = names.get(token) {
                println!("  Proposal        : {name}");
            }
            println!("  Start block     : {}", details.vote.start_block_height);
            println!("  End block       : {}", details.vote.end_block_height);
            println!("  Mask            : {}", details.vote.params.mask);
            println!("  Eligible tickets: {}", committed.len());
            println!("  Eligible votes  : {}", me.yet);
            println!("  Voted yes       : {}", me.yes);
            println!("  Voted no        : {}", me.no);
            println!("  Vote Option:");
            println!("    votedrip vote {token} percent yes 0.67 no 0.33");
            println!("    votedrip vote {token} number yes 50 no 69");
            println!("    votedrip --voteduration=1h vote {token} mirror");
        }
        Ok(())
    }

    /// Tallies the recorded votes for one proposal by option.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError`] on server failures or when no votes are
    /// recorded.
    pub async fn tally(&self, token: &str) -> Result<(), VoteError> {
        let results = self.client.results(token).await?;

        let mut count: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
        let mut total = 0u64;
        for vote in &results.votes {
            let bits = vote
                .vote_bit
                .parse::<u64>()
                .map_err(|e| invalid(format!("bad vote bit {:?}: {e}", vote.vote_bit)))?;
            *count.entry(bits).or_default() += 1;
            total += 1;
        }
        if total == 0 {
            return Err(invalid("no votes recorded"));
        }

        let details = self.client.details(token).await?;
        for option in &details.vote.params.options {
            let received = count.get(&option.bit).copied().unwrap_or(0);
            println!("Vote Option:");
            println!("  Id                   : {}", option.id);
            println!("  Description          : {}", option.description);
            println!("  Bit                  : {}", option.bit);
            println!("  Votes received       : {received}");
            println!(
                "  Percentage           : {:.1}%",
                received as f64 / total as f64 * 100.0
            );
        }
        Ok(())
    }

    /// Prints the grouped own/public/total tally table for one proposal.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError`] on server or wallet failures.
    pub async fn tally_table(&self, token: &str) -> Result<(), VoteError> {
        println!("Getting stats table...");
        let details = self.client.details(token).await?;
        let results = self.client.results(token).await?;
        let committed = self.committed_for(&details).await?;
        let partition =
            eligibility::eligible_votes(self.wallet.as_ref(), &self.network, &results, &committed)
                .await?;
        let grouping = stats::group_votes(
            partition.eligible.len(),
            partition.voted_yes.len(),
            partition.voted_no.len(),
            &details,
            &results,
        );

        let best_block = self.wallet.best_block().await?;
        self.print_tally_table(token, &details, &grouping, best_block);
        Ok(())
    }

    fn print_tally_table(
        &self,
        token: &str,
        details: &DetailsReply,
        grouping: &VotesInfoGroup,
        best_block: u32,
    ) {
        let vote = &details.vote;
        let remaining_blocks = vote.end_block_height.saturating_sub(best_block);
        let remaining = self.network.blocks_duration(u64::from(remaining_blocks));
        let complete =
            stats::window_percent_complete(vote.start_block_height, vote.end_block_height, best_block);
        println!(
            "[{}] {token}, {remaining_blocks} blocks remaining ({}), {complete:.2}% done",
            view_time(Utc::now()),
            humantime::format_duration(remaining),
        );

        println!(
            "{:>6} {:>8} {:>10} {:>8} {:>14} {:>8} {:>8} {:>9} {:>10}",
            "", "total", "remaining", "voted", "participation", "yes", "no", "approval", "predicted",
        );
        let row = |name: &str, info: crate::stats::VotesInfo| {
            let predicted = stats::predicted_participation(
                info.participation_rate(),
                vote.start_block_height,
                vote.end_block_height,
                best_block,
            );
            println!(
                "{name:>6} {:>8} {:>10} {:>8} {:>13.4}% {:>8} {:>8} {:>8.4}% {:>9.4}%",
                info.pool,
                info.remaining(),
                info.all(),
                info.participation_rate() * 100.0,
                info.yes,
                info.no,
                info.approval_rate() * 100.0,
                predicted * 100.0,
            );
        };
        row("all", grouping.total());
        row("them", grouping.public);
        row("me", grouping.me);

        // Steering summary: what it would take to hold the public approval
        // ratio with the remaining own tickets.
        let target = grouping.public.approval_rate();
        let (need_yes, need_no) = stats::needed_votes(
            target,
            grouping.me.pool as f64,
            grouping.me,
            grouping.me,
        );
        println!(
            "approval target {:.4}%: needed votes yes {:.0} no {:.0}",
            target * 100.0,
            need_yes.max(0.0).round(),
            need_no.max(0.0).round(),
        );
    }

    /// Prints per-proposal standing for every active vote.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError`] on server failures.
    pub async fn stats(&self) -> Result<(), VoteError> {
        let tokens = self.client.tokens_with_status(VoteStatus::Started).await?;
        let best_block = self.wallet.best_block().await?;

        for token in &tokens {
            let details = self.client.details(token).await?;
            let end_height = details.vote.end_block_height;
            if best_block > end_height {
                println!("Vote expired: current {best_block} > end {end_height} {token}");
                continue;
            }
            let remaining_blocks = end_height - best_block;
            let est_end = Utc::now()
                + TimeDelta::from_std(self.network.blocks_duration(u64::from(remaining_blocks)))
                    .unwrap_or_else(|_| TimeDelta::zero());
            println!(
                "Token: {token}\tRemaining blocks: {remaining_blocks}\tEst end: {}",
                view_time(est_end)
            );

            let results = self.client.results(token).await?;
            let committed = self.committed_for(&details).await?;
            let partition = eligibility::eligible_votes(
                self.wallet.as_ref(),
                &self.network,
                &results,
                &committed,
            )
            .await?;
            let grouping = stats::group_votes(
                partition.eligible.len(),
                partition.voted_yes.len(),
                partition.voted_no.len(),
                &details,
                &results,
            );

            let line = |name: &str, info: crate::stats::VotesInfo| {
                println!(
                    "{name}: Yes {}  No {} ({:.2}% approval)  Voted {} ({:.2}%)  Remain {}",
                    info.yes,
                    info.no,
                    info.approval_rate() * 100.0,
                    info.all(),
                    info.participation_rate() * 100.0,
                    info.remaining(),
                );
            };
            line("Total", grouping.total());
            line("Public", grouping.public);
            line("Me", grouping.me);
        }
        Ok(())
    }

    /// Audits journals for the given tokens. No tokens lists the journal
    /// directories; `ALL` audits every one of them.
    ///
    /// # Errors
    ///
    /// Returns [`VoteError`] when the vote directory cannot be read;
    /// per-token audit failures are printed and skipped.
    pub async fn verify(&self, tokens: &[String]) -> Result<(), VoteError> {
        let list_dirs = || -> Result<Vec<String>, VoteError> {
            let entries =
                std::fs::read_dir(&self.cfg.vote_dir).map_err(|source| JournalError::Io {
                    path: self.cfg.vote_dir.clone(),
                    source,
                })?;
            let mut dirs = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|source| JournalError::Io {
                    path: self.cfg.vote_dir.clone(),
                    source,
                })?;
                let name = entry.file_name().to_string_lossy().into_owned();
                // Journal directories are named by hex token.
                if hex::decode(&name).is_ok() {
                    dirs.push(name);
                }
            }
            Ok(dirs)
        };

        if tokens.is_empty() {
            println!("Votes:");
            for dir in list_dirs()? {
                println!("  {dir}");
            }
            return Ok(());
        }

        let targets = if tokens.len() == 1 && tokens[0] == "ALL" {
            list_dirs()?
        } else {
            tokens.to_vec()
        };

        for token in targets {
            if hex::decode(&token).is_err() {
                println!("invalid vote: {token}");
                continue;
            }
            if let Err(err) = self.verify_token(&token).await {
                println!("verify {token}: {err}");
            }
        }
        Ok(())
    }

    async fn verify_token(&self, token: &str) -> Result<(), VoteError> {
        let summary = self.client.summary(token).await?;
        if !summary.status.is_terminal() {
            return Err(invalid(format!(
                "proposal vote not finished: {}",
                summary.status
            )));
        }

        let dir = self.journal.token_dir(token);
        let results = self.cached_results(token, &dir).await?;

        let details = self.client.details(token).await?;
        let eligible: HashSet<String> = details.vote.eligible_tickets.iter().cloned().collect();
        let cast: HashSet<String> = results.votes.iter().map(|v| v.ticket.clone()).collect();

        println!("== Checking vote {token}");
        let journals = verify::load_journals(&dir)?;
        let report = verify::audit(&journals, &eligible, &cast);

        for (ticket, reason) in &report.failures {
            println!("  FAILED: {ticket} - {reason}");
        }
        if report.not_attempted != 0 {
            println!("  votes that were not attempted: {}", report.not_attempted);
        }
        if report.completed_not_recorded != 0 {
            println!(
                "  votes that completed but were not recorded: {}",
                report.completed_not_recorded
            );
        }
        if report.ineligible != 0 {
            println!("  ineligible tickets: {}", report.ineligible);
        }
        println!("  Total votes       : {}", report.total);
        println!("  Successful votes  : {}", report.successful);
        println!("  Unsuccessful votes: {}", report.failed);
        if report.failed != 0 {
            println!("== Failed votes on proposal {token}");
        } else {
            println!("== NO failed votes on proposal {token}");
        }
        Ok(())
    }

    // The verifier works against a point-in-time snapshot of the final vote
    // set, cached next to the journals.
    async fn cached_results(
        &self,
        token: &str,
        dir: &std::path::Path,
    ) -> Result<crate::api::ResultsReply, VoteError> {
        let path = dir.join(".voteresults");
        if !path.exists() {
            let results = self.client.results(token).await?;
            let raw = serde_json::to_vec(&results)
                .map_err(|e| invalid(format!("encode results cache: {e}")))?;
            std::fs::write(&path, raw).map_err(|source| JournalError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let raw = std::fs::read(&path).map_err(|source| JournalError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|e| invalid(format!("decode results cache: {e}")))
    }
}

// Mirror mode pulls fresh stats through the same eligibility walk the
// commands use.
struct VoterStatsSource {
    client: Arc<ServerClient>,
    wallet: Arc<dyn Wallet>,
    network: Network,
}

#[async_trait]
impl StatsSource for VoterStatsSource {
    async fn fetch(&self, token: &str) -> Result<(VoteStats, VoteStats), String> {
        let details = self.client.details(token).await.map_err(|e| e.to_string())?;
        let tickets = chain::convert_ticket_hashes(&details.vote.eligible_tickets)
            .map_err(|e| e.to_string())?;
        let committed = self
            .wallet
            .committed_tickets(&tickets)
            .await
            .map_err(|e| e.to_string())?;
        let results = self.client.results(token).await.map_err(|e| e.to_string())?;
        eligibility::stats_votes(self.wallet.as_ref(), &self.network, &results, &committed)
            .await
            .map_err(|e| e.to_string())
    }
}

// Fire-time re-signing for mirror mode. The passphrase stays in process
// memory for the run's duration.
struct WalletResigner {
    wallet: Arc<dyn Wallet>,
    passphrase: SecretString,
}

#[async_trait]
impl VoteSigner for WalletResigner {
    async fn resign(
        &self,
        vote: &crate::api::CastVote,
        address: &str,
    ) -> Result<String, WalletError> {
        let request = SignRequest {
            address: address.to_string(),
            message: ballot::vote_message(vote),
        };
        let mut signatures = self
            .wallet
            .sign_messages(self.passphrase.expose_secret().as_bytes(), &[request])
            .await?;
        let signature = signatures.pop().ok_or(WalletError::Rpc {
            method: "SignMessages",
            message: "empty reply".to_string(),
        })?;
        Ok(hex::encode(signature))
    }
}

// The production ballot caster is just the HTTPS client.
#[async_trait]
impl BallotCaster for ServerClient {
    async fn cast(&self, ballot: &CastBallot) -> Result<CastVoteReply, RequestError> {
        self.cast_ballot(ballot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_mode_mirror_detection() {
        assert!(VoteMode::Mirror.is_mirror());
        assert!(!VoteMode::Number { yes: 1, no: 0 }.is_mirror());
    }
}
