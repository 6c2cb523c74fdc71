//! End-to-end trickler scenarios against a scripted ballot caster.
//!
//! Time is paused: sleeps auto-advance, so minute-long vote windows run in
//! milliseconds while preserving fire ordering.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use tokio::sync::watch;

use votedrip_core::api::{CastBallot, CastVote, CastVoteReply, VoteErrorCode};
use votedrip_core::client::{RequestError, RetryError};
use votedrip_core::distribution::{Scheduler, Strategy};
use votedrip_core::journal::{self, FailedRecord, Journal};
use votedrip_core::trickle::{BallotCaster, Tally, TrickleError, Trickler, VoteAlarm};

const TOKEN: &str = "deadbeef";
const BIT_YES: &str = "2";
const BIT_NO: &str = "1";

fn fake_ticket(i: usize) -> String {
    let mut raw = [0u8; 32];
    raw[..8].copy_from_slice(&(i as u64).to_le_bytes());
    hex::encode(raw)
}

fn fake_alarms(n: usize) -> Vec<VoteAlarm> {
    (0..n)
        .map(|i| VoteAlarm {
            vote: CastVote {
                token: TOKEN.to_string(),
                ticket: fake_ticket(i),
                vote_bit: BIT_YES.to_string(),
                signature: "00".repeat(64),
            },
            at: Utc::now(),
            address: String::new(),
        })
        .collect()
}

fn spread_uniform(alarms: &mut [VoteAlarm], window: Duration) {
    let from = Utc::now();
    let to = from + TimeDelta::from_std(window).unwrap();
    let mut scheduler = Scheduler::new(Strategy::Uniform, from, to).unwrap();
    scheduler.schedule(alarms, BIT_YES, from).unwrap();
}

// Per-ticket scripted behavior, applied in attempt order.
#[derive(Clone)]
enum Step {
    Ok,
    RetryOnce,
    AlreadyVoted,
    StatusInvalid,
    FatalUser,
}

struct ScriptedCaster {
    scripts: HashMap<String, Vec<Step>>,
    attempts: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

impl ScriptedCaster {
    fn new(scripts: HashMap<String, Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts,
            attempts: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn ok_reply(ticket: &str) -> CastVoteReply {
        CastVoteReply {
            ticket: ticket.to_string(),
            receipt: "receipt".to_string(),
            error_code: None,
            error_context: String::new(),
        }
    }
}

#[async_trait]
impl BallotCaster for ScriptedCaster {
    async fn cast(&self, ballot: &CastBallot) -> Result<CastVoteReply, RequestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ticket = ballot.votes[0].ticket.clone();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(ticket.clone()).or_insert(0);
            let current = *counter;
            *counter += 1;
            current
        };

        let script = self.scripts.get(&ticket).cloned().unwrap_or_default();
        match script.get(attempt).unwrap_or(&Step::Ok) {
            Step::Ok => Ok(Self::ok_reply(&ticket)),
            Step::RetryOnce => Err(RequestError::Retry(RetryError {
                at: "status".to_string(),
                code: 408,
                body: String::new(),
                err: "fake timeout".to_string(),
            })),
            Step::AlreadyVoted => Ok(CastVoteReply {
                error_code: Some(VoteErrorCode::TicketAlreadyVoted),
                ..Self::ok_reply(&ticket)
            }),
            Step::StatusInvalid => Ok(CastVoteReply {
                error_code: Some(VoteErrorCode::VoteStatusInvalid),
                ..Self::ok_reply(&ticket)
            }),
            Step::FatalUser => Err(RequestError::User {
                code: 255,
                context: "fake".to_string(),
            }),
        }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    journal: Journal,
    tally: Arc<RwLock<Tally>>,
    run_unix: i64,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let run = Utc::now();
        Self {
            journal: Journal::new(dir.path(), run),
            tally: Arc::new(RwLock::new(Tally::default())),
            run_unix: run.timestamp(),
            _dir: dir,
        }
    }

    fn trickler(&self, caster: Arc<dyn BallotCaster>) -> Trickler {
        Trickler::new(caster, self.journal.clone(), Arc::clone(&self.tally), BIT_YES)
    }

    fn journal_path(&self, kind: &str) -> std::path::PathBuf {
        self.journal
            .token_dir(TOKEN)
            .join(format!("{kind}.{}", self.run_unix))
    }

    fn decoded_failed(&self) -> HashMap<String, Vec<journal::FailedTuple>> {
        let mut failed = HashMap::new();
        let path = self.journal_path("failed");
        if path.exists() {
            journal::decode_failed(&path, &mut failed).unwrap();
        }
        failed
    }

    fn decoded_success_tickets(&self) -> HashSet<String> {
        let mut success = HashMap::new();
        let path = self.journal_path("success");
        if path.exists() {
            journal::decode_success(&path, &mut success).unwrap();
        }
        success.into_keys().collect()
    }
}

fn no_shutdown() -> watch::Receiver<bool> {
    // Dropping the sender means the signal can never fire.
    let (_, rx) = watch::channel(false);
    rx
}

// S1: every third ballot needs a second attempt; the run still completes
// with a full tally and the retries all land in the failed journal.
#[tokio::test(start_paused = true)]
async fn trickle_retries_then_completes() {
    let harness = Harness::new();
    let mut alarms = fake_alarms(20);
    spread_uniform(&mut alarms, Duration::from_secs(60));

    let mut scripts = HashMap::new();
    for (i, alarm) in alarms.iter().enumerate() {
        if i % 3 == 0 {
            scripts.insert(alarm.vote.ticket.clone(), vec![Step::RetryOnce, Step::Ok]);
        }
    }
    let caster = ScriptedCaster::new(scripts);

    harness
        .trickler(caster)
        .run(TOKEN, alarms, no_shutdown())
        .await
        .unwrap();

    let tally = harness.tally.read().unwrap();
    assert_eq!(tally.results.len(), 20);
    assert_eq!(tally.voted_yes, 20);
    assert_eq!(tally.not_cast(), 0);
    assert!(tally.results.iter().all(|r| r.error_code.is_none()));

    // ceil(20 / 3) tickets were rescheduled exactly once.
    let failed = harness.decoded_failed();
    assert_eq!(failed.len(), 7);
    for tuples in failed.values() {
        assert_eq!(tuples.len(), 1);
        assert!(matches!(tuples[0].record, FailedRecord::Retry { .. }));
    }
}

// S2: a fatal transport error fails the run and leaves no success record.
#[tokio::test(start_paused = true)]
async fn fatal_transport_error_fails_the_run() {
    let harness = Harness::new();
    let mut alarms = fake_alarms(1);
    spread_uniform(&mut alarms, Duration::from_secs(10));
    let ticket = alarms[0].vote.ticket.clone();

    let caster = ScriptedCaster::new(HashMap::from([(ticket.clone(), vec![Step::FatalUser])]));
    let err = harness
        .trickler(caster)
        .run(TOKEN, alarms, no_shutdown())
        .await
        .unwrap_err();
    assert!(matches!(err, TrickleError::Unrecoverable(_)));

    assert!(!harness.decoded_success_tickets().contains(&ticket));
    assert_eq!(harness.tally.read().unwrap().results.len(), 0);
}

// S3: twenty thousand ballots over a two-minute window complete with a
// linear-memory tally.
#[tokio::test(start_paused = true)]
async fn many_ballots_complete() {
    let harness = Harness::new();
    let mut alarms = fake_alarms(20_000);
    spread_uniform(&mut alarms, Duration::from_secs(120));

    let caster = ScriptedCaster::new(HashMap::new());
    harness
        .trickler(caster)
        .run(TOKEN, alarms, no_shutdown())
        .await
        .unwrap();

    let tally = harness.tally.read().unwrap();
    assert_eq!(tally.results.len(), 20_000);
    assert_eq!(tally.voted_yes, 20_000);
}

// S5: a closed voting window aborts the run and cancels the ballots that
// have not fired yet.
#[tokio::test(start_paused = true)]
async fn window_close_cancels_siblings() {
    let harness = Harness::new();
    let mut alarms = fake_alarms(10);
    // Deterministic fire order: one second apart.
    let base = Utc::now();
    for (i, alarm) in alarms.iter_mut().enumerate() {
        alarm.at = base + TimeDelta::seconds(i as i64 + 1);
    }
    let closing_ticket = alarms[4].vote.ticket.clone();

    let caster = ScriptedCaster::new(HashMap::from([(
        closing_ticket,
        vec![Step::StatusInvalid],
    )]));
    let caster_calls = Arc::clone(&caster);

    let err = harness
        .trickler(caster)
        .run(TOKEN, alarms, no_shutdown())
        .await
        .unwrap_err();
    assert!(matches!(err, TrickleError::WindowClosed));

    // Ballots after the window close never reached the server.
    assert_eq!(caster_calls.calls.load(Ordering::SeqCst), 5);

    let successes = harness.decoded_success_tickets();
    assert_eq!(successes.len(), 4);
    for i in 5..10 {
        assert!(!successes.contains(&fake_ticket(i)));
    }
}

// Property 7: a forced retry answered with TicketAlreadyVoted ends up
// identical to a first-try success.
#[tokio::test(start_paused = true)]
async fn already_voted_after_retry_counts_as_success() {
    let harness = Harness::new();
    let mut alarms = fake_alarms(1);
    spread_uniform(&mut alarms, Duration::from_secs(10));
    let ticket = alarms[0].vote.ticket.clone();

    let caster = ScriptedCaster::new(HashMap::from([(
        ticket.clone(),
        vec![Step::RetryOnce, Step::AlreadyVoted],
    )]));
    harness
        .trickler(caster)
        .run(TOKEN, alarms, no_shutdown())
        .await
        .unwrap();

    let tally = harness.tally.read().unwrap();
    assert_eq!(tally.results.len(), 1);
    assert_eq!(tally.voted_yes, 1);
    assert!(harness.decoded_success_tickets().contains(&ticket));
}

// Emulation fabricates receipts without touching the caster at all.
#[tokio::test(start_paused = true)]
async fn emulation_never_contacts_the_server() {
    let harness = Harness::new();
    let alarms = fake_alarms(5);

    let caster = ScriptedCaster::new(HashMap::new());
    let caster_calls = Arc::clone(&caster);
    harness
        .trickler(caster)
        .with_emulation(true)
        .run(TOKEN, alarms, no_shutdown())
        .await
        .unwrap();

    assert_eq!(caster_calls.calls.load(Ordering::SeqCst), 0);
    let tally = harness.tally.read().unwrap();
    assert_eq!(tally.results.len(), 5);
    assert_eq!(harness.decoded_success_tickets().len(), 5);
}

// An external shutdown interrupts sleeping ballots.
#[tokio::test(start_paused = true)]
async fn shutdown_cancels_sleeping_ballots() {
    let harness = Harness::new();
    let mut alarms = fake_alarms(3);
    let base = Utc::now();
    for (i, alarm) in alarms.iter_mut().enumerate() {
        alarm.at = base + TimeDelta::seconds((i as i64 + 1) * 3600);
    }

    let (tx, rx) = watch::channel(false);
    let caster = ScriptedCaster::new(HashMap::new());
    let trickler = harness.trickler(caster);

    let shutdown = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let _ = tx.send(true);
    });

    let err = trickler.run(TOKEN, alarms, rx).await.unwrap_err();
    assert!(matches!(err, TrickleError::Cancelled { .. }));
    shutdown.await.unwrap();

    assert_eq!(harness.tally.read().unwrap().results.len(), 0);
}

// S4: mirror mode steers our ratio toward the public one, re-signing when
// the bit flips.
#[tokio::test(start_paused = true)]
async fn mirror_tracks_public_ratio() {
    use votedrip_core::mirror::{MirrorCache, StatsSource};
    use votedrip_core::stats::VoteStats;
    use votedrip_core::trickle::{MirrorHooks, VoteSigner};
    use votedrip_core::wallet::WalletError;

    struct FixedSource;

    #[async_trait]
    impl StatsSource for FixedSource {
        async fn fetch(&self, _token: &str) -> Result<(VoteStats, VoteStats), String> {
            Ok((
                VoteStats { yes: 0, no: 0, yet: 4 },
                VoteStats { yes: 3, no: 1, yet: 0 },
            ))
        }
    }

    struct FixedSigner;

    #[async_trait]
    impl VoteSigner for FixedSigner {
        async fn resign(
            &self,
            _vote: &CastVote,
            _address: &str,
        ) -> Result<String, WalletError> {
            Ok("ab".repeat(64))
        }
    }

    struct BitRecorder {
        bits: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BallotCaster for BitRecorder {
        async fn cast(&self, ballot: &CastBallot) -> Result<CastVoteReply, RequestError> {
            self.bits
                .lock()
                .unwrap()
                .push(ballot.votes[0].vote_bit.clone());
            Ok(ScriptedCaster::ok_reply(&ballot.votes[0].ticket))
        }
    }

    let harness = Harness::new();
    let mut alarms = fake_alarms(4);
    let base = Utc::now();
    for (i, alarm) in alarms.iter_mut().enumerate() {
        // Start from NO bits so the first flip exercises re-signing.
        alarm.vote.vote_bit = BIT_NO.to_string();
        alarm.at = base + TimeDelta::seconds(i as i64 + 1);
    }

    let caster = Arc::new(BitRecorder {
        bits: Mutex::new(Vec::new()),
    });
    let recorded = Arc::clone(&caster);

    let hooks = MirrorHooks {
        cache: Arc::new(MirrorCache::new(
            TOKEN,
            Duration::from_secs(3600),
            Arc::new(FixedSource),
        )),
        signer: Arc::new(FixedSigner),
    };
    harness
        .trickler(caster)
        .with_mirror(hooks)
        .run(TOKEN, alarms, no_shutdown())
        .await
        .unwrap();

    // Public approval is 0.75. Ours walks 0.5 -> 1.0 -> 0.5 -> 0.67, so the
    // decisions go YES, NO, YES, YES and land at 3:1.
    assert_eq!(
        *recorded.bits.lock().unwrap(),
        vec!["2", "1", "2", "2"]
    );
    let tally = harness.tally.read().unwrap();
    assert_eq!(tally.voted_yes, 3);
    assert_eq!(tally.voted_no, 1);
}
