//! Durable vote journals.
//!
//! Every run appends three kinds of journal under `vote_dir/<token>/`: the
//! `work` journal (the full alarm list at run start), the `success` journal
//! (one receipt per completed vote), and the `failed` journal (one record per
//! failed attempt). File names carry the run's start instant
//! (`<kind>.<unix>`), so re-runs append new files and never destroy old ones.
//!
//! A journal file is not a JSON array. It is a concatenation of values: a
//! `{"time": ...}` record followed by one or more domain values, repeated.
//! Decoding therefore walks the stream value by value through a small state
//! machine; end of file is only legal where a time record would start.

use std::collections::HashMap;
use std::fs::{DirBuilder, OpenOptions};
use std::io::{BufReader, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::api::{CastBallot, CastVoteReply};
use crate::client::RetryError;
use crate::trickle::VoteAlarm;

/// Work journal kind.
pub const WORK_JOURNAL: &str = "work";
/// Success journal kind.
pub const SUCCESS_JOURNAL: &str = "success";
/// Failed journal kind.
pub const FAILED_JOURNAL: &str = "failed";

// One writer at a time per process, whatever task is appending.
static APPEND_LOCK: Mutex<()> = Mutex::new(());

/// Errors from journal reading and writing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    /// Filesystem failure.
    #[error("journal io {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A value could not be encoded.
    #[error("journal encode: {0}")]
    Encode(#[source] serde_json::Error),

    /// The stream held a value the state machine did not expect.
    #[error("journal decode {path} (record {record}): {message}")]
    Decode {
        /// File being decoded.
        path: PathBuf,
        /// Index of the offending top-level value.
        record: usize,
        /// What went wrong.
        message: String,
    },
}

/// The timestamp record that precedes every journal record group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRecord {
    /// Wall-clock stamp with nanosecond precision.
    pub time: String,
}

fn stamp_now() -> TimeRecord {
    TimeRecord {
        // Go's reference StampNano shape: "Jan  2 15:04:05.000000000".
        time: Local::now().format("%b %e %H:%M:%S%.9f").to_string(),
    }
}

/// Append-only journal writer for one run.
#[derive(Debug, Clone)]
pub struct Journal {
    vote_dir: PathBuf,
    run_unix: i64,
}

impl Journal {
    /// Creates a writer for the run that started at `run`.
    #[must_use]
    pub fn new(vote_dir: &Path, run: DateTime<Utc>) -> Self {
        Self {
            vote_dir: vote_dir.to_path_buf(),
            run_unix: run.timestamp(),
        }
    }

    /// Directory journals for `token` live in.
    #[must_use]
    pub fn token_dir(&self, token: &str) -> PathBuf {
        self.vote_dir.join(token)
    }

    fn append(&self, kind: &str, token: &str, values: &[Value]) -> Result<(), JournalError> {
        let dir = self.token_dir(token);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| JournalError::Io { path, source }
        };

        if !dir.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&dir)
                .map_err(io_err(&dir))?;
        }

        let _guard = APPEND_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let path = dir.join(format!("{kind}.{}", self.run_unix));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&path)
            .map_err(io_err(&path))?;

        let mut write_value = |value: &Value| -> Result<(), JournalError> {
            serde_json::to_writer_pretty(&mut file, value).map_err(JournalError::Encode)?;
            file.write_all(b"\n").map_err(io_err(&path))
        };

        write_value(&serde_json::to_value(stamp_now()).map_err(JournalError::Encode)?)?;
        for value in values {
            write_value(value)?;
        }
        Ok(())
    }

    /// Records the full alarm list at the start of a run.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on IO or encoding failures.
    pub fn work(&self, token: &str, alarms: &[VoteAlarm]) -> Result<(), JournalError> {
        let value = serde_json::to_value(alarms).map_err(JournalError::Encode)?;
        self.append(WORK_JOURNAL, token, &[value])
    }

    /// Records a successful cast.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on IO or encoding failures.
    pub fn success(&self, token: &str, reply: &CastVoteReply) -> Result<(), JournalError> {
        let value = serde_json::to_value(reply).map_err(JournalError::Encode)?;
        self.append(SUCCESS_JOURNAL, token, &[value])
    }

    /// Records a retryable submission failure: the ballot that was in
    /// flight plus the transport error.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on IO or encoding failures.
    pub fn failed_retry(
        &self,
        token: &str,
        ballot: &CastBallot,
        err: &RetryError,
    ) -> Result<(), JournalError> {
        let ballot = serde_json::to_value(ballot).map_err(JournalError::Encode)?;
        let err = serde_json::to_value(err).map_err(JournalError::Encode)?;
        self.append(FAILED_JOURNAL, token, &[ballot, err])
    }

    /// Records a terminal per-ballot server reply.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on IO or encoding failures.
    pub fn failed_reply(&self, token: &str, reply: &CastVoteReply) -> Result<(), JournalError> {
        let value = serde_json::to_value(reply).map_err(JournalError::Encode)?;
        self.append(FAILED_JOURNAL, token, &[value])
    }
}

/// One decoded work record group.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkTuple {
    /// Stamp of the group.
    pub time: TimeRecord,
    /// Alarms journaled at run start.
    pub alarms: Vec<VoteAlarm>,
}

/// One decoded success record group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessTuple {
    /// Stamp of the group.
    pub time: TimeRecord,
    /// The receipt.
    pub reply: CastVoteReply,
}

/// The domain part of a failed record group.
#[derive(Debug, Clone, PartialEq)]
pub enum FailedRecord {
    /// Submission never completed: the in-flight ballot and the transport
    /// error that rescheduled it.
    Retry {
        /// Ballot that was being submitted.
        ballot: CastBallot,
        /// Transport failure.
        err: RetryError,
    },
    /// Submission completed with a terminal per-ballot reply.
    Reply {
        /// The server's receipt.
        reply: CastVoteReply,
    },
}

/// One decoded failed record group.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedTuple {
    /// Stamp of the group.
    pub time: TimeRecord,
    /// Domain payload.
    pub record: FailedRecord,
}

fn open_stream(path: &Path) -> Result<impl Iterator<Item = serde_json::Result<Value>>, JournalError> {
    let file = std::fs::File::open(path).map_err(|source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::Deserializer::from_reader(BufReader::new(file)).into_iter::<Value>())
}

fn decode_err(path: &Path, record: usize, message: impl std::fmt::Display) -> JournalError {
    JournalError::Decode {
        path: path.to_path_buf(),
        record,
        message: message.to_string(),
    }
}

fn typed<T: for<'de> Deserialize<'de>>(
    path: &Path,
    record: usize,
    value: Value,
    what: &str,
) -> Result<T, JournalError> {
    serde_json::from_value(value).map_err(|e| decode_err(path, record, format!("{what}: {e}")))
}

/// Decodes a work journal into `work`, keyed by the group's time stamp.
///
/// # Errors
///
/// Returns [`JournalError::Decode`] when the stream does not alternate
/// between time records and alarm lists.
pub fn decode_work(
    path: &Path,
    work: &mut HashMap<String, Vec<WorkTuple>>,
) -> Result<(), JournalError> {
    let mut stream = open_stream(path)?;
    let mut record = 0usize;
    loop {
        // State 0: a time record, or a clean end of file.
        let Some(value) = stream.next() else {
            return Ok(());
        };
        let time: TimeRecord =
            typed(path, record, value.map_err(|e| decode_err(path, record, e))?, "time")?;
        record += 1;

        // State 1: the alarm list.
        let value = stream
            .next()
            .ok_or_else(|| decode_err(path, record, "missing alarm list"))?
            .map_err(|e| decode_err(path, record, e))?;
        let alarms: Vec<VoteAlarm> = typed(path, record, value, "alarms")?;
        record += 1;

        work.entry(time.time.clone())
            .or_default()
            .push(WorkTuple { time, alarms });
    }
}

/// Decodes a success journal into `success`, keyed by ticket.
///
/// # Errors
///
/// Returns [`JournalError::Decode`] when the stream does not alternate
/// between time records and receipts, or a receipt has no ticket.
pub fn decode_success(
    path: &Path,
    success: &mut HashMap<String, Vec<SuccessTuple>>,
) -> Result<(), JournalError> {
    let mut stream = open_stream(path)?;
    let mut record = 0usize;
    loop {
        let Some(value) = stream.next() else {
            return Ok(());
        };
        let time: TimeRecord =
            typed(path, record, value.map_err(|e| decode_err(path, record, e))?, "time")?;
        record += 1;

        let value = stream
            .next()
            .ok_or_else(|| decode_err(path, record, "missing receipt"))?
            .map_err(|e| decode_err(path, record, e))?;
        let reply: CastVoteReply = typed(path, record, value, "receipt")?;
        record += 1;

        if reply.ticket.is_empty() {
            return Err(decode_err(path, record, "receipt has no ticket"));
        }
        success
            .entry(reply.ticket.clone())
            .or_default()
            .push(SuccessTuple { time, reply });
    }
}

/// Decodes a failed journal into `failed`, keyed by ticket.
///
/// A failed group is either a ballot followed by a retry error, or a single
/// terminal receipt; the domain value's shape picks the branch.
///
/// # Errors
///
/// Returns [`JournalError::Decode`] on stream shape violations.
pub fn decode_failed(
    path: &Path,
    failed: &mut HashMap<String, Vec<FailedTuple>>,
) -> Result<(), JournalError> {
    let mut stream = open_stream(path)?;
    let mut record = 0usize;
    loop {
        let Some(value) = stream.next() else {
            return Ok(());
        };
        let time: TimeRecord =
            typed(path, record, value.map_err(|e| decode_err(path, record, e))?, "time")?;
        record += 1;

        let value = stream
            .next()
            .ok_or_else(|| decode_err(path, record, "missing failed record"))?
            .map_err(|e| decode_err(path, record, e))?;

        // A ballot carries a "votes" array; a receipt does not.
        if value.get("votes").is_some() {
            let ballot: CastBallot = typed(path, record, value, "ballot")?;
            record += 1;
            if ballot.votes.len() != 1 {
                return Err(decode_err(
                    path,
                    record,
                    format!("ballot has {} votes, expected 1", ballot.votes.len()),
                ));
            }
            let ticket = ballot.votes[0].ticket.clone();

            // State 2: the retry error that rescheduled this ballot.
            let value = stream
                .next()
                .ok_or_else(|| decode_err(path, record, "missing retry error"))?
                .map_err(|e| decode_err(path, record, e))?;
            let err: RetryError = typed(path, record, value, "retry error")?;
            record += 1;

            failed.entry(ticket).or_default().push(FailedTuple {
                time,
                record: FailedRecord::Retry { ballot, err },
            });
        } else {
            let reply: CastVoteReply = typed(path, record, value, "receipt")?;
            record += 1;
            if reply.ticket.is_empty() {
                return Err(decode_err(path, record, "receipt has no ticket"));
            }
            failed.entry(reply.ticket.clone()).or_default().push(FailedTuple {
                time,
                record: FailedRecord::Reply { reply },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CastVote;

    fn fake_alarm(i: u64) -> VoteAlarm {
        VoteAlarm {
            vote: CastVote {
                token: "token".to_string(),
                ticket: format!("{i:064x}"),
                vote_bit: "2".to_string(),
                signature: "00".repeat(64),
            },
            at: Utc::now(),
            address: format!("addr{i}"),
        }
    }

    fn journal_in(dir: &Path) -> Journal {
        Journal::new(dir, Utc::now())
    }

    #[test]
    fn work_round_trip_preserves_alarms() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        let alarms: Vec<VoteAlarm> = (0..5).map(fake_alarm).collect();
        journal.work("token", &alarms).unwrap();

        let path = journal.token_dir("token").join(format!("work.{}", journal.run_unix));
        let mut decoded = HashMap::new();
        decode_work(&path, &mut decoded).unwrap();

        let groups: Vec<_> = decoded.values().flatten().collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].alarms, alarms);
    }

    #[test]
    fn multiple_appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        for i in 0..3 {
            let reply = CastVoteReply {
                ticket: format!("{i:064x}"),
                receipt: "r".to_string(),
                error_code: None,
                error_context: String::new(),
            };
            journal.success("token", &reply).unwrap();
        }

        let path = journal
            .token_dir("token")
            .join(format!("success.{}", journal.run_unix));
        let mut decoded = HashMap::new();
        decode_success(&path, &mut decoded).unwrap();
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn failed_decoder_handles_both_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let journal = journal_in(dir.path());
        let alarm = fake_alarm(1);
        let ballot = CastBallot {
            votes: vec![alarm.vote.clone()],
        };
        let err = RetryError {
            at: "send".to_string(),
            code: 500,
            body: String::new(),
            err: "connection reset".to_string(),
        };
        journal.failed_retry("token", &ballot, &err).unwrap();

        let reply = CastVoteReply {
            ticket: alarm.vote.ticket.clone(),
            receipt: String::new(),
            error_code: Some(crate::api::VoteErrorCode::TicketNotEligible),
            error_context: String::new(),
        };
        journal.failed_reply("token", &reply).unwrap();

        let path = journal
            .token_dir("token")
            .join(format!("failed.{}", journal.run_unix));
        let mut decoded = HashMap::new();
        decode_failed(&path, &mut decoded).unwrap();

        let tuples = &decoded[&alarm.vote.ticket];
        assert_eq!(tuples.len(), 2);
        assert!(matches!(tuples[0].record, FailedRecord::Retry { .. }));
        assert!(matches!(tuples[1].record, FailedRecord::Reply { .. }));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.0");
        std::fs::write(&path, "{\"time\": \"Jan  2 15:04:05.000000000\"}\n").unwrap();
        let mut decoded = HashMap::new();
        let err = decode_work(&path, &mut decoded).unwrap_err();
        assert!(matches!(err, JournalError::Decode { .. }));
    }
}
