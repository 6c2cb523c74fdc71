//! Post-mortem journal audit.
//!
//! Reconstructs, from a token's journal directory, which tickets voted,
//! which failed, and which were lost, then cross-checks against the
//! server's recorded cast set and eligible set.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::warn;

use crate::journal::{
    self, FAILED_JOURNAL, FailedTuple, JournalError, SUCCESS_JOURNAL, SuccessTuple, WORK_JOURNAL,
    WorkTuple,
};

/// Why a ticket landed in the failed bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    /// The ticket appears in a work journal but no attempt was recorded.
    NotAttempted,
    /// Attempts were recorded but none succeeded.
    Error,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAttempted => f.write_str("Not attempted"),
            Self::Error => f.write_str("Error"),
        }
    }
}

/// Audit result for one proposal.
#[derive(Debug, Default)]
pub struct AuditReport {
    /// Every ticket that appeared in a work journal.
    pub total: usize,
    /// Tickets with a success record, plus the completed-but-not-recorded
    /// ones.
    pub successful: usize,
    /// Tickets that failed outright.
    pub failed: usize,
    /// Tickets never attempted and absent from the server's cast set.
    pub not_attempted: usize,
    /// Tickets with no local success record that the server nonetheless
    /// recorded (a network replay succeeded server-side).
    pub completed_not_recorded: usize,
    /// Work tickets missing from the server's eligible set. Anything above
    /// zero is a data-integrity alarm.
    pub ineligible: usize,
    /// Failed tickets with their reasons.
    pub failures: Vec<(String, FailReason)>,
}

/// Decoded journals for one token directory.
#[derive(Debug, Default)]
pub struct JournalSet {
    /// Work groups keyed by time stamp.
    pub work: HashMap<String, Vec<WorkTuple>>,
    /// Success groups keyed by ticket.
    pub success: HashMap<String, Vec<SuccessTuple>>,
    /// Failed groups keyed by ticket.
    pub failed: HashMap<String, Vec<FailedTuple>>,
}

/// Reads every journal in `dir`. Files that fail to decode are skipped with
/// a warning so one corrupt run cannot hide the rest.
///
/// # Errors
///
/// Returns [`JournalError::Io`] when the directory itself cannot be read.
pub fn load_journals(dir: &Path) -> Result<JournalSet, JournalError> {
    let entries = std::fs::read_dir(dir).map_err(|source| JournalError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut set = JournalSet::default();
    for entry in entries {
        let entry = entry.map_err(|source| JournalError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        let result = if name.starts_with(FAILED_JOURNAL) {
            journal::decode_failed(&path, &mut set.failed)
        } else if name.starts_with(SUCCESS_JOURNAL) {
            journal::decode_success(&path, &mut set.success)
        } else if name.starts_with(WORK_JOURNAL) {
            journal::decode_work(&path, &mut set.work)
        } else if name == ".voteresults" {
            // Results snapshot, not a journal.
            continue;
        } else {
            warn!(file = %name, "unknown journal");
            continue;
        };
        if let Err(err) = result {
            warn!(file = %name, error = %err, "journal decode failed");
        }
    }
    Ok(set)
}

/// Audits one proposal's journals against the server's eligible and cast
/// ticket sets.
#[must_use]
pub fn audit(
    journals: &JournalSet,
    eligible: &HashSet<String>,
    cast: &HashSet<String>,
) -> AuditReport {
    // Per-ticket attempt statistics out of the work journals.
    let mut tickets: HashSet<String> = HashSet::new();
    let mut unresolved: HashMap<String, usize> = HashMap::new(); // ticket -> retries
    for groups in journals.work.values() {
        for group in groups {
            for alarm in &group.alarms {
                let ticket = alarm.vote.ticket.clone();
                tickets.insert(ticket.clone());

                let retries = journals.failed.get(&ticket).map_or(0, Vec::len);
                match journals.success.get(&ticket) {
                    Some(successes) => {
                        if successes.len() != 1 {
                            warn!(ticket = %ticket, count = successes.len(), "multiple success records");
                        }
                    }
                    None => {
                        unresolved.insert(ticket, retries);
                    }
                }
            }
        }
    }

    let mut report = AuditReport {
        total: tickets.len(),
        ..AuditReport::default()
    };

    for (ticket, retries) in &unresolved {
        if *retries == 0 {
            if cast.contains(ticket) {
                report.completed_not_recorded += 1;
                continue;
            }
            report.not_attempted += 1;
            report.failed += 1;
            report.failures.push((ticket.clone(), FailReason::NotAttempted));
        } else {
            if cast.contains(ticket) {
                report.completed_not_recorded += 1;
                continue;
            }
            report.failed += 1;
            report.failures.push((ticket.clone(), FailReason::Error));
        }
    }

    for ticket in &tickets {
        if !eligible.contains(ticket) {
            report.ineligible += 1;
        }
    }

    report.successful = journals.success.len() + report.completed_not_recorded;
    report.failures.sort_by(|a, b| a.0.cmp(&b.0));
    report
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::api::{CastVote, CastVoteReply};
    use crate::journal::Journal;
    use crate::trickle::VoteAlarm;

    fn alarm(i: u64) -> VoteAlarm {
        VoteAlarm {
            vote: CastVote {
                token: "token".to_string(),
                ticket: format!("{i:064x}"),
                vote_bit: "2".to_string(),
                signature: String::new(),
            },
            at: Utc::now(),
            address: String::new(),
        }
    }

    fn reply(i: u64) -> CastVoteReply {
        CastVoteReply {
            ticket: format!("{i:064x}"),
            receipt: "r".to_string(),
            error_code: None,
            error_context: String::new(),
        }
    }

    #[test]
    fn audit_partitions_work_tickets() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), Utc::now());

        // Four tickets of work: one success, one failed with a retry, one
        // lost but server-recorded, one never attempted.
        let alarms: Vec<VoteAlarm> = (0..4).map(alarm).collect();
        journal.work("token", &alarms).unwrap();
        journal.success("token", &reply(0)).unwrap();
        journal
            .failed_reply(
                "token",
                &CastVoteReply {
                    error_code: Some(crate::api::VoteErrorCode::TicketNotEligible),
                    ..reply(1)
                },
            )
            .unwrap();

        let eligible: HashSet<String> = (0..4).map(|i| format!("{i:064x}")).collect();
        let cast: HashSet<String> = [format!("{:064x}", 0), format!("{:064x}", 2)].into();

        let journals = load_journals(&journal.token_dir("token")).unwrap();
        let report = audit(&journals, &eligible, &cast);

        assert_eq!(report.total, 4);
        assert_eq!(report.successful, 2); // recorded + replayed
        assert_eq!(report.completed_not_recorded, 1);
        assert_eq!(report.not_attempted, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.ineligible, 0);
    }

    #[test]
    fn work_ticket_outside_eligible_set_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), Utc::now());
        journal.work("token", &[alarm(7)]).unwrap();
        journal.success("token", &reply(7)).unwrap();

        let journals = load_journals(&journal.token_dir("token")).unwrap();
        let report = audit(&journals, &HashSet::new(), &HashSet::new());
        assert_eq!(report.ineligible, 1);
        assert_eq!(report.successful, 1);
    }
}
