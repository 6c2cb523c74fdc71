//! Vote counting primitives: per-side tallies, own/public groupings, and the
//! participation math behind the tally table.

use serde::{Deserialize, Serialize};

use crate::api::{DetailsReply, ResultsReply, VOTE_ID_NO, VOTE_ID_YES};

/// Yes/no/unvoted counts for one slice of the ticket pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteStats {
    /// Tickets that voted yes.
    pub yes: u64,
    /// Tickets that voted no.
    pub no: u64,
    /// Tickets that have not voted yet.
    pub yet: u64,
}

impl VoteStats {
    /// Total tickets in this slice.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.yes + self.no + self.yet
    }

    /// Approval ratio of the cast votes. Defined as `0.5` when the yes and
    /// no counts are equal, including the empty case.
    #[must_use]
    pub fn rate(&self) -> f64 {
        if self.yes == self.no {
            return 0.5;
        }
        self.yes as f64 / (self.yes + self.no) as f64
    }
}

/// Cast counts plus pool size for one slice of the electorate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotesInfo {
    /// Yes votes.
    pub yes: u64,
    /// No votes.
    pub no: u64,
    /// Total tickets in the pool for this slice.
    pub pool: u64,
}

impl VotesInfo {
    /// Votes cast in this slice.
    #[must_use]
    pub const fn all(&self) -> u64 {
        self.yes + self.no
    }

    /// Tickets in the pool that have not voted.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.pool.saturating_sub(self.all())
    }

    /// Yes ratio among cast votes, rounded to four decimal places.
    #[must_use]
    pub fn approval_rate(&self) -> f64 {
        if self.all() == 0 {
            return 0.0;
        }
        round4(self.yes as f64 / self.all() as f64)
    }

    /// Fraction of the pool that has voted, rounded to four decimal places.
    #[must_use]
    pub fn participation_rate(&self) -> f64 {
        if self.pool == 0 {
            return 0.0;
        }
        round4(self.all() as f64 / self.pool as f64)
    }
}

/// Own and public vote slices for a single proposal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VotesInfoGroup {
    /// Votes this wallet controls.
    pub me: VotesInfo,
    /// Everyone else.
    pub public: VotesInfo,
}

impl VotesInfoGroup {
    /// Componentwise sum of both slices.
    #[must_use]
    pub const fn total(&self) -> VotesInfo {
        VotesInfo {
            yes: self.me.yes + self.public.yes,
            no: self.me.no + self.public.no,
            pool: self.me.pool + self.public.pool,
        }
    }
}

/// Builds the own/public grouping for a proposal from the wallet-side
/// eligibility partition and the server's cast-vote set.
#[must_use]
pub fn group_votes(
    eligible_len: usize,
    voted_yes_len: usize,
    voted_no_len: usize,
    details: &DetailsReply,
    results: &ResultsReply,
) -> VotesInfoGroup {
    let me = VotesInfo {
        yes: voted_yes_len as u64,
        no: voted_no_len as u64,
        pool: (eligible_len + voted_yes_len + voted_no_len) as u64,
    };

    // Tally the full cast set by option bit.
    let mut total = VotesInfo {
        pool: details.vote.eligible_tickets.len() as u64,
        ..VotesInfo::default()
    };
    let bit_of = |id: &str| {
        details
            .vote
            .params
            .options
            .iter()
            .find(|o| o.id == id)
            .map(|o| o.bit.to_string())
    };
    let yes_bit = bit_of(VOTE_ID_YES);
    let no_bit = bit_of(VOTE_ID_NO);
    for vote in &results.votes {
        if Some(&vote.vote_bit) == yes_bit.as_ref() {
            total.yes += 1;
        } else if Some(&vote.vote_bit) == no_bit.as_ref() {
            total.no += 1;
        }
    }

    let public = VotesInfo {
        yes: total.yes.saturating_sub(me.yes),
        no: total.no.saturating_sub(me.no),
        pool: total.pool.saturating_sub(me.pool),
    };

    VotesInfoGroup { me, public }
}

/// Completed percentage of the voting window, in `[0, 100]`.
#[must_use]
pub fn window_percent_complete(start_height: u32, end_height: u32, best_block: u32) -> f64 {
    let total = f64::from(end_height.saturating_sub(start_height));
    if total <= 0.0 {
        return 100.0;
    }
    let done = f64::from(best_block.saturating_sub(start_height)).min(total);
    done / total * 100.0
}

/// Projects a participation rate to the end of the voting window, assuming
/// the observed pace continues. Clamped to `1.0`.
#[must_use]
pub fn predicted_participation(
    participation: f64,
    start_height: u32,
    end_height: u32,
    best_block: u32,
) -> f64 {
    let complete = window_percent_complete(start_height, end_height, best_block);
    if complete <= 0.0 {
        return 0.0;
    }
    round4(participation * (100.0 / complete)).min(1.0)
}

/// Yes/no votes still needed to steer the target slice to `target_approval`
/// given a ticket budget. Either side saturates at the budget remainder when
/// the target is outside the reachable approval range.
#[must_use]
pub fn needed_votes(
    target_approval: f64,
    budget_tickets: f64,
    target: VotesInfo,
    me: VotesInfo,
) -> (f64, f64) {
    let left = budget_tickets - me.all() as f64;
    let yes = target.yes as f64;
    let no = target.no as f64;

    let highest = (left + yes) / budget_tickets;
    let lowest = yes / budget_tickets;
    if target_approval > highest {
        (left, 0.0)
    } else if target_approval < lowest {
        (0.0, left)
    } else {
        let target_yes = target_approval * budget_tickets;
        (target_yes - yes, (budget_tickets - target_yes) - no)
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{VoteDetails, VoteOption, VoteParams};

    fn details(eligible: usize) -> DetailsReply {
        DetailsReply {
            vote: VoteDetails {
                params: VoteParams {
                    token: "token".to_string(),
                    mask: 3,
                    duration: 2016,
                    options: vec![
                        VoteOption {
                            id: VOTE_ID_NO.to_string(),
                            description: String::new(),
                            bit: 1,
                        },
                        VoteOption {
                            id: VOTE_ID_YES.to_string(),
                            description: String::new(),
                            bit: 2,
                        },
                    ],
                },
                start_block_height: 100,
                end_block_height: 200,
                eligible_tickets: (0..eligible).map(|i| format!("{i:064x}")).collect(),
            },
        }
    }

    fn results(yes: usize, no: usize) -> ResultsReply {
        let mut votes = Vec::new();
        for i in 0..yes + no {
            votes.push(crate::api::CastVoteDetails {
                token: "token".to_string(),
                ticket: format!("{i:064x}"),
                vote_bit: if i < yes { "2" } else { "1" }.to_string(),
                signature: String::new(),
                receipt: String::new(),
            });
        }
        ResultsReply { votes }
    }

    #[test]
    fn rate_is_half_when_balanced() {
        assert_eq!(VoteStats::default().rate(), 0.5);
        let even = VoteStats {
            yes: 4,
            no: 4,
            yet: 1,
        };
        assert_eq!(even.rate(), 0.5);
        let skewed = VoteStats {
            yes: 3,
            no: 1,
            yet: 0,
        };
        assert_eq!(skewed.rate(), 0.75);
    }

    #[test]
    fn grouping_subtracts_own_votes_from_public() {
        // 10 eligible overall; we hold 2 cast-yes, 1 cast-no, 2 castable.
        let group = group_votes(2, 2, 1, &details(10), &results(5, 2));
        assert_eq!(group.me, VotesInfo { yes: 2, no: 1, pool: 5 });
        // Public counts are derived from the no-ticket tally, not the yes
        // list length.
        assert_eq!(group.public, VotesInfo { yes: 3, no: 1, pool: 5 });
        assert_eq!(group.total().all(), 7);
    }

    #[test]
    fn needed_votes_saturates_outside_reachable_range() {
        let me = VotesInfo { yes: 0, no: 0, pool: 10 };
        let (yes, no) = needed_votes(1.0, 10.0, me, me);
        assert_eq!((yes, no), (10.0, 0.0));
        let (yes, no) = needed_votes(0.0, 10.0, me, me);
        assert_eq!((yes, no), (0.0, 10.0));

        let mid = VotesInfo { yes: 2, no: 2, pool: 10 };
        let (yes, no) = needed_votes(0.5, 10.0, mid, mid);
        assert_eq!((yes, no), (3.0, 3.0));
    }

    #[test]
    fn predicted_participation_projects_pace() {
        // Halfway through the window with 30% participation projects to 60%.
        let predicted = predicted_participation(0.3, 100, 200, 150);
        assert!((predicted - 0.6).abs() < 1e-9);
        // Never above 100%.
        assert_eq!(predicted_participation(0.9, 100, 200, 150), 1.0);
    }
}
