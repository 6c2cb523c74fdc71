//! Ballot construction.
//!
//! Walks a pre-shuffled eligible list, allocates the yes/no quotas across
//! it, and obtains a signature for every vote in a single wallet batch
//! call.

use rand::rngs::OsRng;
use rand::Rng;
use thiserror::Error;

use crate::api::CastVote;
use crate::wallet::{SignRequest, TicketAddress, Wallet, WalletError};

/// Errors from ballot construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BallotError {
    /// The quotas ask for more votes than there are eligible tickets.
    #[error("requested {requested} votes but only {eligible} tickets are eligible")]
    QuotaExceedsEligible {
        /// Total requested votes.
        requested: usize,
        /// Eligible ticket count.
        eligible: usize,
    },

    /// The wallet failed to sign.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// The signing reply did not line up with the request batch.
    #[error("signature reply count {got} does not match request count {want}")]
    ReplyCountMismatch {
        /// Replies received.
        got: usize,
        /// Requests sent.
        want: usize,
    },
}

/// Unsigned-then-signed votes for one run, split by side.
#[derive(Debug, Clone, Default)]
pub struct BallotPlan {
    /// All votes in eligible-list order.
    pub all: Vec<CastVote>,
    /// Payout address for each vote, index-aligned with `all`.
    pub addresses: Vec<String>,
    /// Number of yes votes in the plan.
    pub yes: usize,
    /// Number of no votes in the plan.
    pub no: usize,
}

/// Allocates `qty_yes`/`qty_no` votes across the (pre-shuffled) eligible
/// list. While both quotas are open each ticket flips a secure coin; once a
/// side is exhausted the remainder drains into the other.
///
/// # Errors
///
/// Returns [`BallotError::QuotaExceedsEligible`] when the quotas cannot be
/// met.
pub fn build_votes(
    token: &str,
    eligible: &[TicketAddress],
    qty_yes: usize,
    qty_no: usize,
    bit_yes: &str,
    bit_no: &str,
) -> Result<BallotPlan, BallotError> {
    let requested = qty_yes + qty_no;
    if requested > eligible.len() {
        return Err(BallotError::QuotaExceedsEligible {
            requested,
            eligible: eligible.len(),
        });
    }

    let mut plan = BallotPlan {
        all: Vec::with_capacity(requested),
        addresses: Vec::with_capacity(requested),
        ..BallotPlan::default()
    };
    let mut rng = OsRng;

    for entry in eligible {
        if plan.yes == qty_yes && plan.no == qty_no {
            break;
        }
        let vote_yes = if plan.yes < qty_yes && plan.no < qty_no {
            rng.gen_range(0..2u8) == 1
        } else {
            plan.yes < qty_yes
        };

        let bit = if vote_yes {
            plan.yes += 1;
            bit_yes
        } else {
            plan.no += 1;
            bit_no
        };
        plan.all.push(CastVote {
            token: token.to_string(),
            ticket: entry.ticket.to_string(),
            vote_bit: bit.to_string(),
            // Signature filled in by sign_votes.
            signature: String::new(),
        });
        plan.addresses.push(entry.address.clone());
    }
    Ok(plan)
}

/// The message a vote signature commits to.
#[must_use]
pub fn vote_message(vote: &CastVote) -> String {
    format!("{}{}{}", vote.token, vote.ticket, vote.vote_bit)
}

/// Signs every vote in the plan with one wallet batch call and stores the
/// hex-encoded signatures in place. A failed reply at any index is fatal
/// for the whole ballot.
///
/// # Errors
///
/// Returns [`BallotError::Wallet`] on signing failures and
/// [`BallotError::ReplyCountMismatch`] when the wallet returns the wrong
/// number of signatures.
pub async fn sign_votes(
    wallet: &dyn Wallet,
    passphrase: &[u8],
    plan: &mut BallotPlan,
) -> Result<(), BallotError> {
    let requests: Vec<SignRequest> = plan
        .all
        .iter()
        .zip(&plan.addresses)
        .map(|(vote, address)| SignRequest {
            address: address.clone(),
            message: vote_message(vote),
        })
        .collect();

    let signatures = wallet.sign_messages(passphrase, &requests).await?;
    if signatures.len() != plan.all.len() {
        return Err(BallotError::ReplyCountMismatch {
            got: signatures.len(),
            want: plan.all.len(),
        });
    }
    for (vote, signature) in plan.all.iter_mut().zip(signatures) {
        vote.signature = hex::encode(signature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TicketHash;

    fn eligible(n: u8) -> Vec<TicketAddress> {
        (0..n)
            .map(|i| TicketAddress {
                ticket: TicketHash::from([i; 32]),
                address: format!("addr{i}"),
            })
            .collect()
    }

    #[test]
    fn quotas_are_met_exactly() {
        let plan = build_votes("token", &eligible(20), 7, 5, "2", "1").unwrap();
        assert_eq!(plan.yes, 7);
        assert_eq!(plan.no, 5);
        assert_eq!(plan.all.len(), 12);
        assert_eq!(plan.addresses.len(), 12);

        let yes = plan.all.iter().filter(|v| v.vote_bit == "2").count();
        let no = plan.all.iter().filter(|v| v.vote_bit == "1").count();
        assert_eq!((yes, no), (7, 5));
    }

    #[test]
    fn single_sided_quota_drains_to_that_side() {
        let plan = build_votes("token", &eligible(10), 10, 0, "2", "1").unwrap();
        assert_eq!(plan.yes, 10);
        assert!(plan.all.iter().all(|v| v.vote_bit == "2"));

        let plan = build_votes("token", &eligible(10), 0, 4, "2", "1").unwrap();
        assert_eq!(plan.no, 4);
        assert!(plan.all.iter().all(|v| v.vote_bit == "1"));
    }

    #[test]
    fn over_allocation_is_rejected() {
        let err = build_votes("token", &eligible(3), 2, 2, "2", "1").unwrap_err();
        assert!(matches!(err, BallotError::QuotaExceedsEligible { requested: 4, eligible: 3 }));
    }

    #[test]
    fn message_concatenates_token_ticket_bit() {
        let vote = CastVote {
            token: "tok".to_string(),
            ticket: "tick".to_string(),
            vote_bit: "2".to_string(),
            signature: String::new(),
        };
        assert_eq!(vote_message(&vote), "toktick2");
    }
}
