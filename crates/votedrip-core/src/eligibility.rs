//! Eligibility resolution.
//!
//! Cross-references the server-declared eligible set, the wallet's committed
//! tickets, and the votes already on record. The output partitions our
//! tickets into already-voted-yes, already-voted-no, and still-castable,
//! excluding anything the wallet cannot actually sign for (tickets tracked
//! by imported extended-public-key accounts).

use std::collections::HashMap;

use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};
use tracing::warn;

use crate::api::{CastVoteDetails, ResultsReply, VOTE_BIT_YES};
use crate::chain::{self, ChainError, Network};
use crate::stats::VoteStats;
use crate::wallet::{TicketAddress, Wallet, WalletError};

/// Disjoint partition of the wallet's committed tickets for one proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Tickets that already voted yes.
    pub voted_yes: Vec<TicketAddress>,
    /// Tickets that already voted no.
    pub voted_no: Vec<TicketAddress>,
    /// Tickets that can still be cast.
    pub eligible: Vec<TicketAddress>,
}

/// Errors from eligibility resolution.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EligibilityError {
    /// Wallet RPC failure outside the per-ticket tolerance.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// Chain-side parsing failure.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

fn index_cast_votes(results: &ResultsReply) -> HashMap<&str, &CastVoteDetails> {
    results
        .votes
        .iter()
        .map(|v| (v.ticket.as_str(), v))
        .collect()
}

// A ticket is signable when its payout commitment resolves to a validated
// address that is not tracked by an imported xpub account. Any wallet
// failure along the way means "not ours to sign".
async fn signable(
    wallet: &dyn Wallet,
    network: &Network,
    ticket: &TicketAddress,
) -> Result<bool, ChainError> {
    let raw = match wallet.transaction(&ticket.ticket).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(ticket = %ticket.ticket, error = %err, "transaction lookup failed");
            return Ok(false);
        }
    };
    let outputs = chain::parse_ticket_outputs(&raw)?;
    let address = chain::commitment_address(&outputs, network)?;

    let info = match wallet.validate_address(&address).await {
        Ok(info) => info,
        Err(err) => {
            warn!(ticket = %ticket.ticket, error = %err, "address validation failed");
            return Ok(false);
        }
    };
    Ok(info.is_valid && !info.is_imported())
}

/// Partitions the wallet's committed tickets for a proposal.
///
/// Tickets the wallet cannot sign for are dropped entirely; tickets already
/// in the cast set land in the voted buckets by their recorded bit;
/// everything else is eligible.
///
/// # Errors
///
/// Returns [`EligibilityError::Chain`] when a wallet-returned transaction
/// cannot be parsed. Per-ticket wallet RPC failures exclude the ticket and
/// continue.
pub async fn eligible_votes(
    wallet: &dyn Wallet,
    network: &Network,
    results: &ResultsReply,
    committed: &[TicketAddress],
) -> Result<Partition, EligibilityError> {
    let cast = index_cast_votes(results);
    let mut partition = Partition {
        eligible: Vec::with_capacity(committed.len()),
        ..Partition::default()
    };

    for ticket in committed {
        if !signable(wallet, network, ticket).await? {
            continue;
        }
        match cast.get(ticket.ticket.to_string().as_str()) {
            None => partition.eligible.push(ticket.clone()),
            Some(detail) if detail.vote_bit == VOTE_BIT_YES => {
                partition.voted_yes.push(ticket.clone());
            }
            Some(_) => partition.voted_no.push(ticket.clone()),
        }
    }
    Ok(partition)
}

/// Walks the committed set and splits vote stats into our tickets and the
/// public's. A ticket that fails any wallet or chain lookup counts as
/// public, not ours.
///
/// # Errors
///
/// Currently infallible per ticket; the `Result` mirrors
/// [`eligible_votes`] so callers handle both the same way.
pub async fn stats_votes(
    wallet: &dyn Wallet,
    network: &Network,
    results: &ResultsReply,
    committed: &[TicketAddress],
) -> Result<(VoteStats, VoteStats), EligibilityError> {
    let cast = index_cast_votes(results);
    let mut me = VoteStats::default();
    let mut them = VoteStats::default();

    for ticket in committed {
        let mine = signable(wallet, network, ticket).await.unwrap_or(false);
        let owner = if mine { &mut me } else { &mut them };
        match cast.get(ticket.ticket.to_string().as_str()) {
            None => owner.yet += 1,
            Some(detail) if detail.vote_bit == VOTE_BIT_YES => owner.yes += 1,
            Some(_) => owner.no += 1,
        }
    }
    Ok((me, them))
}

/// Fisher–Yates shuffles the eligible list. The shuffle runs off a fast
/// PRNG whose 64-bit seed comes from the secure source.
pub fn shuffle_eligible(eligible: &mut [TicketAddress]) {
    let seed = OsRng.next_u64();
    let mut rng = StdRng::seed_from_u64(seed);
    let len = eligible.len();
    for i in 0..len {
        // Pick a number between the current index and the end.
        let j = rng.gen_range(i..len);
        eligible.swap(i, j);
    }
}
