//! Wire types for the ticket-vote server's JSON API.
//!
//! The server exposes three route groups: the top-level `www` API (version
//! discovery), the `ticketvote` API (vote details, results, summaries, and
//! ballot casting), and the `records` API (proposal metadata). All requests
//! are JSON over HTTPS; replies use the server's lowercase field naming.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Base route of the www API group.
pub const API_ROUTE_WWW: &str = "/api/v1";
/// Base route of the ticketvote API group.
pub const API_ROUTE_TICKETVOTE: &str = "/api/ticketvote/v1";
/// Base route of the records API group.
pub const API_ROUTE_RECORDS: &str = "/api/records/v1";

/// Version discovery route (GET).
pub const ROUTE_VERSION: &str = "/version";
/// Vote details route.
pub const ROUTE_DETAILS: &str = "/details";
/// Cast-vote results route.
pub const ROUTE_RESULTS: &str = "/results";
/// Vote summaries route.
pub const ROUTE_SUMMARIES: &str = "/summaries";
/// Ballot submission route.
pub const ROUTE_CAST_BALLOT: &str = "/castballot";
/// Vote inventory route.
pub const ROUTE_INVENTORY: &str = "/inventory";
/// Ticketvote policy route.
pub const ROUTE_POLICY: &str = "/policy";
/// Records batch route.
pub const ROUTE_RECORDS: &str = "/records";

/// Vote option ID for an approval vote.
pub const VOTE_ID_YES: &str = "yes";
/// Vote option ID for a disapproval vote.
pub const VOTE_ID_NO: &str = "no";

/// The conventional bit string for a yes vote.
pub const VOTE_BIT_YES: &str = "2";
/// The conventional bit string for a no vote.
pub const VOTE_BIT_NO: &str = "1";

/// Proposal metadata filename inside a record.
pub const FILE_PROPOSAL_METADATA: &str = "proposalmetadata.json";

/// Status of a proposal vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum VoteStatus {
    /// Invalid status, should not be seen on the wire.
    Invalid,
    /// Vote has not been authorized yet.
    Unauthorized,
    /// Vote has been authorized but not started.
    Authorized,
    /// Vote is in progress.
    Started,
    /// Voting period ended without reaching a quorum verdict.
    Finished,
    /// Vote finished and was approved.
    Approved,
    /// Vote finished and was rejected.
    Rejected,
    /// Record is ineligible for voting.
    Ineligible,
    /// A status this client does not know about.
    Unknown(u32),
}

impl VoteStatus {
    /// Whether the vote has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Approved | Self::Rejected)
    }
}

impl From<u32> for VoteStatus {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Invalid,
            1 => Self::Unauthorized,
            2 => Self::Authorized,
            3 => Self::Started,
            4 => Self::Finished,
            5 => Self::Approved,
            6 => Self::Rejected,
            7 => Self::Ineligible,
            other => Self::Unknown(other),
        }
    }
}

impl From<VoteStatus> for u32 {
    fn from(s: VoteStatus) -> Self {
        match s {
            VoteStatus::Invalid => 0,
            VoteStatus::Unauthorized => 1,
            VoteStatus::Authorized => 2,
            VoteStatus::Started => 3,
            VoteStatus::Finished => 4,
            VoteStatus::Approved => 5,
            VoteStatus::Rejected => 6,
            VoteStatus::Ineligible => 7,
            VoteStatus::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for VoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Unauthorized => "unauthorized",
            Self::Authorized => "authorized",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Ineligible => "ineligible",
            Self::Unknown(_) => "unknown",
        };
        f.write_str(name)
    }
}

/// Per-vote error codes returned in a [`CastVoteReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum VoteErrorCode {
    /// Invalid error code.
    Invalid,
    /// The server hit an internal error; the vote may be retried.
    InternalError,
    /// The proposal token is not valid.
    TokenInvalid,
    /// No record found for the token.
    RecordNotFound,
    /// The ballot voted on multiple records.
    MultipleRecordVotes,
    /// The vote is not active.
    VoteStatusInvalid,
    /// The vote bit is not a valid option.
    VoteBitInvalid,
    /// The vote signature did not verify.
    SignatureInvalid,
    /// The ticket is not in the eligible set.
    TicketNotEligible,
    /// The ticket has already voted on this proposal.
    TicketAlreadyVoted,
    /// An error code this client does not know about.
    Unknown(u32),
}

impl From<u32> for VoteErrorCode {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::Invalid,
            1 => Self::InternalError,
            2 => Self::TokenInvalid,
            3 => Self::RecordNotFound,
            4 => Self::MultipleRecordVotes,
            5 => Self::VoteStatusInvalid,
            6 => Self::VoteBitInvalid,
            7 => Self::SignatureInvalid,
            8 => Self::TicketNotEligible,
            9 => Self::TicketAlreadyVoted,
            other => Self::Unknown(other),
        }
    }
}

impl From<VoteErrorCode> for u32 {
    fn from(c: VoteErrorCode) -> Self {
        match c {
            VoteErrorCode::Invalid => 0,
            VoteErrorCode::InternalError => 1,
            VoteErrorCode::TokenInvalid => 2,
            VoteErrorCode::RecordNotFound => 3,
            VoteErrorCode::MultipleRecordVotes => 4,
            VoteErrorCode::VoteStatusInvalid => 5,
            VoteErrorCode::VoteBitInvalid => 6,
            VoteErrorCode::SignatureInvalid => 7,
            VoteErrorCode::TicketNotEligible => 8,
            VoteErrorCode::TicketAlreadyVoted => 9,
            VoteErrorCode::Unknown(other) => other,
        }
    }
}

/// Server version reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionReply {
    /// API version number.
    pub version: u32,
    /// Active API route prefix.
    pub route: String,
    /// Hex-encoded Ed25519 public key the server signs replies with.
    #[serde(rename = "pubkey")]
    pub pub_key: String,
}

/// A single selectable vote option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteOption {
    /// Option identifier, e.g. `"yes"` or `"no"`.
    pub id: String,
    /// Human readable description.
    #[serde(default)]
    pub description: String,
    /// Bit the option maps to in a cast vote.
    pub bit: u64,
}

/// Parameters the vote was started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteParams {
    /// Proposal censorship token.
    pub token: String,
    /// Bit mask of all valid options.
    #[serde(default)]
    pub mask: u64,
    /// Voting window duration in blocks.
    #[serde(default)]
    pub duration: u32,
    /// Available options.
    pub options: Vec<VoteOption>,
}

/// Full details of a proposal vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteDetails {
    /// Vote parameters.
    pub params: VoteParams,
    /// Height of the first block of the voting window.
    #[serde(rename = "startblockheight")]
    pub start_block_height: u32,
    /// Height of the last block of the voting window.
    #[serde(rename = "endblockheight")]
    pub end_block_height: u32,
    /// Tickets eligible to vote on this proposal.
    #[serde(rename = "eligibletickets")]
    pub eligible_tickets: Vec<String>,
}

/// Details request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Details {
    /// Proposal censorship token.
    pub token: String,
}

/// Details reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailsReply {
    /// Vote details; absent when no vote has been started.
    pub vote: VoteDetails,
}

/// A vote that has been recorded by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVoteDetails {
    /// Proposal censorship token.
    pub token: String,
    /// Ticket hash, hex encoded.
    pub ticket: String,
    /// Vote bit string.
    #[serde(rename = "votebit")]
    pub vote_bit: String,
    /// Client signature over `token ‖ ticket ‖ votebit`.
    #[serde(default)]
    pub signature: String,
    /// Server receipt: signature of the server over the client signature.
    #[serde(default)]
    pub receipt: String,
}

/// Results request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Results {
    /// Proposal censorship token.
    pub token: String,
}

/// Results reply: the full set of votes cast so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsReply {
    /// All recorded votes.
    pub votes: Vec<CastVoteDetails>,
}

/// Summaries request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summaries {
    /// Tokens to summarize.
    pub tokens: Vec<String>,
}

/// Voting window summary of a single proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    /// Current vote status.
    pub status: VoteStatus,
    /// Height of the first block of the voting window.
    #[serde(rename = "startblockheight", default)]
    pub start_block_height: u32,
    /// Height of the last block of the voting window.
    #[serde(rename = "endblockheight", default)]
    pub end_block_height: u32,
    /// Best block the server knows about.
    #[serde(rename = "bestblock", default)]
    pub best_block: u32,
}

/// Summaries reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummariesReply {
    /// Summaries keyed by token.
    pub summaries: HashMap<String, Summary>,
}

/// A signed vote for a single ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVote {
    /// Proposal censorship token.
    pub token: String,
    /// Ticket hash, hex encoded.
    pub ticket: String,
    /// Vote bit string.
    #[serde(rename = "votebit")]
    pub vote_bit: String,
    /// Hex-encoded detached signature over `token ‖ ticket ‖ votebit`.
    pub signature: String,
}

/// The ballot container submitted to the server.
///
/// The trickler always submits single-vote ballots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastBallot {
    /// Votes in this ballot.
    pub votes: Vec<CastVote>,
}

/// Per-vote receipt returned for a cast ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVoteReply {
    /// Ticket hash, hex encoded.
    pub ticket: String,
    /// Server receipt for an accepted vote.
    #[serde(default)]
    pub receipt: String,
    /// Error code when the vote was not accepted.
    #[serde(rename = "errorcode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<VoteErrorCode>,
    /// Human readable error context.
    #[serde(rename = "errorcontext", default)]
    pub error_context: String,
}

/// Ballot reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastBallotReply {
    /// One receipt per submitted vote, in submission order.
    pub receipts: Vec<CastVoteReply>,
}

/// Typed client-error reply the server sends with HTTP 400.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserErrorReply {
    /// Numeric error code; zero means the body was not a typed error.
    #[serde(rename = "errorcode", default)]
    pub error_code: u32,
    /// Human readable error context.
    #[serde(rename = "errorcontext", default)]
    pub error_context: String,
}

/// Inventory request. The route is paginated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inventory {
    /// Page number, starting at 1.
    pub page: u32,
    /// Status filter.
    pub status: VoteStatus,
}

/// Inventory reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryReply {
    /// Tokens grouped by status name.
    pub vetted: HashMap<String, Vec<String>>,
}

/// Policy request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {}

/// Policy reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyReply {
    /// Page size of the inventory route.
    #[serde(rename = "inventorypagesize")]
    pub inventory_page_size: u32,
    /// Page size of the records route.
    #[serde(rename = "recordspagesize", default = "default_records_page_size")]
    pub records_page_size: u32,
}

const fn default_records_page_size() -> u32 {
    5
}

/// Request for a single record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRequest {
    /// Proposal censorship token.
    pub token: String,
    /// Filenames to include in the reply.
    pub filenames: Vec<String>,
}

/// Records batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsRequest {
    /// Individual record requests.
    pub requests: Vec<RecordRequest>,
}

/// A file attached to a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFile {
    /// File name.
    pub name: String,
    /// Base64-encoded payload.
    pub payload: String,
}

/// A single record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Files attached to the record.
    #[serde(default)]
    pub files: Vec<RecordFile>,
}

/// Records batch reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsReply {
    /// Records keyed by token.
    pub records: HashMap<String, Record>,
}

/// Proposal metadata decoded from a record's metadata file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalMetadata {
    /// Proposal name.
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_status_round_trip() {
        for raw in 0..10u32 {
            let status = VoteStatus::from(raw);
            assert_eq!(u32::from(status), raw);
        }
        assert_eq!(VoteStatus::from(3), VoteStatus::Started);
        assert!(VoteStatus::Approved.is_terminal());
        assert!(!VoteStatus::Started.is_terminal());
    }

    #[test]
    fn error_code_round_trip() {
        for raw in 0..12u32 {
            let code = VoteErrorCode::from(raw);
            assert_eq!(u32::from(code), raw);
        }
        assert_eq!(VoteErrorCode::from(9), VoteErrorCode::TicketAlreadyVoted);
    }

    #[test]
    fn cast_vote_reply_serde_shape() {
        let reply = CastVoteReply {
            ticket: "aa".repeat(32),
            receipt: "r".to_string(),
            error_code: None,
            error_context: String::new(),
        };
        let json = serde_json::to_value(&reply).unwrap();
        // No error code means the key is omitted entirely.
        assert!(json.get("errorcode").is_none());

        let parsed: CastVoteReply =
            serde_json::from_str(r#"{"ticket":"ab","errorcode":9}"#).unwrap();
        assert_eq!(parsed.error_code, Some(VoteErrorCode::TicketAlreadyVoted));
    }
}
