//! HTTPS client for the ticket-vote server.
//!
//! The client owns the error classification the trickler's retry loop
//! depends on: a `200` passes bytes through, a `400` carrying a typed
//! [`UserErrorReply`] is a permanent client error, and everything else is
//! retryable and captured as a [`RetryError`] with enough context to
//! journal. Vote details are memoized through the disk cache; version and
//! summary replies are memoized for the lifetime of the client.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::api::{
    API_ROUTE_RECORDS, API_ROUTE_TICKETVOTE, API_ROUTE_WWW, CastBallot, CastBallotReply,
    CastVoteReply, Details, DetailsReply, FILE_PROPOSAL_METADATA, Inventory, InventoryReply,
    Policy, PolicyReply, ProposalMetadata, RecordRequest, RecordsReply, RecordsRequest, Results,
    ResultsReply, ROUTE_CAST_BALLOT, ROUTE_DETAILS, ROUTE_INVENTORY, ROUTE_POLICY, ROUTE_RECORDS,
    ROUTE_RESULTS, ROUTE_SUMMARIES, ROUTE_VERSION, Summaries, SummariesReply, Summary,
    UserErrorReply, VersionReply, VoteStatus,
};
use crate::cache::{Store, StoreError};
use crate::config::Config;

/// A transport failure the trickler may retry.
///
/// Round-trips through the failed journal, so every field is plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("retry error: {code} ({at}) {err}")]
pub struct RetryError {
    /// Where in the request path the failure happened.
    pub at: String,
    /// HTTP status code, zero when the request never completed.
    pub code: u16,
    /// Response body, if any was read.
    #[serde(default)]
    pub body: String,
    /// Underlying error text.
    #[serde(default)]
    pub err: String,
}

/// Errors from talking to the ticket-vote server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RequestError {
    /// Retryable transport failure.
    #[error(transparent)]
    Retry(#[from] RetryError),

    /// The server rejected the request with a typed client error. Never
    /// retried.
    #[error("server rejected request: code {code}: {context}")]
    User {
        /// Server error code.
        code: u32,
        /// Server error context.
        context: String,
    },

    /// A reply could not be decoded.
    #[error("could not decode {what} reply: {source}")]
    Decode {
        /// Which reply failed.
        what: &'static str,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The lookup cache failed.
    #[error(transparent)]
    Cache(#[from] StoreError),

    /// The server identity key could not be parsed.
    #[error("invalid server identity: {0}")]
    Identity(String),

    /// A signed reply failed verification against the server identity.
    #[error("reply signature verification failed for ticket {ticket}")]
    Verification {
        /// Ticket whose receipt failed.
        ticket: String,
    },

    /// The server does not know the proposal.
    #[error("proposal does not exist: {token}")]
    Proposal {
        /// Unknown token.
        token: String,
    },

    /// A reply violated a protocol invariant.
    #[error("reply integrity: {0}")]
    Integrity(String),
}

/// HTTPS client with per-run memoization.
#[derive(Debug)]
pub struct ServerClient {
    http: reqwest::Client,
    host: String,
    cache: Store,
    version: RwLock<Option<VersionReply>>,
    identity: RwLock<Option<VerifyingKey>>,
    summaries: RwLock<HashMap<String, Summary>>,
}

impl ServerClient {
    /// Builds a client from the application configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] when the HTTP client or lookup cache cannot
    /// be constructed.
    pub fn new(cfg: &Config) -> Result<Self, RequestError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("votedrip/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(cfg.skip_verify)
            .build()
            .map_err(|e| RequestError::Integrity(format!("build http client: {e}")))?;
        let cache = Store::open(&cfg.cache_path, cfg.cache_timeout())?;
        Ok(Self {
            http,
            host: cfg.host.trim_end_matches('/').to_string(),
            cache,
            version: RwLock::new(None),
            identity: RwLock::new(None),
            summaries: RwLock::new(HashMap::new()),
        })
    }

    async fn request<T: Serialize + ?Sized>(
        &self,
        method: Method,
        route: &str,
        body: Option<&T>,
    ) -> Result<Vec<u8>, RequestError> {
        let url = format!("{}{route}", self.host);
        let started = Instant::now();

        let mut req = self.http.request(method.clone(), url.as_str());
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|e| RetryError {
            at: "http send".to_string(),
            code: 0,
            body: String::new(),
            err: e.to_string(),
        })?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| RetryError {
            at: "read body".to_string(),
            code: status.as_u16(),
            body: String::new(),
            err: e.to_string(),
        })?;
        debug!(
            %method,
            route,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request"
        );
        trace!(body = %String::from_utf8_lossy(&bytes), "response");

        match status {
            StatusCode::OK => Ok(bytes.to_vec()),
            StatusCode::BAD_REQUEST => {
                if let Ok(reply) = serde_json::from_slice::<UserErrorReply>(&bytes) {
                    if reply.error_code != 0 {
                        return Err(RequestError::User {
                            code: reply.error_code,
                            context: reply.error_context,
                        });
                    }
                }
                Err(RetryError {
                    at: "untyped 400".to_string(),
                    code: status.as_u16(),
                    body: String::from_utf8_lossy(&bytes).into_owned(),
                    err: String::new(),
                }
                .into())
            }
            _ => Err(RetryError {
                at: "status".to_string(),
                code: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
                err: String::new(),
            }
            .into()),
        }
    }

    fn decode<T: for<'de> Deserialize<'de>>(
        bytes: &[u8],
        what: &'static str,
    ) -> Result<T, RequestError> {
        serde_json::from_slice(bytes).map_err(|source| RequestError::Decode { what, source })
    }

    /// Returns the server version reply, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] on transport or identity failures.
    pub async fn version(&self) -> Result<VersionReply, RequestError> {
        if let Some(version) = self.version.read().expect("version lock").clone() {
            return Ok(version);
        }
        let route = format!("{API_ROUTE_WWW}{ROUTE_VERSION}");
        let bytes = self.request::<()>(Method::GET, &route, None).await?;
        let version: VersionReply = Self::decode(&bytes, "version")?;

        let key_bytes: [u8; 32] = hex::decode(&version.pub_key)
            .map_err(|e| RequestError::Identity(e.to_string()))?
            .try_into()
            .map_err(|_| RequestError::Identity("key is not 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| RequestError::Identity(e.to_string()))?;

        *self.identity.write().expect("identity lock") = Some(key);
        *self.version.write().expect("version lock") = Some(version.clone());
        debug!(version = version.version, route = %version.route, "server contact");
        Ok(version)
    }

    // The store is blocking rusqlite with a sleeping open-retry loop; it
    // must never run on the async workers.
    fn cache_task_err(err: tokio::task::JoinError) -> RequestError {
        RequestError::Integrity(format!("cache worker: {err}"))
    }

    /// Fetches vote details for `token`, memoized through the disk cache.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] on transport, cache, or decode failures.
    pub async fn details(&self, token: &str) -> Result<DetailsReply, RequestError> {
        let key = format!("POST|{API_ROUTE_TICKETVOTE}{ROUTE_DETAILS}|{token}");
        let store = self.cache.clone();
        let lookup = key.clone();
        let cached = tokio::task::spawn_blocking(move || store.get(&lookup))
            .await
            .map_err(Self::cache_task_err)??;
        if let Some(bytes) = cached {
            return Self::decode(&bytes, "details");
        }

        let route = format!("{API_ROUTE_TICKETVOTE}{ROUTE_DETAILS}");
        let bytes = self
            .request(
                Method::POST,
                &route,
                Some(&Details {
                    token: token.to_string(),
                }),
            )
            .await?;
        let reply: DetailsReply = Self::decode(&bytes, "details")?;
        let store = self.cache.clone();
        tokio::task::spawn_blocking(move || store.put(&key, &bytes))
            .await
            .map_err(Self::cache_task_err)??;
        Ok(reply)
    }

    /// Fetches the full cast-vote set for `token` and verifies every
    /// receipt that the server attached.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Verification`] when a receipt does not
    /// verify under the server identity.
    pub async fn results(&self, token: &str) -> Result<ResultsReply, RequestError> {
        // Identity must be pinned before we can check receipts.
        self.version().await?;
        let route = format!("{API_ROUTE_TICKETVOTE}{ROUTE_RESULTS}");
        let bytes = self
            .request(
                Method::POST,
                &route,
                Some(&Results {
                    token: token.to_string(),
                }),
            )
            .await?;
        let reply: ResultsReply = Self::decode(&bytes, "results")?;

        let identity = (*self.identity.read().expect("identity lock")).ok_or_else(|| {
            RequestError::Identity("server identity not established".to_string())
        })?;
        for vote in &reply.votes {
            if vote.receipt.is_empty() {
                continue;
            }
            Self::verify_receipt(&identity, &vote.ticket, &vote.signature, &vote.receipt)?;
        }
        Ok(reply)
    }

    // A receipt is the server's signature over the client's vote signature.
    fn verify_receipt(
        identity: &VerifyingKey,
        ticket: &str,
        signature: &str,
        receipt: &str,
    ) -> Result<(), RequestError> {
        let fail = || RequestError::Verification {
            ticket: ticket.to_string(),
        };
        let receipt_bytes: [u8; 64] = hex::decode(receipt)
            .map_err(|_| fail())?
            .try_into()
            .map_err(|_| fail())?;
        let sig = Signature::from_bytes(&receipt_bytes);
        identity
            .verify(signature.as_bytes(), &sig)
            .map_err(|_| fail())
    }

    /// Returns the voting summary for `token`, memoized for this run.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Proposal`] when the server does not know the
    /// token.
    pub async fn summary(&self, token: &str) -> Result<Summary, RequestError> {
        if let Some(summary) = self.summaries.read().expect("summaries lock").get(token) {
            return Ok(summary.clone());
        }

        let route = format!("{API_ROUTE_TICKETVOTE}{ROUTE_SUMMARIES}");
        let bytes = self
            .request(
                Method::POST,
                &route,
                Some(&Summaries {
                    tokens: vec![token.to_string()],
                }),
            )
            .await?;
        let mut reply: SummariesReply = Self::decode(&bytes, "summaries")?;
        let summary = reply
            .summaries
            .remove(token)
            .ok_or_else(|| RequestError::Proposal {
                token: token.to_string(),
            })?;
        self.summaries
            .write()
            .expect("summaries lock")
            .insert(token.to_string(), summary.clone());
        Ok(summary)
    }

    /// Submits a single-vote ballot and returns its receipt.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Integrity`] when the ballot does not hold
    /// exactly one vote or the reply receipt count is off, and transport
    /// errors otherwise.
    pub async fn cast_ballot(&self, ballot: &CastBallot) -> Result<CastVoteReply, RequestError> {
        if ballot.votes.len() != 1 {
            return Err(RequestError::Integrity(format!(
                "ballot must hold exactly one vote, got {}",
                ballot.votes.len()
            )));
        }
        let route = format!("{API_ROUTE_TICKETVOTE}{ROUTE_CAST_BALLOT}");
        let bytes = self.request(Method::POST, &route, Some(ballot)).await?;
        let mut reply: CastBallotReply = Self::decode(&bytes, "cast ballot")?;
        if reply.receipts.len() != 1 {
            return Err(RequestError::Integrity(format!(
                "expected one receipt, got {}",
                reply.receipts.len()
            )));
        }
        Ok(reply.receipts.remove(0))
    }

    /// Fetches the ticketvote policy.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] on transport or decode failures.
    pub async fn policy(&self) -> Result<PolicyReply, RequestError> {
        let route = format!("{API_ROUTE_TICKETVOTE}{ROUTE_POLICY}");
        let bytes = self.request(Method::POST, &route, Some(&Policy {})).await?;
        Self::decode(&bytes, "policy")
    }

    async fn inventory_page(&self, page: u32, status: VoteStatus) -> Result<InventoryReply, RequestError> {
        let route = format!("{API_ROUTE_TICKETVOTE}{ROUTE_INVENTORY}");
        let bytes = self
            .request(Method::POST, &route, Some(&Inventory { page, status }))
            .await?;
        Self::decode(&bytes, "inventory")
    }

    /// Collects every token currently in the given vote status. The
    /// inventory route is paginated; the page size comes from the policy
    /// route.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] on transport or decode failures.
    pub async fn tokens_with_status(&self, status: VoteStatus) -> Result<Vec<String>, RequestError> {
        let page_size = self.policy().await?.inventory_page_size;
        let status_key = status.to_string();
        let mut tokens = Vec::new();
        let mut page = 1u32;
        loop {
            let reply = self.inventory_page(page, status).await?;
            let page_tokens = reply.vetted.get(&status_key).cloned().unwrap_or_default();
            let page_len = page_tokens.len();
            tokens.extend(page_tokens);
            if page_len < page_size as usize {
                break;
            }
            page += 1;
        }
        Ok(tokens)
    }

    async fn records(&self, tokens: &[String]) -> Result<RecordsReply, RequestError> {
        let requests = tokens
            .iter()
            .map(|t| RecordRequest {
                token: t.clone(),
                filenames: vec![FILE_PROPOSAL_METADATA.to_string()],
            })
            .collect();
        let route = format!("{API_ROUTE_RECORDS}{ROUTE_RECORDS}");
        let bytes = self
            .request(Method::POST, &route, Some(&RecordsRequest { requests }))
            .await?;
        Self::decode(&bytes, "records")
    }

    /// Resolves proposal names for a set of tokens, paging through the
    /// records route.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] on transport or metadata decode failures.
    pub async fn proposal_names(
        &self,
        tokens: &[String],
    ) -> Result<HashMap<String, String>, RequestError> {
        let page_size = self.policy().await?.records_page_size.max(1) as usize;
        let mut names = HashMap::with_capacity(tokens.len());
        for chunk in tokens.chunks(page_size) {
            let reply = self.records(chunk).await?;
            for (token, record) in reply.records {
                if let Some(name) = decode_proposal_name(&record.files) {
                    names.insert(token, name);
                }
            }
        }
        Ok(names)
    }
}

fn decode_proposal_name(files: &[crate::api::RecordFile]) -> Option<String> {
    let file = files.iter().find(|f| f.name == FILE_PROPOSAL_METADATA)?;
    let payload = base64::engine::general_purpose::STANDARD
        .decode(&file.payload)
        .ok()?;
    let metadata: ProposalMetadata = serde_json::from_slice(&payload).ok()?;
    Some(metadata.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_error_journal_round_trip() {
        let err = RetryError {
            at: "status".to_string(),
            code: 503,
            body: "overloaded".to_string(),
            err: String::new(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: RetryError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn proposal_name_decodes_from_base64_payload() {
        let payload = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&ProposalMetadata { name: "Fund the thing".to_string() }).unwrap());
        let files = vec![crate::api::RecordFile {
            name: FILE_PROPOSAL_METADATA.to_string(),
            payload,
        }];
        assert_eq!(decode_proposal_name(&files).as_deref(), Some("Fund the thing"));
        assert!(decode_proposal_name(&[]).is_none());
    }
}
