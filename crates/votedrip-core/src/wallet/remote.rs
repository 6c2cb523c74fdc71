//! gRPC wallet client.
//!
//! The wallet protocol is small enough that the message types are written
//! out by hand with prost derives instead of being generated at build time;
//! each RPC goes through the low-level unary helper with its full method
//! path. The channel authenticates both ways: the wallet's certificate is
//! pinned as the CA and the client presents its own keypair.

use std::path::Path;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use prost::Message;
use tonic::codec::ProstCodec;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tonic::{client::Grpc, Request};

use super::{AddressInfo, SignRequest, TicketAddress, Wallet, WalletError};
use crate::chain::TicketHash;

#[derive(Clone, PartialEq, Message)]
struct AccountsRequest {}

#[derive(Clone, PartialEq, Message)]
struct AccountsResponse {
    #[prost(uint32, tag = "1")]
    current_block_height: u32,
}

#[derive(Clone, PartialEq, Message)]
struct BestBlockRequest {}

#[derive(Clone, PartialEq, Message)]
struct BestBlockResponse {
    #[prost(uint32, tag = "1")]
    height: u32,
}

#[derive(Clone, PartialEq, Message)]
struct GetAccountExtendedPrivKeyRequest {
    #[prost(uint32, tag = "1")]
    account_number: u32,
    #[prost(bytes = "vec", tag = "2")]
    passphrase: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct GetAccountExtendedPrivKeyResponse {
    #[prost(string, tag = "1")]
    acct_extended_priv_key: String,
}

#[derive(Clone, PartialEq, Message)]
struct CommittedTicketsRequest {
    #[prost(bytes = "vec", repeated, tag = "1")]
    tickets: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
struct TicketAddressPair {
    #[prost(bytes = "vec", tag = "1")]
    ticket: Vec<u8>,
    #[prost(string, tag = "2")]
    address: String,
}

#[derive(Clone, PartialEq, Message)]
struct CommittedTicketsResponse {
    #[prost(message, repeated, tag = "1")]
    ticket_addresses: Vec<TicketAddressPair>,
}

#[derive(Clone, PartialEq, Message)]
struct GetTransactionRequest {
    #[prost(bytes = "vec", tag = "1")]
    transaction_hash: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct TransactionDetails {
    #[prost(bytes = "vec", tag = "1")]
    hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    transaction: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct GetTransactionResponse {
    #[prost(message, optional, tag = "1")]
    transaction: Option<TransactionDetails>,
}

#[derive(Clone, PartialEq, Message)]
struct ValidateAddressRequest {
    #[prost(string, tag = "1")]
    address: String,
}

#[derive(Clone, PartialEq, Message)]
struct ValidateAddressResponse {
    #[prost(bool, tag = "1")]
    is_valid: bool,
    #[prost(uint32, tag = "2")]
    account_number: u32,
}

#[derive(Clone, PartialEq, Message)]
struct SignMessage {
    #[prost(string, tag = "1")]
    address: String,
    #[prost(string, tag = "2")]
    message: String,
}

#[derive(Clone, PartialEq, Message)]
struct SignMessagesRequest {
    #[prost(bytes = "vec", tag = "1")]
    passphrase: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    messages: Vec<SignMessage>,
}

#[derive(Clone, PartialEq, Message)]
struct SignReply {
    #[prost(bytes = "vec", tag = "1")]
    signature: Vec<u8>,
    #[prost(string, tag = "2")]
    error: String,
}

#[derive(Clone, PartialEq, Message)]
struct SignMessagesResponse {
    #[prost(message, repeated, tag = "1")]
    replies: Vec<SignReply>,
}

const SERVICE: &str = "walletrpc.WalletService";

/// Wallet client over an authenticated gRPC channel.
#[derive(Debug, Clone)]
pub struct RemoteWallet {
    inner: Grpc<Channel>,
}

impl RemoteWallet {
    /// Connects to the wallet with mutual TLS.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Credentials`] when certificate material cannot
    /// be read and [`WalletError::Transport`] when the channel fails to
    /// connect.
    pub async fn connect(
        host: &str,
        wallet_cert: &Path,
        client_cert: &Path,
        client_key: &Path,
    ) -> Result<Self, WalletError> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| WalletError::Credentials(format!("{}: {e}", path.display())))
        };
        let ca = Certificate::from_pem(read(wallet_cert)?);
        let identity = Identity::from_pem(read(client_cert)?, read(client_key)?);
        let tls = ClientTlsConfig::new()
            .ca_certificate(ca)
            .identity(identity);

        let channel = Channel::from_shared(format!("https://{host}"))
            .map_err(|e| WalletError::Transport(e.to_string()))?
            .tls_config(tls)
            .map_err(|e| WalletError::Transport(e.to_string()))?
            .connect()
            .await
            .map_err(|e| WalletError::Transport(e.to_string()))?;
        Ok(Self {
            inner: Grpc::new(channel),
        })
    }

    async fn unary<Req, Resp>(&self, method: &'static str, request: Req) -> Result<Resp, WalletError>
    where
        Req: Message + 'static,
        Resp: Message + Default + 'static,
    {
        let mut grpc = self.inner.clone();
        grpc.ready()
            .await
            .map_err(|e| WalletError::Transport(e.to_string()))?;

        let path = PathAndQuery::from_maybe_shared(format!("/{SERVICE}/{method}"))
            .map_err(|e| WalletError::Transport(e.to_string()))?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        grpc.unary(Request::new(request), path, codec)
            .await
            .map(tonic::Response::into_inner)
            .map_err(|status| WalletError::Rpc {
                method,
                message: status.message().to_string(),
            })
    }
}

#[async_trait]
impl Wallet for RemoteWallet {
    async fn current_height(&self) -> Result<u32, WalletError> {
        let resp: AccountsResponse = self.unary("Accounts", AccountsRequest {}).await?;
        Ok(resp.current_block_height)
    }

    async fn best_block(&self) -> Result<u32, WalletError> {
        let resp: BestBlockResponse = self.unary("BestBlock", BestBlockRequest {}).await?;
        Ok(resp.height)
    }

    async fn verify_passphrase(&self, account: u32, passphrase: &[u8]) -> Result<(), WalletError> {
        // The reply's key material is dropped on the floor; this call exists
        // to prove the passphrase unlocks the account before any ballot is
        // built.
        let _: GetAccountExtendedPrivKeyResponse = self
            .unary(
                "GetAccountExtendedPrivKey",
                GetAccountExtendedPrivKeyRequest {
                    account_number: account,
                    passphrase: passphrase.to_vec(),
                },
            )
            .await?;
        Ok(())
    }

    async fn committed_tickets(
        &self,
        tickets: &[TicketHash],
    ) -> Result<Vec<TicketAddress>, WalletError> {
        let request = CommittedTicketsRequest {
            tickets: tickets.iter().map(|t| t.as_bytes().to_vec()).collect(),
        };
        let resp: CommittedTicketsResponse = self.unary("CommittedTickets", request).await?;
        resp.ticket_addresses
            .into_iter()
            .map(|pair| {
                let ticket = TicketHash::from_bytes(&pair.ticket).map_err(|e| WalletError::Rpc {
                    method: "CommittedTickets",
                    message: e.to_string(),
                })?;
                Ok(TicketAddress {
                    ticket,
                    address: pair.address,
                })
            })
            .collect()
    }

    async fn transaction(&self, hash: &TicketHash) -> Result<Vec<u8>, WalletError> {
        let resp: GetTransactionResponse = self
            .unary(
                "GetTransaction",
                GetTransactionRequest {
                    transaction_hash: hash.as_bytes().to_vec(),
                },
            )
            .await?;
        resp.transaction
            .map(|tx| tx.transaction)
            .ok_or(WalletError::Rpc {
                method: "GetTransaction",
                message: "transaction not found".to_string(),
            })
    }

    async fn validate_address(&self, address: &str) -> Result<AddressInfo, WalletError> {
        let resp: ValidateAddressResponse = self
            .unary(
                "ValidateAddress",
                ValidateAddressRequest {
                    address: address.to_string(),
                },
            )
            .await?;
        Ok(AddressInfo {
            is_valid: resp.is_valid,
            account_number: resp.account_number,
        })
    }

    async fn sign_messages(
        &self,
        passphrase: &[u8],
        requests: &[SignRequest],
    ) -> Result<Vec<Vec<u8>>, WalletError> {
        let request = SignMessagesRequest {
            passphrase: passphrase.to_vec(),
            messages: requests
                .iter()
                .map(|r| SignMessage {
                    address: r.address.clone(),
                    message: r.message.clone(),
                })
                .collect(),
        };
        let resp: SignMessagesResponse = self.unary("SignMessages", request).await?;
        resp.replies
            .into_iter()
            .enumerate()
            .map(|(index, reply)| {
                if reply.error.is_empty() {
                    Ok(reply.signature)
                } else {
                    Err(WalletError::Signature {
                        index,
                        message: reply.error,
                    })
                }
            })
            .collect()
    }
}
