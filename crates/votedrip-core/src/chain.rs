//! Chain-side helpers: ticket hashes, network parameters, and the minimal
//! transaction parsing needed to recover a ticket's payout commitment
//! address.
//!
//! The core never talks to the chain directly. The wallet hands back raw
//! ticket-purchase transactions; this module extracts the commitment script
//! from the second output and turns it into a payout address.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a ticket hash in bytes.
pub const TICKET_HASH_SIZE: usize = 32;

/// Opcode that starts a payout commitment script.
const OP_RETURN: u8 = 0x6a;
/// Push opcode for the 30-byte commitment payload.
const OP_DATA_30: u8 = 0x1e;
/// Length of the commitment payload: 20-byte hash, 8-byte amount, 2-byte
/// fee limits.
const COMMITMENT_LEN: usize = 30;

const BASE58_ALPHABET: &[u8; 58] =
    b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Errors from chain-side parsing and encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChainError {
    /// A ticket hash string or byte slice had the wrong shape.
    #[error("invalid ticket hash: {0}")]
    InvalidTicketHash(String),

    /// Transaction bytes ended before the structure was complete.
    #[error("transaction truncated at byte {offset}")]
    TruncatedTransaction {
        /// Offset the parser was reading when input ran out.
        offset: usize,
    },

    /// The transaction does not carry a payout commitment output.
    #[error("transaction has no commitment output (outputs: {outputs})")]
    MissingCommitment {
        /// Number of outputs found.
        outputs: usize,
    },

    /// The commitment script did not have the expected opcodes or length.
    #[error("malformed commitment script")]
    MalformedCommitment,

    /// An address failed base58check decoding or prefix validation.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The offending address.
        address: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// A 32-byte content hash identifying a stake credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketHash([u8; TICKET_HASH_SIZE]);

impl TicketHash {
    /// Creates a ticket hash from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::InvalidTicketHash`] when the slice is not
    /// exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let arr: [u8; TICKET_HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| ChainError::InvalidTicketHash(format!("{} bytes", bytes.len())))?;
        Ok(Self(arr))
    }

    /// Parses a hex-encoded ticket hash.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::InvalidTicketHash`] for malformed hex or wrong
    /// length.
    pub fn from_hex(s: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(s).map_err(|e| ChainError::InvalidTicketHash(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Raw hash bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TICKET_HASH_SIZE] {
        &self.0
    }
}

impl From<[u8; TICKET_HASH_SIZE]> for TicketHash {
    fn from(arr: [u8; TICKET_HASH_SIZE]) -> Self {
        Self(arr)
    }
}

impl std::fmt::Display for TicketHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl TryFrom<String> for TicketHash {
    type Error = ChainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<TicketHash> for String {
    fn from(h: TicketHash) -> Self {
        h.to_string()
    }
}

/// Converts a list of hex ticket hashes into typed hashes.
///
/// # Errors
///
/// Fails on the first malformed hash.
pub fn convert_ticket_hashes(hashes: &[String]) -> Result<Vec<TicketHash>, ChainError> {
    hashes.iter().map(|h| TicketHash::from_hex(h)).collect()
}

/// Per-network chain parameters the scheduler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    /// Network name.
    pub name: &'static str,
    /// Expected wall-clock time between blocks.
    pub target_block_time: Duration,
    /// Two-byte base58check prefix of pay-to-pubkey-hash addresses.
    pub p2pkh_prefix: [u8; 2],
}

/// Main network parameters.
pub const MAINNET: Network = Network {
    name: "mainnet",
    target_block_time: Duration::from_secs(5 * 60),
    p2pkh_prefix: [0x07, 0x3f],
};

/// Test network parameters.
pub const TESTNET: Network = Network {
    name: "testnet",
    target_block_time: Duration::from_secs(2 * 60),
    p2pkh_prefix: [0x0f, 0x21],
};

impl Network {
    /// Looks a network up by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mainnet" => Some(MAINNET),
            "testnet" => Some(TESTNET),
            _ => None,
        }
    }

    /// Estimated wall-clock duration of `blocks` blocks.
    #[must_use]
    pub fn blocks_duration(&self, blocks: u64) -> Duration {
        self.target_block_time * u32::try_from(blocks).unwrap_or(u32::MAX)
    }
}

/// A parsed transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Output value in atoms.
    pub value: u64,
    /// Output script.
    pub pk_script: Vec<u8>,
}

struct TxReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TxReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ChainError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ChainError::TruncatedTransaction { offset: self.pos })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32_le(&mut self) -> Result<u32, ChainError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self) -> Result<u64, ChainError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    // Compact-size integer: 1-byte literal below 0xfd, then 0xfd/0xfe/0xff
    // prefixed 16/32/64-bit little-endian values.
    fn compact_size(&mut self) -> Result<u64, ChainError> {
        let first = self.take(1)?[0];
        match first {
            0xfd => {
                let b = self.take(2)?;
                Ok(u64::from(u16::from_le_bytes([b[0], b[1]])))
            }
            0xfe => Ok(u64::from(self.u32_le()?)),
            0xff => self.u64_le(),
            n => Ok(u64::from(n)),
        }
    }

    fn var_bytes(&mut self) -> Result<&'a [u8], ChainError> {
        let len = self.compact_size()?;
        let len = usize::try_from(len)
            .map_err(|_| ChainError::TruncatedTransaction { offset: self.pos })?;
        self.take(len)
    }
}

/// Parses the outputs of a serialized ticket-purchase transaction.
///
/// Wire layout: `version u32 ‖ varint(n_in) ‖ n_in × input ‖ varint(n_out) ‖
/// n_out × (value u64 ‖ varbytes script)` where an input is
/// `prev_hash[32] ‖ prev_index u32 ‖ varbytes sig_script ‖ sequence u32`.
///
/// # Errors
///
/// Returns [`ChainError::TruncatedTransaction`] when the bytes end early.
pub fn parse_ticket_outputs(raw: &[u8]) -> Result<Vec<TxOut>, ChainError> {
    let mut r = TxReader::new(raw);
    let _version = r.u32_le()?;

    let n_in = r.compact_size()?;
    for _ in 0..n_in {
        let _prev_hash = r.take(32)?;
        let _prev_index = r.u32_le()?;
        let _sig_script = r.var_bytes()?;
        let _sequence = r.u32_le()?;
    }

    let n_out = r.compact_size()?;
    let mut outputs = Vec::with_capacity(usize::try_from(n_out).unwrap_or(0));
    for _ in 0..n_out {
        let value = r.u64_le()?;
        let pk_script = r.var_bytes()?.to_vec();
        outputs.push(TxOut { value, pk_script });
    }
    Ok(outputs)
}

/// Recovers the payout address committed to by a ticket purchase.
///
/// The commitment lives in the second output and has the shape
/// `OP_RETURN OP_DATA_30 <hash160[20] ‖ amount[8] ‖ limits[2]>`.
///
/// # Errors
///
/// Returns [`ChainError::MissingCommitment`] when there is no second output
/// and [`ChainError::MalformedCommitment`] when its script does not match.
pub fn commitment_address(outputs: &[TxOut], network: &Network) -> Result<String, ChainError> {
    let out = outputs.get(1).ok_or(ChainError::MissingCommitment {
        outputs: outputs.len(),
    })?;
    let script = &out.pk_script;
    if script.len() != 2 + COMMITMENT_LEN || script[0] != OP_RETURN || script[1] != OP_DATA_30 {
        return Err(ChainError::MalformedCommitment);
    }
    let hash160 = &script[2..22];
    Ok(encode_address(hash160, network.p2pkh_prefix))
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    [second[0], second[1], second[2], second[3]]
}

/// Base58check-encodes a 20-byte pubkey hash under a two-byte prefix.
#[must_use]
pub fn encode_address(hash160: &[u8], prefix: [u8; 2]) -> String {
    let mut payload = Vec::with_capacity(2 + hash160.len() + 4);
    payload.extend_from_slice(&prefix);
    payload.extend_from_slice(hash160);
    let check = checksum(&payload);
    payload.extend_from_slice(&check);
    base58_encode(&payload)
}

/// Decodes a base58check address and validates it against the network
/// prefix.
///
/// # Errors
///
/// Returns [`ChainError::InvalidAddress`] on bad characters, checksum
/// mismatch, wrong length, or wrong network prefix.
pub fn decode_address(address: &str, network: &Network) -> Result<[u8; 20], ChainError> {
    let invalid = |reason: &str| ChainError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let payload = base58_decode(address).ok_or_else(|| invalid("not base58"))?;
    if payload.len() != 2 + 20 + 4 {
        return Err(invalid("wrong payload length"));
    }
    let (body, check) = payload.split_at(payload.len() - 4);
    if checksum(body) != check {
        return Err(invalid("checksum mismatch"));
    }
    if body[..2] != network.p2pkh_prefix {
        return Err(invalid("wrong network prefix"));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&body[2..]);
    Ok(hash)
}

fn base58_encode(input: &[u8]) -> String {
    let zeros = input.iter().take_while(|b| **b == 0).count();
    // Repeated division by 58 over the big-endian byte string.
    let mut digits: Vec<u8> = Vec::with_capacity(input.len() * 138 / 100 + 1);
    for &byte in input {
        let mut carry = u32::from(byte);
        for digit in &mut digits {
            carry += u32::from(*digit) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let mut out = String::with_capacity(zeros + digits.len());
    for _ in 0..zeros {
        out.push('1');
    }
    for &digit in digits.iter().rev() {
        out.push(BASE58_ALPHABET[digit as usize] as char);
    }
    out
}

fn base58_decode(input: &str) -> Option<Vec<u8>> {
    let zeros = input.bytes().take_while(|b| *b == b'1').count();
    // Little-endian accumulator; multiply-add one base58 digit at a time.
    let mut bytes: Vec<u8> = Vec::with_capacity(input.len());
    for c in input.bytes().skip(zeros) {
        let value = BASE58_ALPHABET.iter().position(|a| *a == c)? as u32;
        let mut carry = value;
        for byte in &mut bytes {
            carry += u32::from(*byte) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_ticket_tx(hash160: &[u8; 20]) -> Vec<u8> {
        let mut tx = Vec::new();
        tx.extend_from_slice(&1u32.to_le_bytes()); // version
        tx.push(1); // one input
        tx.extend_from_slice(&[0u8; 32]); // prev hash
        tx.extend_from_slice(&0u32.to_le_bytes()); // prev index
        tx.push(0); // empty sig script
        tx.extend_from_slice(&u32::MAX.to_le_bytes()); // sequence
        tx.push(2); // two outputs
        // Output 0: the stake submission itself.
        tx.extend_from_slice(&5000u64.to_le_bytes());
        tx.push(1);
        tx.push(0xba);
        // Output 1: the payout commitment.
        tx.extend_from_slice(&0u64.to_le_bytes());
        tx.push(32);
        tx.push(OP_RETURN);
        tx.push(OP_DATA_30);
        tx.extend_from_slice(hash160);
        tx.extend_from_slice(&[0u8; 10]); // amount + limits
        tx
    }

    #[test]
    fn ticket_hash_hex_round_trip() {
        let hash = TicketHash::from([7u8; 32]);
        let parsed = TicketHash::from_hex(&hash.to_string()).unwrap();
        assert_eq!(hash, parsed);

        assert!(TicketHash::from_hex("abcd").is_err());
        assert!(TicketHash::from_hex("zz").is_err());
    }

    #[test]
    fn parse_and_recover_commitment_address() {
        let hash160 = [0x11u8; 20];
        let tx = fake_ticket_tx(&hash160);
        let outputs = parse_ticket_outputs(&tx).unwrap();
        assert_eq!(outputs.len(), 2);

        let address = commitment_address(&outputs, &MAINNET).unwrap();
        let decoded = decode_address(&address, &MAINNET).unwrap();
        assert_eq!(decoded, hash160);

        // Decoding under the wrong network fails on the prefix.
        assert!(decode_address(&address, &TESTNET).is_err());
    }

    #[test]
    fn truncated_transaction_is_rejected() {
        let tx = fake_ticket_tx(&[0u8; 20]);
        let err = parse_ticket_outputs(&tx[..tx.len() - 5]).unwrap_err();
        assert!(matches!(err, ChainError::TruncatedTransaction { .. }));
    }

    #[test]
    fn base58check_round_trip() {
        for fill in [0x00u8, 0x01, 0x7f, 0xff] {
            let address = encode_address(&[fill; 20], MAINNET.p2pkh_prefix);
            let decoded = decode_address(&address, &MAINNET).unwrap();
            assert_eq!(decoded, [fill; 20]);
        }
    }

    #[test]
    fn checksum_tamper_is_detected() {
        let mut address = encode_address(&[0x42; 20], MAINNET.p2pkh_prefix);
        // Flip the final character to another alphabet member.
        let last = address.pop().unwrap();
        address.push(if last == '2' { '3' } else { '2' });
        assert!(decode_address(&address, &MAINNET).is_err());
    }
}
