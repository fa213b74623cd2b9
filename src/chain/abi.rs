//! Minimal ABI surface for the outcome-reporter contracts.
//!
//! Covers just the two events and four functions the agent touches.
//! Topic-0 hashes and 4-byte selectors are derived once at startup from the
//! canonical signatures instead of carrying a generated ABI blob; decoding
//! walks the raw 32-byte words of the log data.

use alloy::primitives::{Bytes, B256, U256};
use std::sync::LazyLock;
use thiserror::Error;

// ─── Event signatures ────────────────────────────────────────────────────────

/// ProposeOutcome(bytes32 marketHash, uint8 outcome, uint256 blockTime),
/// all parameters non-indexed (packed in `data`).
pub const PROPOSE_OUTCOME_EVENT: &str = "ProposeOutcome(bytes32,uint8,uint256)";

/// OutcomeReported(bytes32 marketHash, uint8 outcome), non-indexed.
pub const OUTCOME_REPORTED_EVENT: &str = "OutcomeReported(bytes32,uint8)";

pub static PROPOSE_OUTCOME_TOPIC: LazyLock<B256> =
    LazyLock::new(|| keccak256(PROPOSE_OUTCOME_EVENT.as_bytes()));

pub static OUTCOME_REPORTED_TOPIC: LazyLock<B256> =
    LazyLock::new(|| keccak256(OUTCOME_REPORTED_EVENT.as_bytes()));

// ─── Function signatures ─────────────────────────────────────────────────────

const PROPOSE_OUTCOME_FN: &str = "proposeOutcome(bytes32,uint8)";
const VOTE_OUTCOME_FN: &str = "voteOutcome(bytes32,uint8)";
const REPORT_OUTCOME_FN: &str = "reportOutcome(bytes32)";
const VOTING_PERIOD_FN: &str = "_votingPeriod()";

#[derive(Error, Debug)]
pub enum AbiError {
    #[error("log data too short: expected {expected} bytes, got {got}")]
    ShortData { expected: usize, got: usize },
    #[error("non-zero padding in uint8 word")]
    DirtyPadding,
    #[error("uint256 value does not fit in u64")]
    Overflow,
    #[error("return data is not a single 32-byte word: got {0} bytes")]
    BadReturn(usize),
}

/// Compute keccak256 of a byte slice.
pub fn keccak256(data: &[u8]) -> B256 {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}

/// First four bytes of the keccak256 of a function signature.
fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn uint8_word(value: u8) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[31] = value;
    word
}

/// Calldata for `proposeOutcome(bytes32,uint8)`.
pub fn propose_outcome_call(market_hash: B256, outcome: u8) -> Bytes {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&selector(PROPOSE_OUTCOME_FN));
    data.extend_from_slice(market_hash.as_slice());
    data.extend_from_slice(&uint8_word(outcome));
    data.into()
}

/// Calldata for `voteOutcome(bytes32,uint8)`.
pub fn vote_outcome_call(market_hash: B256, outcome: u8) -> Bytes {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&selector(VOTE_OUTCOME_FN));
    data.extend_from_slice(market_hash.as_slice());
    data.extend_from_slice(&uint8_word(outcome));
    data.into()
}

/// Calldata for `reportOutcome(bytes32)`.
pub fn report_outcome_call(market_hash: B256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&selector(REPORT_OUTCOME_FN));
    data.extend_from_slice(market_hash.as_slice());
    data.into()
}

/// Calldata for the `_votingPeriod()` view.
pub fn voting_period_call() -> Bytes {
    selector(VOTING_PERIOD_FN).to_vec().into()
}

fn decode_uint8_word(word: &[u8]) -> Result<u8, AbiError> {
    if word[..31].iter().any(|b| *b != 0) {
        return Err(AbiError::DirtyPadding);
    }
    Ok(word[31])
}

/// Decode `(marketHash, outcome, blockTime)` from ProposeOutcome log data.
pub fn decode_propose_outcome(data: &[u8]) -> Result<(B256, u8, u64), AbiError> {
    if data.len() < 96 {
        return Err(AbiError::ShortData {
            expected: 96,
            got: data.len(),
        });
    }

    let market_hash = B256::from_slice(&data[0..32]);
    let outcome = decode_uint8_word(&data[32..64])?;
    let block_time: u64 = U256::from_be_slice(&data[64..96])
        .try_into()
        .map_err(|_| AbiError::Overflow)?;

    Ok((market_hash, outcome, block_time))
}

/// Decode `(marketHash, outcome)` from OutcomeReported log data.
pub fn decode_outcome_reported(data: &[u8]) -> Result<(B256, u8), AbiError> {
    if data.len() < 64 {
        return Err(AbiError::ShortData {
            expected: 64,
            got: data.len(),
        });
    }

    let market_hash = B256::from_slice(&data[0..32]);
    let outcome = decode_uint8_word(&data[32..64])?;

    Ok((market_hash, outcome))
}

/// Decode a single `uint256` return value (the `_votingPeriod()` result).
pub fn decode_uint256(data: &[u8]) -> Result<U256, AbiError> {
    if data.len() != 32 {
        return Err(AbiError::BadReturn(data.len()));
    }
    Ok(U256::from_be_slice(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::b256;

    #[test]
    fn test_keccak_known_vectors() {
        // keccak256 of the empty input.
        assert_eq!(
            keccak256(b""),
            b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
        // The ubiquitous ERC-20 Transfer topic.
        assert_eq!(
            keccak256(b"Transfer(address,address,uint256)"),
            b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
        );
    }

    #[test]
    fn test_selector_known_vector() {
        // ERC-20 transfer(address,uint256) = 0xa9059cbb.
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_propose_outcome_call_layout() {
        let hash = B256::repeat_byte(0xab);
        let data = propose_outcome_call(hash, 2);

        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[0..4], selector(PROPOSE_OUTCOME_FN).as_slice());
        assert_eq!(&data[4..36], hash.as_slice());
        // uint8 is right-aligned in its word
        assert!(data[36..67].iter().all(|b| *b == 0));
        assert_eq!(data[67], 2);
    }

    #[test]
    fn test_report_outcome_call_layout() {
        let hash = B256::repeat_byte(0xcd);
        let data = report_outcome_call(hash);

        assert_eq!(data.len(), 4 + 32);
        assert_eq!(&data[0..4], selector(REPORT_OUTCOME_FN).as_slice());
        assert_eq!(&data[4..36], hash.as_slice());
    }

    #[test]
    fn test_decode_propose_outcome_roundtrip() {
        let hash = B256::repeat_byte(0xcd);
        let mut data = Vec::new();
        data.extend_from_slice(hash.as_slice());
        data.extend_from_slice(&uint8_word(3));
        data.extend_from_slice(&U256::from(1000u64).to_be_bytes::<32>());

        let (market_hash, outcome, block_time) = decode_propose_outcome(&data).unwrap();
        assert_eq!(market_hash, hash);
        assert_eq!(outcome, 3);
        assert_eq!(block_time, 1000);
    }

    #[test]
    fn test_decode_propose_outcome_short_data() {
        let err = decode_propose_outcome(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, AbiError::ShortData { expected: 96, got: 64 }));
    }

    #[test]
    fn test_decode_outcome_reported() {
        let hash = B256::repeat_byte(0x11);
        let mut data = Vec::new();
        data.extend_from_slice(hash.as_slice());
        data.extend_from_slice(&uint8_word(1));

        let (market_hash, outcome) = decode_outcome_reported(&data).unwrap();
        assert_eq!(market_hash, hash);
        assert_eq!(outcome, 1);
    }

    #[test]
    fn test_decode_rejects_dirty_uint8_padding() {
        let mut data = vec![0u8; 64];
        data[33] = 0xff; // garbage in the outcome word's padding
        assert!(matches!(
            decode_outcome_reported(&data),
            Err(AbiError::DirtyPadding)
        ));
    }

    #[test]
    fn test_decode_uint256() {
        let word = U256::from(600u64).to_be_bytes::<32>();
        assert_eq!(decode_uint256(&word).unwrap(), U256::from(600u64));
        assert!(matches!(decode_uint256(&[0u8; 31]), Err(AbiError::BadReturn(31))));
    }

    #[test]
    fn test_event_topics_differ() {
        assert_ne!(*PROPOSE_OUTCOME_TOPIC, *OUTCOME_REPORTED_TOPIC);
    }
}
