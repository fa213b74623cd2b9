//! JSON-RPC chain client.
//!
//! Two HTTP endpoints back the client: one for calls and raw-transaction
//! sends, and one that is the source of truth for the reporter's nonce
//! (`eth_getTransactionCount`). They may point at different nodes, which is
//! why the nonce endpoint is its own config key rather than derived from the
//! send endpoint. WebSocket subscriptions are opened separately by the event
//! subscriber.
//!
//! The client performs no retries; retry policy belongs to the caller.

pub mod abi;

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::{RpcError, TransportError};
use thiserror::Error;
use tracing::debug;

/// Failure classes for chain operations. `Rpc` carries the node-reported
/// message verbatim so callers can match on it (the nonce-too-low check is a
/// substring match, as the node does not return a structured code).
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("signing error: {0}")]
    Sign(String),
}

impl ChainError {
    /// True when the node rejected a submission because the nonce was
    /// already consumed.
    pub fn is_nonce_too_low(&self) -> bool {
        matches!(self, ChainError::Rpc(msg) if msg.contains("nonce too low"))
    }
}

impl From<TransportError> for ChainError {
    fn from(err: TransportError) -> Self {
        match err {
            RpcError::ErrorResp(payload) => ChainError::Rpc(payload.to_string()),
            RpcError::DeserError { err, .. } => ChainError::Decode(err.to_string()),
            other => ChainError::Transport(other.to_string()),
        }
    }
}

impl From<abi::AbiError> for ChainError {
    fn from(err: abi::AbiError) -> Self {
        ChainError::Decode(err.to_string())
    }
}

/// Errors parsing the reporter key material from the secrets backend.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("secret is not valid UTF-8")]
    NotUtf8,
    #[error("failed to decode hex private key: {0}")]
    Hex(#[from] alloy::hex::FromHexError),
    #[error("invalid key length ({0} bytes), should be 32 bytes")]
    Length(usize),
    #[error("invalid secp256k1 scalar: {0}")]
    Scalar(String),
}

/// Parse the secrets-backend payload (ASCII hex of a 32-byte scalar) into a
/// signer. The signer's address is the Keccak-256 of the uncompressed
/// public key, low 20 bytes: the reporter's on-chain identity.
pub fn signer_from_secret(raw: &[u8]) -> Result<PrivateKeySigner, KeyError> {
    let text = std::str::from_utf8(raw).map_err(|_| KeyError::NotUtf8)?;
    let bytes = alloy::hex::decode(text.trim())?;

    if bytes.len() != 32 {
        return Err(KeyError::Length(bytes.len()));
    }

    PrivateKeySigner::from_slice(&bytes).map_err(|e| KeyError::Scalar(e.to_string()))
}

/// HTTP chain client bound to the reporter's signing key.
pub struct ChainClient {
    rpc: DynProvider,
    nonce_rpc: DynProvider,
    signer: PrivateKeySigner,
    chain_id: u64,
    outcome_reporter: Address,
}

impl ChainClient {
    /// Connect both HTTP endpoints and fetch the chain id for EIP-155
    /// signature binding. When the nonce endpoint is the same URL the
    /// provider is shared.
    pub async fn connect(
        json_rpc_url: &str,
        nonce_rpc_url: &str,
        outcome_reporter: Address,
        signer: PrivateKeySigner,
    ) -> Result<Self, ChainError> {
        let rpc = ProviderBuilder::new()
            .connect(json_rpc_url)
            .await
            .map_err(ChainError::from)?
            .erased();

        let nonce_rpc = if nonce_rpc_url == json_rpc_url {
            rpc.clone()
        } else {
            ProviderBuilder::new()
                .connect(nonce_rpc_url)
                .await
                .map_err(ChainError::from)?
                .erased()
        };

        let chain_id = rpc.get_chain_id().await?;
        debug!(chain_id, rpc = json_rpc_url, nonce_rpc = nonce_rpc_url, "chain client connected");

        Ok(Self {
            rpc,
            nonce_rpc,
            signer,
            chain_id,
            outcome_reporter,
        })
    }

    /// The reporter's address, derived from the signing key.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Read the on-chain `_votingPeriod()` value from the outcome-reporter
    /// contract.
    pub async fn voting_period(&self) -> Result<u64, ChainError> {
        let tx = TransactionRequest {
            to: Some(TxKind::Call(self.outcome_reporter)),
            input: abi::voting_period_call().into(),
            ..Default::default()
        };

        let ret = self.rpc.call(tx).await?;
        let period = abi::decode_uint256(&ret)?;

        u64::try_from(period).map_err(|_| ChainError::Decode("voting period exceeds u64".into()))
    }

    /// Current transaction count of the reporter address at `latest`,
    /// fetched from the nonce endpoint.
    pub async fn transaction_count(&self) -> Result<u64, ChainError> {
        Ok(self.nonce_rpc.get_transaction_count(self.address()).await?)
    }

    /// Sign a legacy transaction with the given parameters and submit it
    /// via `eth_sendRawTransaction`. Returns the transaction hash without
    /// waiting for inclusion.
    pub async fn submit(
        &self,
        to: Address,
        input: Bytes,
        gas_price: u128,
        gas_limit: u64,
        nonce: u64,
    ) -> Result<B256, ChainError> {
        let mut tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce,
            gas_price,
            gas_limit,
            to: TxKind::Call(to),
            value: U256::ZERO,
            input,
        };

        let signature = self
            .signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| ChainError::Sign(e.to_string()))?;

        let encoded = TxEnvelope::from(tx.into_signed(signature)).encoded_2718();
        let pending = self.rpc.send_raw_transaction(&encoded).await?;

        Ok(*pending.tx_hash())
    }

    /// Fetch the receipt for a transaction, `None` while still pending.
    pub async fn receipt(&self, tx_hash: B256) -> Result<Option<TransactionReceipt>, ChainError> {
        Ok(self.rpc.get_transaction_receipt(tx_hash).await?)
    }
}
