//! Outcome oracle client.
//!
//! The oracle is the agent's only source of truth when voting on a peer's
//! proposal. Any failure here means the vote for that market is skipped:
//! voting is opportunistic and never retried; the report stage is
//! authoritative regardless.

use alloy::primitives::B256;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("verify request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("got non-200 response from verify market call with status {0}")]
    Status(reqwest::StatusCode),
    #[error("verified outcome {0} does not fit uint8")]
    OutcomeRange(i32),
}

/// Response body of `GET {base}/{marketHash}`, field names as the oracle
/// emits them.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(rename = "Outcome")]
    outcome: i32,
    #[serde(rename = "Timestamp")]
    timestamp: i64,
}

#[derive(Clone)]
pub struct VerifierClient {
    base_url: String,
    client: reqwest::Client,
}

impl VerifierClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Derive the outcome to vote for on the given market.
    pub async fn verify(&self, market_hash: B256) -> Result<u8, VerifyError> {
        let url = format!("{}/{}", self.base_url, market_hash);
        let response = self.client.get(&url).send().await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(VerifyError::Status(response.status()));
        }

        let data: VerifyResponse = response.json().await?;
        debug!(
            market = %market_hash,
            outcome = data.outcome,
            timestamp = data.timestamp,
            "verified market outcome"
        );

        u8::try_from(data.outcome).map_err(|_| VerifyError::OutcomeRange(data.outcome))
    }
}

/// Minimal canned-response HTTP server for oracle tests. Serves every
/// connection the same status and body.
#[cfg(test)]
pub(crate) async fn spawn_oracle_stub(status_line: &'static str, body: &'static str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });

    format!("http://{}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_hash_url_form() {
        // the oracle sees the 0x-prefixed lowercase hex form
        let hash = B256::repeat_byte(0xab);
        assert_eq!(
            format!("{}", hash),
            format!("0x{}", "ab".repeat(32))
        );
    }

    #[tokio::test]
    async fn test_verify_parses_outcome() {
        let base = spawn_oracle_stub("200 OK", r#"{"Outcome": 3, "Timestamp": 1700000000}"#).await;
        let client = VerifierClient::new(base);

        let outcome = client.verify(B256::repeat_byte(0xcd)).await.unwrap();
        assert_eq!(outcome, 3);
    }

    #[tokio::test]
    async fn test_verify_rejects_non_200() {
        let base = spawn_oracle_stub("500 Internal Server Error", "oops").await;
        let client = VerifierClient::new(base);

        let err = client.verify(B256::repeat_byte(0xcd)).await.unwrap_err();
        assert!(matches!(err, VerifyError::Status(s) if s.as_u16() == 500));
    }

    #[tokio::test]
    async fn test_verify_rejects_malformed_body() {
        let base = spawn_oracle_stub("200 OK", "not-json").await;
        let client = VerifierClient::new(base);

        assert!(matches!(
            client.verify(B256::repeat_byte(0xcd)).await,
            Err(VerifyError::Http(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_rejects_out_of_range_outcome() {
        let base = spawn_oracle_stub("200 OK", r#"{"Outcome": 300, "Timestamp": 0}"#).await;
        let client = VerifierClient::new(base);

        assert!(matches!(
            client.verify(B256::repeat_byte(0xcd)).await,
            Err(VerifyError::OutcomeRange(300))
        ));
    }
}
