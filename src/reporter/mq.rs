//! AMQP message consumer.
//!
//! Market reports arrive as JSON over AMQP 0-9-1. The consumer declares the
//! configured queue durable, binds it to the exchange with the empty routing
//! key, and consumes with manual acks. An outer supervisor loop rebuilds the
//! whole topology after a short delay whenever the connection or the
//! delivery stream fails, so a broker restart costs at most one delay.

use crate::reporter::{Report, ReporterHandle};
use alloy::primitives::B256;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Number of deliveries processed at once.
const CONSUMER_CONCURRENCY: u16 = 1;
/// Prefetch 4x as many messages as we can handle at once.
const PREFETCH_MULTIPLIER: u16 = 4;
/// Delay before the supervisor restarts a failed consumer.
const RESTART_DELAY: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
enum ParseError {
    #[error("no message body")]
    EmptyBody,
    #[error("error during report outcome json unmarshaling: {0}")]
    Json(#[from] serde_json::Error),
    #[error("outcome {0} does not fit uint8")]
    OutcomeRange(i32),
}

pub struct MqConsumer {
    uri: String,
    exchange: String,
    queue: String,
    handle: ReporterHandle,
    shutdown: watch::Receiver<bool>,
}

impl MqConsumer {
    pub fn new(
        uri: String,
        exchange: String,
        queue: String,
        handle: ReporterHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            uri,
            exchange,
            queue,
            handle,
            shutdown,
        }
    }

    /// Supervisor loop: (re)start the consumer until shutdown, sleeping
    /// [`RESTART_DELAY`] between attempts.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.consume().await {
                // a clean return means shutdown was observed inside
                Ok(()) => break,
                Err(err) => {
                    error!(error = %err, "error while consuming from message queue, restarting consumer");
                }
            }

            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }

        debug!("mq consumer stopped");
    }

    /// One consumer session: connect, declare the topology, drain
    /// deliveries until the stream or the shutdown signal ends it.
    async fn consume(&mut self) -> anyhow::Result<()> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        // create the queue if it doesn't already exist
        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // bind the queue to the exchange with the empty routing key
        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .basic_qos(
                CONSUMER_CONCURRENCY * PREFETCH_MULTIPLIER,
                BasicQosOptions::default(),
            )
            .await?;

        let mut consumer = channel
            .basic_consume(
                &self.queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.queue, exchange = %self.exchange, "listening for mq messages");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => self.on_delivery(delivery).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => anyhow::bail!("delivery stream closed"),
                },
            }
        }
    }

    async fn on_delivery(&self, delivery: Delivery) -> anyhow::Result<()> {
        match parse_delivery(&delivery.data) {
            Ok((market_hash, outcome)) => {
                delivery.ack(BasicAckOptions::default()).await?;
                debug!(market = %market_hash, outcome, "mq message received");
                self.handle.propose(market_hash, outcome).await;
            }
            Err(err) => {
                // Acked even so: nacking would leave the message in the
                // queue and redeliver the same unparseable payload forever.
                warn!(error = %err, "dropping malformed mq message");
                delivery.ack(BasicAckOptions::default()).await?;
            }
        }

        Ok(())
    }
}

/// Decode a bus delivery into a market hash and uint8 outcome.
fn parse_delivery(body: &[u8]) -> Result<(B256, u8), ParseError> {
    if body.is_empty() {
        return Err(ParseError::EmptyBody);
    }

    let report: Report = serde_json::from_slice(body)?;
    let outcome =
        u8::try_from(report.outcome).map_err(|_| ParseError::OutcomeRange(report.outcome))?;

    Ok((report.market_hash, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_delivery() {
        let body = format!(r#"{{"marketHash":"0x{}","outcome":2}}"#, "ab".repeat(32));

        let (market_hash, outcome) = parse_delivery(body.as_bytes()).unwrap();
        assert_eq!(market_hash, B256::repeat_byte(0xab));
        assert_eq!(outcome, 2);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            parse_delivery(b"not-json"),
            Err(ParseError::Json(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty_body() {
        assert!(matches!(parse_delivery(b""), Err(ParseError::EmptyBody)));
    }

    #[test]
    fn test_parse_rejects_short_market_hash() {
        let body = r#"{"marketHash":"0xabab","outcome":2}"#;
        assert!(matches!(
            parse_delivery(body.as_bytes()),
            Err(ParseError::Json(_))
        ));
    }

    #[test]
    fn test_parse_rejects_out_of_range_outcome() {
        let negative = format!(r#"{{"marketHash":"0x{}","outcome":-1}}"#, "cd".repeat(32));
        assert!(matches!(
            parse_delivery(negative.as_bytes()),
            Err(ParseError::OutcomeRange(-1))
        ));

        let huge = format!(r#"{{"marketHash":"0x{}","outcome":300}}"#, "cd".repeat(32));
        assert!(matches!(
            parse_delivery(huge.as_bytes()),
            Err(ParseError::OutcomeRange(300))
        ));
    }
}
