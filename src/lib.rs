//! Headless reporter agent for the on-chain outcome-resolution protocol.
//!
//! The agent consumes market reports from an AMQP bus, observes proposal
//! events on chain, verifies outcomes against an HTTP oracle to vote, and
//! finalizes each market with a report transaction once its voting period
//! expires. Every chain write is serialized through a single sender with
//! nonce management and retry.

pub mod chain;
pub mod config;
pub mod reporter;
pub mod secrets;
pub mod server;
