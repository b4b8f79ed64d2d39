//! # basalt-tests
//!
//! Integration tests for the basalt P2P stack: admission, heartbeats,
//! capability negotiation, and graceful shutdown, exercised over real
//! localhost sockets.

pub mod harness;

#[cfg(test)]
mod network_tests;

pub use harness::*;
