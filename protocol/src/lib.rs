// Copyright (c) 2026 Driftcast Contributors. MIT License.
// See LICENSE for details.

//! # Driftcast Protocol: Core Library
//!
//! Driftcast is a peer-to-peer content distribution network. Every node
//! hosts encrypted media, tells other nodes about itself and its peers,
//! keeps a catalog of what the rest of the network hosts, mirrors a slice
//! of promoted content without any coordination, and admits viewers to
//! streams in exchange for a signed proof that they watched an ad.
//!
//! ## Architecture
//!
//! - **config**: protocol constants and runtime configuration.
//! - **crypto**: node keys, signed protocol messages, hashing and the
//!   chunked AEAD content cipher.
//! - **identity**: who this node is and how it recognises itself.
//! - **registry**: the external trust anchor for node names and campaigns.
//! - **network**: peer records, the verified peer directory, gossip and
//!   tracker announcements.
//! - **catalog**: hosted links, the sled-backed catalog and periodic
//!   reconciliation with peers.
//! - **replication**: hash-bucket replica selection, acquisition and GC.
//! - **streaming**: load checks, sessions and proof-of-view admission.
//!
//! ## Ground rules
//!
//! 1. A peer is only admitted once its signature recovers to the identity
//!    it claims.
//! 2. Nothing a peer stops listing is ever deleted from the catalog.
//! 3. Every outbound call has a timeout and every fan-out is bounded.
//! 4. A stream slot taken is released exactly once.

pub mod catalog;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod network;
pub mod registry;
pub mod replication;
pub mod streaming;
