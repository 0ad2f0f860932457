// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass Common - shared building blocks for the history engine
//!
//! This crate carries the pieces every other windlass crate depends on:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Unified [`EngineError`](error::EngineError) with error-code mapping |
//! | [`cluster`] | Cluster metadata and failover-version arithmetic |
//! | [`domain`] | Domain records, the domain store contract, and a TTL cache |
//! | [`config`] | Static configuration from environment variables plus dynamic knobs |
//!
//! # Failover versions
//!
//! Every history event is stamped with the *failover version* of the cluster
//! that wrote it. Each cluster owns a disjoint residue class modulo
//! `failover_version_increment`, so the writing cluster can always be
//! recovered from a bare version number, and the numerically larger version
//! wins ties during conflict resolution. See [`cluster::ClusterMetadata`].

#![deny(missing_docs)]

/// Cluster metadata and failover-version arithmetic.
pub mod cluster;

/// Static and dynamic configuration.
pub mod config;

/// Domain records, the domain store contract, and the TTL domain cache.
pub mod domain;

/// Error types shared by the whole engine.
pub mod error;

/// Jittered bounded retry for storage operations.
pub mod retry;

/// Tracing initialization for binaries and tests.
pub mod telemetry;

pub use error::{EngineError, Result};

/// Version stamped on events written by a local (non-global) domain.
pub const EMPTY_VERSION: i64 = 0;

/// Sentinel event ID meaning "to the end of history" in re-replication
/// requests.
pub const END_EVENT_ID: i64 = i64::MAX;

/// First event ID of every run. Event IDs are dense and monotonic from here.
pub const FIRST_EVENT_ID: i64 = 1;

/// Sentinel meaning "no event" (e.g. a decision that was never started).
pub const EMPTY_EVENT_ID: i64 = 0;
