// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! An incremental build engine.
//!
//! This crate decides which build steps are stale, schedules their execution
//! with bounded parallelism, and records their outputs in a persistent
//! value-file so that later runs can reuse prior results whenever a
//! fingerprint of the inputs is unchanged.
//!
//! The key concepts are as follows:
//!
//! - An **entity** is some thing that is a potential input or output of a
//!   build step: a file on disk, a plain value, or the saved record of a
//!   previous build. Every entity pairs a stable *name* (its identity) with a
//!   *signature*, a digest of its current content. An entity with no
//!   signature can never be reused.
//! - A **builder** is the external collaborator that performs the actual work
//!   (compile, copy, link, and so on). The core only consumes the [`Builder`]
//!   trait.
//! - A **node** is the runtime object a caller constructs: a builder plus
//!   sources plus explicit dependencies. Building a node produces one or more
//!   **node entities**, the persisted records of executed build units.
//! - The **value-file** stores entities and node entities across runs. A node
//!   whose saved record matches the fingerprint of its current inputs is
//!   *actual* and its targets are reused verbatim.
//!
//! The [`BuildManager`] drives the whole thing: it walks the node graph,
//! checks each node's actuality against the value-file, and hands stale nodes
//! to a worker pool.

use digest::OutputSizeUser;
use generic_array::GenericArray;
use md5::Md5;

pub mod builder;
pub mod entity;
pub mod errors;
pub mod events;
pub mod filter;
pub mod manager;
pub mod node;
pub mod node_entity;
pub mod reason;
pub mod vfile;

pub use builder::{BatchTargets, Builder, TraceArgs};
pub use entity::{Entity, EntityId, FileEntity, NodeRecord, SignaturePolicy, SimpleEntity, Tags};
pub use errors::NodeError;
pub use events::{AlertMessage, Event, EventBus, NoopEventBus, StatusEventBus};
pub use filter::{NodeAttribute, NodeFilter};
pub use manager::{BuildManager, BuildOptions, BuildReport};
pub use node::{NodeGraph, NodeId, Source};
pub use node_entity::{ImplicitDepCache, NodeEntity};
pub use reason::{StaleCode, StaleReason};
pub use vfile::{ValueFile, ValueKey};

/// A type used to compute data digests for change detection and identity.
///
/// This is currently [`md5::Md5`]; signatures only need to detect change, not
/// resist an adversary.
pub type DigestComputer = Md5;

/// The data type emitted by [`DigestComputer`].
///
/// This is a particular form of [`generic_array::GenericArray`] with a [`u8`]
/// data type and a size appropriate to the digest. For the current MD5
/// implementation, that's 16 bytes.
pub type DigestData = GenericArray<u8, <DigestComputer as OutputSizeUser>::OutputSize>;
