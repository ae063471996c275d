// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! The error kinds surfaced by the build core.
//!
//! These are tagged variants rather than stringly-typed failures so that the
//! scheduler and tests can react to specific conditions. They convert into
//! the generic error type used at the API boundary through the standard
//! `std::error::Error` machinery.

use thiserror::Error;

/// An error produced while initiating, checking, or building a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Something that is neither an entity nor a node was passed as a
    /// dependency.
    #[error("invalid node dependency: {0}")]
    InvalidDependency(String),

    /// A batch build asked for the targets of a source that is not part of
    /// the batch.
    #[error("unknown source entity: {0}")]
    UnknownSource(String),

    /// The targets of a node were read before the node was built. This is a
    /// programming error in the caller.
    #[error("node targets are not built or set yet: {0}")]
    NoTargets(String),

    /// A source node's targets were unavailable when they were needed to
    /// materialize this node's sources.
    #[error("targets of source node `{0}` are not built or set yet")]
    NoSrcTargets(String),

    /// A save was attempted while a target entity had no signature.
    #[error("target entity is not actual: {0}")]
    UnactualEntity(String),

    /// A builder's split produced a source entity that does not belong to the
    /// node being split.
    #[error("node can't be split to unknown source entity: {0}")]
    SplitUnknownSource(String),

    /// The builder reported failure.
    #[error("build of `{node}` failed: {message}")]
    BuildFailure { node: String, message: String },

    /// The builder ran past its own declared time limit.
    #[error("build of `{node}` timed out after {seconds:.1} seconds")]
    BuildTimeout { node: String, seconds: f64 },

    /// The source/dependency graph is not a DAG.
    #[error("dependency cycle detected through node `{0}`")]
    Cycle(String),
}
