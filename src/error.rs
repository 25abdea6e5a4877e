//! Query errors.
//!
//! Construction accepts every input (an empty collection builds an engine
//! whose queries return nothing); errors arise only from queries handed an
//! id or bounding box outside the supported domain.

use thiserror::Error;

/// Errors reported by the cluster query surface.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ClusterError {
    /// The id does not resolve to a cluster in the hierarchy, or no record
    /// of the next-finer layer names it as parent.
    #[error("no cluster with the specified id: {0}")]
    ClusterNotFound(u32),

    /// The id's encoded zoom field cannot belong to a cluster record.
    #[error("cluster id {0} does not carry a valid zoom field")]
    MalformedClusterId(u32),

    /// A bounding-box latitude was outside `[-90, 90]`.
    #[error("bounding-box latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
}

/// Convenience alias for query results.
pub type Result<T> = std::result::Result<T, ClusterError>;
