use std::fmt;

/// Errors surfaced at the topology core boundary.
#[derive(Debug, thiserror::Error)]
pub enum TopoError {
    /// A bounded arena (nodes, links, hosts, route tiers) is full.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// A lookup came up empty where the caller required an answer.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provided DOM is missing a required attribute or carries an
    /// unparseable value.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// The bootstrap channel failed during a collective.
    #[error("bootstrap failure: {0}")]
    Bootstrap(String),

    /// The device adaptor or net plugin failed.
    #[error("adaptor failure: {0}")]
    Adaptor(String),

    /// Internal / unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TopoError {
    pub fn capacity(msg: impl fmt::Display) -> Self {
        Self::Capacity(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub fn schema(msg: impl fmt::Display) -> Self {
        Self::InvalidSchema(msg.to_string())
    }

    pub fn internal(msg: impl fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TopoError>;
