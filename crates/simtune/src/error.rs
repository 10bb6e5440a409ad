use std::path::PathBuf;

use thiserror::Error;

use crate::schema::MAX_UNIQUE_KEY;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{} was modified since it was read; reload and retry", .path.display())]
    ConcurrentModification { path: PathBuf },

    #[error("NumUniqKey must be between 1 and {}, got {value}", MAX_UNIQUE_KEY)]
    OutOfRange { value: u64 },

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("node '{node}': {cause}")]
    NodeConnection { node: String, cause: String },

    #[error("module '{module}' has no usable submodules to scale")]
    NoUsableSubmodules { module: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Yaml {
        context: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl Error {
    pub fn not_found<M: Into<String>>(what: M) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_format<M: Into<String>>(msg: M) -> Self {
        Self::InvalidFormat(msg.into())
    }

    pub fn node<N: Into<String>, C: Into<String>>(node: N, cause: C) -> Self {
        Self::NodeConnection {
            node: node.into(),
            cause: cause.into(),
        }
    }

    pub fn io<C: Into<String>>(context: C, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn yaml<C: Into<String>>(context: C, source: serde_yaml::Error) -> Self {
        Self::Yaml {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
