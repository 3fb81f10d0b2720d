//! Remote sync: refspecs, the chunk-exchange transport boundary, and
//! fetch/push reconciliation.

pub mod fetch;
pub mod push;
pub mod refspec;
pub mod transport;

use crate::hash::Hash;
use crate::model::ModelError;
use crate::refs::RefError;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use fetch::{fetch, pull_missing_chunks, FetchOptions, FetchStats};
pub use push::{push, PushOptions, PushStats};
pub use refspec::RefSpec;
pub use transport::{ChunkTransport, FileTransport};

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Ref(#[from] RefError),
    #[error("invalid refspec: '{0}'")]
    BadRefspec(String),
    #[error("--prune cannot be combined with an explicit refspec")]
    PruneWithRefspec,
    #[error("ref {0} would not fast-forward; use --force to overwrite")]
    NonFastForward(String),
    #[error("received chunk hashing to {0}, which was not requested")]
    HashMismatch(Hash),
    #[error("no remote named '{0}'")]
    UnknownRemote(String),
    #[error("unsupported remote url: '{0}'")]
    UnsupportedUrl(String),
    #[error("remote transport error: {0}")]
    Transport(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// A configured remote, persisted in `repo_state.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    pub url: String,
    pub fetch_specs: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Remote {
    pub fn new(name: &str, url: &str) -> Remote {
        Remote {
            name: name.to_string(),
            url: url.to_string(),
            fetch_specs: vec![format!("refs/heads/*:refs/remotes/{name}/*")],
            params: BTreeMap::new(),
        }
    }

    /// Open a transport for this remote's URL. Network schemes live
    /// outside the core.
    pub fn transport(&self) -> Result<Box<dyn ChunkTransport>, RemoteError> {
        if FileTransport::handles(&self.url) {
            Ok(Box::new(FileTransport::open(&self.url)?))
        } else {
            Err(RemoteError::UnsupportedUrl(self.url.clone()))
        }
    }
}
