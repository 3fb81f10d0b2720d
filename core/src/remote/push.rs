//! Push: the mirror image of fetch. Compute the chunks the remote lacks,
//! stream them, then request a ref CAS on the remote.

use crate::cancel::Cancel;
use crate::hash::Hash;
use crate::model;
use crate::refs::{RefManager, RefName};
use crate::store::gc::references_of;
use crate::store::ChunkStore;
use std::collections::HashSet;
use std::sync::Arc;

use super::transport::ChunkTransport;
use super::{Remote, RemoteError};

const CHUNK_BATCH: usize = 256;

#[derive(Clone, Copy, Debug, Default)]
pub struct PushOptions {
    pub force: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PushStats {
    pub chunks_pushed: u64,
}

/// Push `branch` to the remote.
pub async fn push(
    store: &Arc<dyn ChunkStore>,
    refs: &RefManager,
    remote: &Remote,
    transport: &dyn ChunkTransport,
    branch: &str,
    opts: PushOptions,
    cancel: &Cancel,
) -> Result<PushStats, RemoteError> {
    let local_ref = RefName::branch(branch);
    let head = refs.resolve(&local_ref)?;

    let remote_path = local_ref.path();
    let remote_refs = transport.list_refs().await?;
    let remote_current = remote_refs.get(&remote_path).copied();

    if let Some(current) = remote_current {
        if current != head && !opts.force {
            // Fast-forward requires the remote head to be known locally
            // and an ancestor of what we are pushing.
            let known = store.has(&current)?;
            let fast_forward = known && model::is_ancestor(&**store, &current, &head)?;
            if !fast_forward {
                return Err(RemoteError::NonFastForward(remote_path.clone()));
            }
        }
    }

    let mut stats = PushStats::default();
    let mut visited: HashSet<Hash> = HashSet::new();
    let mut frontier = vec![head];
    while !frontier.is_empty() {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        let batch: Vec<Hash> = frontier
            .drain(..)
            .filter(|h| visited.insert(*h))
            .collect();
        if batch.is_empty() {
            continue;
        }
        let remote_has = transport.has_chunks(&batch).await?;
        let need: Vec<Hash> = batch
            .into_iter()
            .filter(|h| !remote_has.contains(h))
            .collect();

        for request in need.chunks(CHUNK_BATCH) {
            // Suspension point between batches.
            tokio::task::yield_now().await;
            let mut outgoing = Vec::with_capacity(request.len());
            for hash in request {
                let chunk = store.get(hash)?;
                frontier.extend(references_of(&chunk)?);
                outgoing.push(chunk);
            }
            stats.chunks_pushed += outgoing.len() as u64;
            transport.put_chunks(outgoing).await?;
        }
    }

    let expected = if opts.force { None } else { remote_current };
    transport.cas_ref(&remote_path, expected, head).await?;

    // Record what the remote now holds.
    refs.force_update(&RefName::remote_tracking(&remote.name, branch), head)?;
    tracing::info!(branch, chunks = stats.chunks_pushed, "pushed");
    Ok(stats)
}
