//! Fetch: chunk-set reconciliation from a remote into the local store.

use crate::cancel::Cancel;
use crate::hash::Hash;
use crate::model::{self, Commit, RootValue};
use crate::refs::{RefManager, RefName};
use crate::store::gc::references_of;
use crate::store::{ChunkStore, RefKind};
use std::collections::HashSet;
use std::sync::Arc;

use super::refspec::RefSpec;
use super::transport::ChunkTransport;
use super::{Remote, RemoteError};

const CHUNK_BATCH: usize = 256;

#[derive(Clone, Copy, Debug, Default)]
pub struct FetchOptions {
    pub force: bool,
    pub prune: bool,
}

#[derive(Clone, Debug, Default)]
pub struct FetchStats {
    pub chunks_fetched: u64,
    pub refs_updated: Vec<String>,
    pub refs_pruned: Vec<String>,
}

/// Pull every chunk reachable from `head` that the local store lacks,
/// verifying each chunk's hash on receipt. A chunk already present is
/// assumed to have its closure present.
pub async fn pull_missing_chunks(
    store: &Arc<dyn ChunkStore>,
    transport: &dyn ChunkTransport,
    head: Hash,
    cancel: &Cancel,
) -> Result<u64, RemoteError> {
    let mut fetched = 0u64;
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
        let present = store.has_many(&batch)?;
        let need: Vec<Hash> = batch.into_iter().filter(|h| !present.contains(h)).collect();

        for request in need.chunks(CHUNK_BATCH) {
            if cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }
            // Suspension point between batches.
            tokio::task::yield_now().await;
            let wanted: HashSet<Hash> = request.iter().copied().collect();
            let chunks = transport.get_chunks(request).await?;
            if chunks.len() != request.len() {
                return Err(RemoteError::Transport(format!(
                    "requested {} chunks, received {}",
                    request.len(),
                    chunks.len()
                )));
            }
            for chunk in chunks {
                // `Chunk` recomputes its hash from content, so membership
                // in the requested set proves integrity.
                if !wanted.contains(&chunk.hash()) {
                    return Err(RemoteError::HashMismatch(chunk.hash()));
                }
                frontier.extend(references_of(&chunk)?);
                store.put(chunk)?;
                fetched += 1;
            }
        }
    }
    store.flush()?;
    Ok(fetched)
}

/// Fetch from a remote: resolve refspecs, reconcile chunks, then
/// fast-forward (or force-update) the matching local refs.
#[allow(clippy::too_many_arguments)]
pub async fn fetch(
    store: &Arc<dyn ChunkStore>,
    refs: &RefManager,
    feature_version: u32,
    remote: &Remote,
    transport: &dyn ChunkTransport,
    refspecs: &[String],
    opts: FetchOptions,
    cancel: &Cancel,
) -> Result<FetchStats, RemoteError> {
    if opts.prune && !refspecs.is_empty() {
        return Err(RemoteError::PruneWithRefspec);
    }

    let specs: Vec<RefSpec> = if refspecs.is_empty() {
        remote
            .fetch_specs
            .iter()
            .map(|s| RefSpec::parse(s, &remote.name))
            .collect::<Result<_, _>>()?
    } else {
        refspecs
            .iter()
            .map(|s| RefSpec::parse(s, &remote.name))
            .collect::<Result<_, _>>()?
    };

    let remote_refs = transport.list_refs().await?;
    let mut matched: Vec<(String, bool, Hash)> = Vec::new();
    for (src_path, head) in &remote_refs {
        for spec in &specs {
            if let Some(dst) = spec.matches(src_path) {
                matched.push((dst, spec.force, *head));
                break;
            }
        }
    }

    let mut stats = FetchStats::default();
    for (dst_path, spec_force, head) in &matched {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        stats.chunks_fetched += pull_missing_chunks(store, transport, *head, cancel).await?;

        let dst = RefName::parse(dst_path)
            .ok_or_else(|| RemoteError::BadRefspec(dst_path.clone()))?;

        // Gate before the ref moves: a root too new for this reader
        // leaves the local ref untouched.
        if dst.kind != RefKind::Tag {
            let commit = Commit::load(&**store, head)?;
            RootValue::load(&**store, &commit.root, feature_version)?;
        }

        let current = refs.try_resolve(&dst)?;
        if current == Some(*head) {
            continue;
        }
        if let Some(current) = current {
            if dst.kind != RefKind::Tag {
                let fast_forward = model::is_ancestor(&**store, &current, head)?;
                if !fast_forward && !opts.force && !spec_force {
                    return Err(RemoteError::NonFastForward(dst_path.clone()));
                }
            }
        }
        refs.force_update(&dst, *head)?;
        stats.refs_updated.push(dst_path.clone());
        tracing::info!(dst = %dst_path, head = %head, "fetched ref");
    }

    if opts.prune {
        let live: HashSet<&String> = matched.iter().map(|(dst, _, _)| dst).collect();
        let prefix = format!("{}/", remote.name);
        for (name, _) in refs.list(Some(RefKind::RemoteTracking))? {
            if !name.name.starts_with(&prefix) {
                continue;
            }
            let path = name.path();
            if !live.contains(&path) {
                refs.delete(&name)?;
                stats.refs_pruned.push(path);
            }
        }
    }

    Ok(stats)
}
