//! `dolt_remote`, `dolt_fetch`, `dolt_push`.

use tributary_core::remote::Remote;

use crate::error::SessionError;
use crate::session::Session;

use super::args::{self, FlagSpec};
use super::ProcedureResult;

const REMOTE_SPEC: &[FlagSpec] = &[];

pub fn dolt_remote(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(REMOTE_SPEC, call_args)?;
    match parsed.positional.as_slice() {
        [op, name, url] if op == "add" => {
            session.database().add_remote(Remote::new(name, url))?;
            Ok(ProcedureResult::Message(format!("Added remote {name}")))
        }
        [op, name] if op == "remove" || op == "rm" => {
            session.database().remove_remote(name)?;
            Ok(ProcedureResult::Message(format!("Removed remote {name}")))
        }
        _ => Err(SessionError::Usage(
            "usage: dolt_remote('add', name, url) or dolt_remote('remove', name)".to_string(),
        )),
    }
}

const FETCH_SPEC: &[FlagSpec] = &[
    FlagSpec::flag("force", Some('f')),
    FlagSpec::flag("prune", Some('p')),
];

const DEFAULT_REMOTE: &str = "origin";

pub async fn dolt_fetch(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(FETCH_SPEC, call_args)?;
    let mut positional = parsed.positional.iter();
    let remote = positional
        .next()
        .cloned()
        .unwrap_or_else(|| DEFAULT_REMOTE.to_string());
    let refspecs: Vec<String> = positional.cloned().collect();

    let stats = session
        .fetch(&remote, &refspecs, parsed.has("force"), parsed.has("prune"))
        .await?;
    Ok(ProcedureResult::Fetch {
        chunks_fetched: stats.chunks_fetched,
        refs_updated: stats.refs_updated.len() as u64,
        refs_pruned: stats.refs_pruned.len() as u64,
    })
}

const PUSH_SPEC: &[FlagSpec] = &[FlagSpec::flag("force", Some('f'))];

pub async fn dolt_push(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(PUSH_SPEC, call_args)?;
    let mut positional = parsed.positional.iter();
    let remote = positional
        .next()
        .cloned()
        .unwrap_or_else(|| DEFAULT_REMOTE.to_string());
    let branch = positional.next().cloned();
    if positional.next().is_some() {
        return Err(SessionError::Usage(
            "usage: dolt_push([remote], [branch], ['--force'])".to_string(),
        ));
    }

    let stats = session
        .push(&remote, branch.as_deref(), parsed.has("force"))
        .await?;
    Ok(ProcedureResult::Push {
        chunks_pushed: stats.chunks_pushed,
    })
}
