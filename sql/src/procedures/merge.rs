//! `dolt_merge` and `dolt_conflicts_resolve`.

use crate::error::SessionError;
use crate::session::{MergeOpts, Session};

use super::args::{self, FlagSpec};
use super::ProcedureResult;

const MERGE_SPEC: &[FlagSpec] = &[
    FlagSpec::valued("message", Some('m')),
    FlagSpec::flag("no-ff", None),
    FlagSpec::flag("squash", None),
    FlagSpec::flag("abort", None),
];

pub fn dolt_merge(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(MERGE_SPEC, call_args)?;
    if parsed.has("no-ff") && parsed.has("squash") {
        return Err(SessionError::Usage(
            "--no-ff and --squash are mutually exclusive".to_string(),
        ));
    }

    if parsed.has("abort") {
        if !parsed.positional.is_empty() || parsed.has("no-ff") || parsed.has("squash") {
            return Err(SessionError::Usage(
                "--abort takes no other arguments".to_string(),
            ));
        }
        let summary = session.merge(
            "",
            MergeOpts {
                abort: true,
                ..Default::default()
            },
        )?;
        return Ok(ProcedureResult::Merge {
            hash: summary.head.to_hex(),
            fast_forward: false,
            conflicts: 0,
            violations: 0,
        });
    }

    let source = parsed
        .positional
        .first()
        .ok_or_else(|| SessionError::Usage("dolt_merge requires a source ref".to_string()))?
        .clone();
    if parsed.positional.len() > 1 {
        return Err(SessionError::Usage(
            "dolt_merge takes a single source ref".to_string(),
        ));
    }

    let summary = session.merge(
        &source,
        MergeOpts {
            message: parsed.value("message").map(str::to_string),
            no_ff: parsed.has("no-ff"),
            squash: parsed.has("squash"),
            abort: false,
        },
    )?;
    Ok(ProcedureResult::Merge {
        hash: summary.head.to_hex(),
        fast_forward: summary.fast_forward,
        conflicts: summary.conflicts,
        violations: summary.violations,
    })
}

const RESOLVE_SPEC: &[FlagSpec] = &[
    FlagSpec::flag("ours", None),
    FlagSpec::flag("theirs", None),
];

pub fn dolt_conflicts_resolve(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(RESOLVE_SPEC, call_args)?;
    let ours = parsed.has("ours");
    let theirs = parsed.has("theirs");
    if ours == theirs {
        return Err(SessionError::Usage(
            "pass exactly one of --ours or --theirs".to_string(),
        ));
    }
    if parsed.positional.is_empty() {
        return Err(SessionError::Usage(
            "dolt_conflicts_resolve requires table names or '.'".to_string(),
        ));
    }
    let tables: Vec<String> = if parsed.positional.iter().any(|p| p == ".") {
        Vec::new()
    } else {
        parsed.positional.clone()
    };
    session.resolve_conflicts(&tables, theirs)?;
    Ok(ProcedureResult::Message("Conflicts resolved.".to_string()))
}
