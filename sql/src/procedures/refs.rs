//! `dolt_branch`, `dolt_checkout`, `dolt_tag`.

use crate::error::SessionError;
use crate::session::Session;

use super::args::{self, FlagSpec};
use super::ProcedureResult;

const BRANCH_SPEC: &[FlagSpec] = &[
    FlagSpec::flag("delete", Some('d')),
    FlagSpec::flag("force-delete", Some('D')),
];

pub fn dolt_branch(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(BRANCH_SPEC, call_args)?;
    if parsed.has("delete") || parsed.has("force-delete") {
        if parsed.positional.is_empty() {
            return Err(SessionError::Usage(
                "branch deletion requires a branch name".to_string(),
            ));
        }
        for name in &parsed.positional {
            session.delete_branch(name)?;
        }
        return Ok(ProcedureResult::Message("Deleted.".to_string()));
    }

    match parsed.positional.as_slice() {
        [name] => session.create_branch(name, None)?,
        [name, start] => session.create_branch(name, Some(start))?,
        _ => {
            return Err(SessionError::Usage(
                "dolt_branch requires a branch name (and optional start point)".to_string(),
            ))
        }
    }
    Ok(ProcedureResult::Message("Created.".to_string()))
}

const CHECKOUT_SPEC: &[FlagSpec] = &[FlagSpec::flag("new-branch", Some('b'))];

pub fn dolt_checkout(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(CHECKOUT_SPEC, call_args)?;
    let target = parsed
        .positional
        .first()
        .ok_or_else(|| SessionError::Usage("dolt_checkout requires a target".to_string()))?
        .clone();

    if parsed.has("new-branch") {
        let start = parsed.positional.get(1).map(String::as_str);
        session.checkout_new_branch(&target, start)?;
    } else if parsed.positional.len() > 1 {
        return Err(SessionError::Usage(
            "dolt_checkout takes a single target".to_string(),
        ));
    } else if session
        .database()
        .branches()?
        .iter()
        .any(|(name, _)| *name == target)
    {
        session.checkout_branch(&target)?;
    } else {
        session.checkout_commit(&target)?;
    }
    Ok(ProcedureResult::Message(format!("Switched to {target}")))
}

const TAG_SPEC: &[FlagSpec] = &[
    FlagSpec::valued("message", Some('m')),
    FlagSpec::flag("delete", Some('d')),
];

pub fn dolt_tag(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(TAG_SPEC, call_args)?;
    if parsed.has("delete") {
        if parsed.positional.is_empty() {
            return Err(SessionError::Usage(
                "tag deletion requires a tag name".to_string(),
            ));
        }
        for name in &parsed.positional {
            session.database().delete_tag(name)?;
        }
        return Ok(ProcedureResult::Message("Deleted.".to_string()));
    }

    let (name, at) = match parsed.positional.as_slice() {
        [name] => (name.clone(), session.head()),
        [name, rev] => (name.clone(), session.database().resolve_revision(rev)?),
        _ => {
            return Err(SessionError::Usage(
                "dolt_tag requires a tag name (and optional ref)".to_string(),
            ))
        }
    };
    let message = parsed.value("message").unwrap_or("").to_string();
    let config = session.config().clone();
    let tagger = tributary_core::model::Signature::new(
        &config.user_name,
        &config.user_email,
        chrono::Utc::now(),
    );
    session.database().create_tag(&name, at, &message, tagger)?;
    Ok(ProcedureResult::Message(format!("Tagged {name}")))
}
