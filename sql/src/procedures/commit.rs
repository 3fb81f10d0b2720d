//! `dolt_add` and `dolt_commit`.

use crate::error::SessionError;
use crate::session::{CommitOpts, Session};

use super::args::{self, FlagSpec};
use super::ProcedureResult;

const ADD_SPEC: &[FlagSpec] = &[FlagSpec::flag("all", Some('A'))];

pub fn dolt_add(session: &mut Session, call_args: &[&str]) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(ADD_SPEC, call_args)?;
    if parsed.has("all") || parsed.positional.iter().any(|p| p == ".") {
        session.add_all()?;
    } else {
        if parsed.positional.is_empty() {
            return Err(SessionError::Usage(
                "dolt_add requires table names, '.', or -A".to_string(),
            ));
        }
        session.add_tables(&parsed.positional)?;
    }
    Ok(ProcedureResult::Message("Staged.".to_string()))
}

const COMMIT_SPEC: &[FlagSpec] = &[
    FlagSpec::flag("all", Some('a')),
    FlagSpec::flag("all-new", Some('A')),
    FlagSpec::valued("message", Some('m')),
    FlagSpec::valued("author", None),
    FlagSpec::flag("allow-empty", None),
    FlagSpec::flag("skip-empty", None),
    FlagSpec::flag("force", Some('f')),
];

/// Parse `--author "Name <email>"`.
fn parse_author(spec: &str) -> Result<(String, String), SessionError> {
    let open = spec.find('<');
    let close = spec.rfind('>');
    match (open, close) {
        (Some(open), Some(close)) if open < close => {
            let name = spec[..open].trim().to_string();
            let email = spec[open + 1..close].trim().to_string();
            if name.is_empty() || email.is_empty() {
                return Err(SessionError::Usage(format!("invalid author spec: '{spec}'")));
            }
            Ok((name, email))
        }
        _ => Err(SessionError::Usage(format!(
            "invalid author spec: '{spec}' (expected \"Name <email>\")"
        ))),
    }
}

pub fn dolt_commit(
    session: &mut Session,
    call_args: &[&str],
) -> Result<ProcedureResult, SessionError> {
    let parsed = args::parse(COMMIT_SPEC, call_args)?;
    let opts = CommitOpts {
        message: parsed.value("message").map(str::to_string),
        all: parsed.has("all"),
        all_with_new: parsed.has("all-new"),
        allow_empty: parsed.has("allow-empty"),
        skip_empty: parsed.has("skip-empty"),
        force: parsed.has("force"),
        author: parsed.value("author").map(parse_author).transpose()?,
    };
    match session.commit(opts)? {
        Some(hash) => Ok(ProcedureResult::CommitHash(hash.to_hex())),
        None => Ok(ProcedureResult::Skipped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn author_spec_parsing() {
        assert_eq!(
            parse_author("Jo Doe <jo@example.com>").unwrap(),
            ("Jo Doe".to_string(), "jo@example.com".to_string())
        );
        assert!(parse_author("no email here").is_err());
        assert!(parse_author("<only@email>").is_err());
    }
}
