//! Flag parsing for stored-procedure arguments.
//!
//! Every procedure enumerates its recognized options; anything else is
//! rejected with `UnknownOption`.

use std::collections::{HashMap, HashSet};

use crate::error::SessionError;

#[derive(Clone, Copy, Debug)]
pub struct FlagSpec {
    pub long: &'static str,
    pub short: Option<char>,
    pub takes_value: bool,
}

impl FlagSpec {
    pub const fn flag(long: &'static str, short: Option<char>) -> FlagSpec {
        FlagSpec {
            long,
            short,
            takes_value: false,
        }
    }

    pub const fn valued(long: &'static str, short: Option<char>) -> FlagSpec {
        FlagSpec {
            long,
            short,
            takes_value: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct ParsedArgs {
    flags: HashSet<String>,
    values: HashMap<String, String>,
    pub positional: Vec<String>,
}

impl ParsedArgs {
    pub fn has(&self, long: &str) -> bool {
        self.flags.contains(long) || self.values.contains_key(long)
    }

    pub fn value(&self, long: &str) -> Option<&str> {
        self.values.get(long).map(String::as_str)
    }
}

/// Parse `args` against the recognized `spec`. Supports `--long`,
/// `--long=value`, `--long value`, `-s`, and bundled short flags
/// (`-am msg`), where a value-taking short flag must come last in the
/// bundle.
pub fn parse(spec: &[FlagSpec], args: &[&str]) -> Result<ParsedArgs, SessionError> {
    let by_long = |name: &str| spec.iter().find(|f| f.long == name);
    let by_short = |c: char| spec.iter().find(|f| f.short == Some(c));

    let mut parsed = ParsedArgs::default();
    let mut tokens = args.iter().peekable();
    while let Some(&token) = tokens.next() {
        if let Some(rest) = token.strip_prefix("--") {
            if rest.is_empty() {
                // `--` ends option parsing.
                parsed.positional.extend(tokens.map(|t| t.to_string()));
                break;
            }
            let (name, inline_value) = match rest.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (rest, None),
            };
            let flag = by_long(name)
                .ok_or_else(|| SessionError::UnknownOption(format!("--{name}")))?;
            if flag.takes_value {
                let value = match inline_value {
                    Some(v) => v,
                    None => tokens
                        .next()
                        .ok_or_else(|| {
                            SessionError::Usage(format!("option --{name} requires a value"))
                        })?
                        .to_string(),
                };
                parsed.values.insert(flag.long.to_string(), value);
            } else {
                if inline_value.is_some() {
                    return Err(SessionError::Usage(format!(
                        "option --{name} takes no value"
                    )));
                }
                parsed.flags.insert(flag.long.to_string());
            }
        } else if let Some(shorts) = token.strip_prefix('-') {
            if shorts.is_empty() {
                parsed.positional.push(token.to_string());
                continue;
            }
            let chars: Vec<char> = shorts.chars().collect();
            for (i, c) in chars.iter().enumerate() {
                let flag = by_short(*c)
                    .ok_or_else(|| SessionError::UnknownOption(format!("-{c}")))?;
                if flag.takes_value {
                    if i + 1 != chars.len() {
                        return Err(SessionError::Usage(format!(
                            "option -{c} must be last in a flag bundle"
                        )));
                    }
                    let value = tokens.next().ok_or_else(|| {
                        SessionError::Usage(format!("option -{c} requires a value"))
                    })?;
                    parsed.values.insert(flag.long.to_string(), value.to_string());
                } else {
                    parsed.flags.insert(flag.long.to_string());
                }
            }
        } else {
            parsed.positional.push(token.to_string());
        }
    }
    Ok(parsed)
}
