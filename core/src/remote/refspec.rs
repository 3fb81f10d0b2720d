//! Refspec grammar: `[+]src[:dst]`.
//!
//! `+` requests a force update. A bare name means a branch; an omitted
//! `dst` maps to the symmetric remote-tracking ref. A single `*` in both
//! sides matches and substitutes a branch name.

use super::RemoteError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefSpec {
    pub force: bool,
    /// Full source ref path on the remote, possibly with one `*`.
    pub src: String,
    /// Full destination ref path locally, with a `*` iff `src` has one.
    pub dst: String,
}

impl RefSpec {
    /// Parse a refspec as written by the user, relative to `remote`.
    pub fn parse(text: &str, remote: &str) -> Result<RefSpec, RemoteError> {
        let bad = || RemoteError::BadRefspec(text.to_string());
        let (force, rest) = match text.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if rest.is_empty() {
            return Err(bad());
        }

        let (src_raw, dst_raw) = match rest.split_once(':') {
            Some((s, d)) => (s, Some(d)),
            None => (rest, None),
        };
        if src_raw.is_empty() || dst_raw == Some("") {
            return Err(bad());
        }

        let src = qualify_src(src_raw);
        let dst = match dst_raw {
            Some(d) => qualify_dst(d, remote),
            None => default_dst(&src, remote).ok_or_else(bad)?,
        };

        if src.matches('*').count() != dst.matches('*').count()
            || src.matches('*').count() > 1
        {
            return Err(bad());
        }
        Ok(RefSpec { force, src, dst })
    }

    /// The default fetch refspec for a remote: all branches into its
    /// remote-tracking namespace.
    pub fn default_fetch(remote: &str) -> RefSpec {
        RefSpec {
            force: false,
            src: "refs/heads/*".to_string(),
            dst: format!("refs/remotes/{remote}/*"),
        }
    }

    /// If `src_ref` matches this spec's source, the expanded destination.
    pub fn matches(&self, src_ref: &str) -> Option<String> {
        match self.src.split_once('*') {
            None => (self.src == src_ref).then(|| self.dst.clone()),
            Some((prefix, suffix)) => {
                let captured = src_ref.strip_prefix(prefix)?.strip_suffix(suffix)?;
                if captured.is_empty() {
                    return None;
                }
                Some(self.dst.replacen('*', captured, 1))
            }
        }
    }
}

fn qualify_src(raw: &str) -> String {
    if raw.starts_with("refs/") {
        raw.to_string()
    } else {
        format!("refs/heads/{raw}")
    }
}

fn qualify_dst(raw: &str, remote: &str) -> String {
    if raw.starts_with("refs/") {
        raw.to_string()
    } else {
        format!("refs/remotes/{remote}/{raw}")
    }
}

fn default_dst(src: &str, remote: &str) -> Option<String> {
    if let Some(branch) = src.strip_prefix("refs/heads/") {
        return Some(format!("refs/remotes/{remote}/{branch}"));
    }
    // Tag refs fetch into the same tag namespace.
    if src.starts_with("refs/tags/") {
        return Some(src.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_branch_name() {
        let spec = RefSpec::parse("main", "origin").unwrap();
        assert!(!spec.force);
        assert_eq!(spec.src, "refs/heads/main");
        assert_eq!(spec.dst, "refs/remotes/origin/main");
    }

    #[test]
    fn force_and_explicit_dst() {
        let spec = RefSpec::parse("+main:mirror", "origin").unwrap();
        assert!(spec.force);
        assert_eq!(spec.dst, "refs/remotes/origin/mirror");
    }

    #[test]
    fn glob_expansion() {
        let spec = RefSpec::parse("refs/heads/*:refs/remotes/origin/*", "origin").unwrap();
        assert_eq!(
            spec.matches("refs/heads/feature/x"),
            Some("refs/remotes/origin/feature/x".to_string())
        );
        assert_eq!(spec.matches("refs/tags/v1"), None);
    }

    #[test]
    fn exact_match() {
        let spec = RefSpec::parse("main", "origin").unwrap();
        assert_eq!(
            spec.matches("refs/heads/main"),
            Some("refs/remotes/origin/main".to_string())
        );
        assert_eq!(spec.matches("refs/heads/other"), None);
    }

    #[test]
    fn tag_refs_keep_their_namespace() {
        let spec = RefSpec::parse("refs/tags/v1", "origin").unwrap();
        assert_eq!(spec.dst, "refs/tags/v1");
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(RefSpec::parse("", "origin").is_err());
        assert!(RefSpec::parse("+", "origin").is_err());
        assert!(RefSpec::parse("main:", "origin").is_err());
        // Unbalanced globs.
        assert!(RefSpec::parse("refs/heads/*:refs/remotes/origin/main", "origin").is_err());
    }
}
