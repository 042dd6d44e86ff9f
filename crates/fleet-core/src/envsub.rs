//! `${VAR}` substitution for the raw config document.
//!
//! Runs exactly once over the document text before parsing. Unset variables
//! are left as literal `${VAR}` text and reported back so the loader can
//! warn about them instead of failing.

/// Substitute `${VAR}` references using the process environment.
///
/// Returns the substituted text plus the names of variables that were not
/// set (their references are kept verbatim).
pub fn substitute_env(text: &str) -> (String, Vec<String>) {
    substitute_with(text, |name| std::env::var(name).ok())
}

/// Substitution with a caller-supplied lookup, so tests stay deterministic.
pub fn substitute_with<F>(text: &str, lookup: F) -> (String, Vec<String>)
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut missing = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if name.is_empty() {
                    // "${}" is not a reference, keep it as-is
                    out.push_str("${}");
                } else {
                    match lookup(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                            missing.push(name.to_string());
                        }
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference, keep the tail verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    (out, missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_env(name: &str) -> Option<String> {
        match name {
            "API_TOKEN" => Some("s3cret".to_string()),
            "HOST" => Some("10.0.0.5".to_string()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_variables() {
        let (out, missing) = substitute_with("token=${API_TOKEN} host=${HOST}", fake_env);
        assert_eq!(out, "token=s3cret host=10.0.0.5");
        assert!(missing.is_empty());
    }

    #[test]
    fn keeps_unset_variables_verbatim() {
        let (out, missing) = substitute_with("token=${NOPE}", fake_env);
        assert_eq!(out, "token=${NOPE}");
        assert_eq!(missing, vec!["NOPE".to_string()]);
    }

    #[test]
    fn mixed_set_and_unset() {
        let (out, missing) = substitute_with("${API_TOKEN}:${MISSING}:${HOST}", fake_env);
        assert_eq!(out, "s3cret:${MISSING}:10.0.0.5");
        assert_eq!(missing, vec!["MISSING".to_string()]);
    }

    #[test]
    fn text_without_references_is_unchanged() {
        let (out, missing) = substitute_with("plain text, no refs", fake_env);
        assert_eq!(out, "plain text, no refs");
        assert!(missing.is_empty());
    }

    #[test]
    fn empty_and_unterminated_references_kept() {
        let (out, missing) = substitute_with("a=${} b=${OPEN", fake_env);
        assert_eq!(out, "a=${} b=${OPEN");
        assert!(missing.is_empty());
    }

    #[test]
    fn adjacent_references() {
        let (out, _) = substitute_with("${API_TOKEN}${HOST}", fake_env);
        assert_eq!(out, "s3cret10.0.0.5");
    }
}
