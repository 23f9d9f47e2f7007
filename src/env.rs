//! Ordered key→value environment store (C1).
//!
//! Used both as the process environment snapshot handed to a freshly parsed
//! crontab, and as the per-file local environment that `KEY=VALUE` lines
//! mutate while a file is being parsed.

/// An ordered sequence of `KEY=VALUE` strings.
///
/// Order matters: `get` returns the first match, so a later `Add`/`set` of
/// an existing key updates in place rather than shadowing from the front —
/// this lets later crontab lines override earlier ones within the same file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environ(pub Vec<String>);

impl Environ {
    pub fn new() -> Self {
        Environ(Vec::new())
    }

    /// Current process environment.
    pub fn from_process() -> Self {
        Environ(std::env::vars().map(|(k, v)| format!("{k}={v}")).collect())
    }

    /// Process environment with `HOME`, `PWD`, `OLDPWD` cleared so that
    /// execution-time user resolution always repopulates them fresh.
    pub fn for_execution() -> Self {
        let mut e = Self::from_process();
        for key in ["HOME", "PWD", "OLDPWD"] {
            e.set(&format!("{key}="));
        }
        e
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sets (or updates in place) the key=value pair described by `s`.
    /// A malformed entry is silently ignored.
    pub fn set(&mut self, s: &str) {
        let (key, value) = parse(s);
        if key.is_empty() {
            return;
        }

        let prefix = format!("{key}=");
        for entry in self.0.iter_mut() {
            if entry.starts_with(&prefix) {
                *entry = format!("{prefix}{value}");
                return;
            }
        }
        self.0.push(format!("{prefix}{value}"));
    }

    /// Returns the value for `key`, or `default` if absent.
    pub fn get(&self, key: &str, default: &str) -> String {
        let prefix = format!("{key}=");
        for entry in &self.0 {
            if let Some(value) = entry.strip_prefix(&prefix) {
                return value.to_string();
            }
        }
        default.to_string()
    }

    /// Interprets `get(key, "")` as a boolean. Empty/false/0/no/disable(d)
    /// (case-insensitive) are false; everything else is true.
    pub fn get_bool(&self, key: &str) -> bool {
        let v = self.get(key, "").to_ascii_lowercase();
        !matches!(v.as_str(), "" | "false" | "0" | "no" | "disable" | "disabled")
    }
}

impl From<Vec<String>> for Environ {
    fn from(v: Vec<String>) -> Self {
        Environ(v)
    }
}

impl IntoIterator for Environ {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Splits a `KEY = VALUE` string into key and value.
///
/// Trims whitespace around both halves, rejects keys containing whitespace
/// or non-graphic characters, and unquotes a double-quoted value with
/// standard C-style escapes. Returns `("", "")` on any rejection.
pub fn parse(s: &str) -> (String, String) {
    let Some((raw_key, raw_value)) = s.split_once('=') else {
        return (String::new(), String::new());
    };

    let key = raw_key.trim();
    if !is_valid_key(key) {
        return (String::new(), String::new());
    }

    let value = raw_value.trim();
    let value = unquote(value).unwrap_or_else(|| value.to_string());

    (key.to_string(), value)
}

fn is_valid_key(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_graphic)
}

fn is_graphic(c: char) -> bool {
    !c.is_control() && !c.is_whitespace()
}

/// Unquotes a double-quoted string literal with C-style escapes
/// (`\n`, `\t`, `\\`, `\"`, `\xNN`, `\uNNNN`). Returns `None` if `s` is not
/// a double-quoted literal.
fn unquote(s: &str) -> Option<String> {
    if s.len() < 2 || !s.starts_with('"') || !s.ends_with('"') {
        return None;
    }
    let inner = &s[1..s.len() - 1];

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('0') => out.push('\0'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = u8::from_str_radix(&hex, 16).ok()?;
                out.push(byte as char);
            }
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(code)?);
            }
            Some(other) => out.push(other),
            None => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        assert_eq!(parse("KEY=value"), ("KEY".into(), "value".into()));
        assert_eq!(parse(" KEY = value "), ("KEY".into(), "value".into()));
    }

    #[test]
    fn parse_quoted_value() {
        assert_eq!(parse(r#"KEY="line1\nline2""#), ("KEY".into(), "line1\nline2".into()));
        assert_eq!(parse(r#"KEY="a\"b""#), ("KEY".into(), "a\"b".into()));
    }

    #[test]
    fn parse_rejects_whitespace_key() {
        assert_eq!(parse("BAD KEY=value"), (String::new(), String::new()));
    }

    #[test]
    fn parse_rejects_no_equals() {
        assert_eq!(parse("nope"), (String::new(), String::new()));
    }

    #[test]
    fn set_updates_in_place_and_preserves_order() {
        let mut e = Environ::new();
        e.set("A=1");
        e.set("B=2");
        e.set("A=3");
        assert_eq!(e.0, vec!["A=3".to_string(), "B=2".to_string()]);
        assert_eq!(e.get("A", ""), "3");
    }

    #[test]
    fn set_to_empty_replaces_with_empty_string() {
        let mut e = Environ::new();
        e.set("A=1");
        e.set("A=");
        assert_eq!(e.get("A", "default"), "");
        assert_eq!(e.0.len(), 1);
    }

    #[test]
    fn get_returns_default_when_absent() {
        let e = Environ::new();
        assert_eq!(e.get("MISSING", "fallback"), "fallback");
    }

    #[test]
    fn get_bool_semantics() {
        let mut e = Environ::new();
        for (v, expect) in [
            ("", false),
            ("false", false),
            ("FALSE", false),
            ("0", false),
            ("no", false),
            ("disable", false),
            ("disabled", false),
            ("true", true),
            ("1", true),
            ("yes", true),
            ("anything", true),
        ] {
            e.set(&format!("FLAG={v}"));
            assert_eq!(e.get_bool("FLAG"), expect, "value {v:?}");
        }
    }

    #[test]
    fn invariant_set_then_get_roundtrips() {
        let mut e = Environ::new();
        e.set("K=a");
        e.set("K=b");
        assert_eq!(e.get("K", ""), "b");
    }
}
