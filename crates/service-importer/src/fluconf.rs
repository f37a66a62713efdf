//! Fluent configuration reader for annotation values.
//!
//! A value is a whitespace-separated token stream. A bare token opens a new
//! entry typed by that token; `key=value` tokens fill the current entry. Keys
//! seen before the first entry form a shared header inherited by every entry:
//!
//! ```text
//! timeout=5s interval=5s fall=3 rise=2
//!     http uri=/status port=80
//!     tcp port=80 interval=10s
//! ```
//!
//! parses (with entry key `probe`) into two entries, both carrying the header
//! defaults, the second overriding `interval`.

use std::collections::BTreeMap;
use std::time::Duration;

/// Characters with the Unicode `Quotation_Mark` property. A quotation mark
/// opens a literal region that ends at the next occurrence of the same
/// character; whitespace inside is preserved.
fn is_quotation_mark(c: char) -> bool {
    matches!(
        c,
        '"' | '\''
            | '\u{00AB}'
            | '\u{00BB}'
            | '\u{2018}'..='\u{201F}'
            | '\u{2039}'
            | '\u{203A}'
            | '\u{2E42}'
            | '\u{300C}'..='\u{300F}'
            | '\u{301D}'..='\u{301F}'
            | '\u{FE41}'..='\u{FE44}'
            | '\u{FF02}'
            | '\u{FF07}'
            | '\u{FF62}'
            | '\u{FF63}'
    )
}

fn tokenize(conf: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut token = String::new();
    let mut quote: Option<char> = None;
    for c in conf.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                token.push(c);
            }
            None if is_quotation_mark(c) => {
                quote = Some(c);
                token.push(c);
            }
            None if c.is_whitespace() => {
                if !token.is_empty() {
                    tokens.push(std::mem::take(&mut token));
                }
            }
            None => token.push(c),
        }
    }
    if !token.is_empty() {
        tokens.push(token);
    }
    tokens
}

/// Strip surrounding quotes and interpret backslash escapes. Returns `None`
/// when the text is not a well-formed quoted literal; the caller keeps the
/// raw text in that case.
fn unquote(val: &str) -> Option<String> {
    let mut chars = val.chars();
    let quote = chars.next()?;
    if val.len() < 2 || !val.ends_with(quote) {
        return None;
    }
    let inner = &val[quote.len_utf8()..val.len() - quote.len_utf8()];
    match quote {
        '`' => (!inner.contains('`')).then(|| inner.to_string()),
        '\'' => {
            let unquoted = unescape(inner, quote)?;
            (unquoted.chars().count() == 1).then_some(unquoted)
        }
        '"' => unescape(inner, quote),
        _ => None,
    }
}

fn unescape(inner: &str, quote: char) -> Option<String> {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == quote {
            // unescaped closing quote before the end
            return None;
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            '0' => out.push('\0'),
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                out.push(u8::from_str_radix(&hex, 16).ok()? as char);
            }
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                out.push(char::from_u32(u32::from_str_radix(&hex, 16).ok()?)?);
            }
            _ => return None,
        }
    }
    Some(out)
}

fn parse_token(token: &str) -> Option<(String, String)> {
    let (key, val) = match token.split_once('=') {
        None => (String::new(), token.to_string()),
        Some(("", _)) => return None,
        Some((key, val)) => (key.to_string(), val.to_string()),
    };
    let val = match val.chars().next() {
        Some(c) if is_quotation_mark(c) => unquote(&val).unwrap_or(val),
        _ => val,
    };
    Some((key, val))
}

/// Parse a fluent configuration string into entries typed by `entry_key`,
/// each inheriting from `shared` plus any header keys in the text itself.
pub fn parse(conf: &str, entry_key: &str, shared: &Config) -> Vec<Config> {
    let mut shared = shared.clone();
    let mut entries: Vec<Config> = Vec::new();
    let mut current: Option<usize> = None;
    for token in tokenize(conf) {
        let Some((key, val)) = parse_token(&token) else {
            continue;
        };
        if key.is_empty() {
            entries.push(shared.copy_with(entry_key, &val));
            current = Some(entries.len() - 1);
        } else {
            match current {
                Some(i) => entries[i].insert(key, val),
                None => shared.insert(key, val),
            }
        }
    }
    entries
}

/// A single configuration entry: an ordered string-to-string map with
/// defaulting accessors. All `copy_*` operations are non-mutating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config(BTreeMap<String, String>);

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, val: impl Into<String>) {
        self.0.insert(name.into(), val.into());
    }

    pub fn get_str(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or(default).to_string()
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        self.get(name)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name).map(str::to_lowercase).as_deref() {
            Some("true" | "yes" | "1" | "t" | "y") => true,
            Some("false" | "no" | "0" | "f" | "n" | "-1") => false,
            _ => default,
        }
    }

    pub fn get_duration(&self, name: &str, default: Duration) -> Duration {
        self.get(name)
            .and_then(|s| humantime::parse_duration(s).ok())
            .unwrap_or(default)
    }

    pub fn copy_with(&self, name: &str, val: &str) -> Config {
        let mut ret = self.clone();
        ret.insert(name, val);
        ret
    }

    pub fn copy_with_all(&self, overrides: &Config) -> Config {
        let mut ret = self.clone();
        for (k, v) in &overrides.0 {
            ret.insert(k.clone(), v.clone());
        }
        ret
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Config {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut conf = Config::new();
        for (k, v) in pairs {
            conf.insert(k, v);
        }
        conf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_plain(conf: &str) -> Vec<Config> {
        parse(conf, "probe", &Config::new())
    }

    #[test]
    fn entries_without_header() {
        let got = parse_plain(
            r#"http uri=/xxx/xxx port=80
            tcp port=80
            exec command="bash -c 'echo foo'" timeout=2000 interval=10000
            "#,
        );
        let want = vec![
            Config::from([("probe", "http"), ("uri", "/xxx/xxx"), ("port", "80")]),
            Config::from([("probe", "tcp"), ("port", "80")]),
            Config::from([
                ("probe", "exec"),
                ("command", "bash -c 'echo foo'"),
                ("timeout", "2000"),
                ("interval", "10000"),
            ]),
        ];
        assert_eq!(got, want);
    }

    #[test]
    fn header_defaults_propagate() {
        let got = parse_plain(
            r#"timeout=5000 interval=5000 fall=3 rise=2
            http
                uri=/xxx/xxx
                port=80
            tcp
                port=80
            exec
                command="bash -c 'echo foo'"
                timeout=2000
                interval=10000
                fall=1
                rise=1"#,
        );
        let want = vec![
            Config::from([
                ("probe", "http"),
                ("uri", "/xxx/xxx"),
                ("port", "80"),
                ("timeout", "5000"),
                ("interval", "5000"),
                ("fall", "3"),
                ("rise", "2"),
            ]),
            Config::from([
                ("probe", "tcp"),
                ("port", "80"),
                ("timeout", "5000"),
                ("interval", "5000"),
                ("fall", "3"),
                ("rise", "2"),
            ]),
            Config::from([
                ("probe", "exec"),
                ("command", "bash -c 'echo foo'"),
                ("timeout", "2000"),
                ("interval", "10000"),
                ("fall", "1"),
                ("rise", "1"),
            ]),
        ];
        assert_eq!(got, want);
    }

    #[test]
    fn shared_config_argument_acts_as_header() {
        let shared = Config::from([
            ("timeout", "5000"),
            ("interval", "5000"),
            ("fall", "3"),
            ("rise", "2"),
        ]);
        let got = parse("http port=80", "probe", &shared);
        let want = vec![Config::from([
            ("probe", "http"),
            ("port", "80"),
            ("timeout", "5000"),
            ("interval", "5000"),
            ("fall", "3"),
            ("rise", "2"),
        ])];
        assert_eq!(got, want);
        // the argument itself is never mutated
        assert_eq!(shared.get("port"), None);
    }

    #[test]
    fn empty_input_yields_no_entries() {
        assert_eq!(parse_plain(""), Vec::<Config>::new());
    }

    #[test]
    fn header_only_yields_no_entries() {
        assert_eq!(parse_plain("abc=123 cde=test"), Vec::<Config>::new());
    }

    #[test]
    fn empty_key_tokens_are_discarded() {
        let got = parse_plain("abc=123 test =invalid test=def");
        let want = vec![Config::from([
            ("probe", "test"),
            ("abc", "123"),
            ("test", "def"),
        ])];
        assert_eq!(got, want);
    }

    #[test]
    fn quoted_values_preserve_whitespace() {
        let got = parse_plain(r#"http uri="/a b/c" note='x'"#);
        assert_eq!(got[0].get("uri"), Some("/a b/c"));
        assert_eq!(got[0].get("note"), Some("x"));
    }

    #[test]
    fn malformed_quotes_keep_raw_text() {
        // unbalanced closing quote: unquoting fails, raw text survives
        let got = parse_plain(r#"http uri="/a"#);
        assert_eq!(got[0].get("uri"), Some(r#""/a"#));
    }

    #[test]
    fn unquote_handles_escapes() {
        assert_eq!(unquote(r#""a\tb""#), Some("a\tb".to_string()));
        assert_eq!(unquote(r#""a\x41""#), Some("aA".to_string()));
        assert_eq!(unquote("`raw \\n`"), Some("raw \\n".to_string()));
        assert_eq!(unquote("'ab'"), None);
        assert_eq!(unquote(r#""bad\q""#), None);
    }

    #[test]
    fn accessors_fall_back_on_missing_or_invalid() {
        let c = Config::from([("int", "12"), ("eint", "n/a"), ("str", "str")]);
        assert_eq!(c.get_int("int", 0), 12);
        assert_eq!(c.get_int("eint", 99), 99);
        assert_eq!(c.get_str("str", "other"), "str");
        assert_eq!(c.get_str("nostr", "nostr"), "nostr");
    }

    #[test]
    fn bool_accessor_accepts_aliases() {
        let c = Config::from([
            ("a", "YES"),
            ("b", "t"),
            ("c", "-1"),
            ("d", "No"),
            ("e", "maybe"),
        ]);
        assert!(c.get_bool("a", false));
        assert!(c.get_bool("b", false));
        assert!(!c.get_bool("c", true));
        assert!(!c.get_bool("d", true));
        assert!(c.get_bool("e", true));
        assert!(!c.get_bool("missing", false));
    }

    #[test]
    fn duration_accessor_parses_suffixes() {
        let c = Config::from([("i", "5s"), ("j", "100ms"), ("bad", "5 parsecs")]);
        assert_eq!(c.get_duration("i", Duration::ZERO), Duration::from_secs(5));
        assert_eq!(
            c.get_duration("j", Duration::ZERO),
            Duration::from_millis(100)
        );
        assert_eq!(
            c.get_duration("bad", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    fn serialize(conf: &Config, entry_key: &str) -> String {
        let mut tokens = vec![conf.get(entry_key).unwrap_or_default().to_string()];
        for (k, v) in conf.iter() {
            if k == entry_key {
                continue;
            }
            if v.chars().any(char::is_whitespace) || v.is_empty() {
                tokens.push(format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")));
            } else {
                tokens.push(format!("{k}={v}"));
            }
        }
        tokens.join(" ")
    }

    #[test]
    fn entries_round_trip_through_serialization() {
        let entries = parse_plain(
            r#"interval=5s http uri="/a b" port=80 tcp port=443 name=edge"#,
        );
        for entry in entries {
            let reparsed = parse_plain(&serialize(&entry, "probe"));
            assert_eq!(reparsed, vec![entry]);
        }
    }
}
