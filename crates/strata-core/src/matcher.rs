//! Series selection
//!
//! A matcher selects series by label equality. The text form accepted by the
//! query API is
//!
//! ```text
//! metric_name{label="value", other!="value"}
//! {label="value"}
//! metric_name
//! ```
//!
//! An equality matcher against `""` selects series where the label is absent,
//! and a `!=` matcher selects series where the label is absent or different.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::series::{SeriesKey, METRIC_NAME_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl LabelMatcher {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
        }
    }

    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::NotEqual,
            value: value.into(),
        }
    }

    pub fn matches(&self, key: &SeriesKey) -> bool {
        let actual = key.get(&self.name).unwrap_or("");
        match self.op {
            MatchOp::Equal => actual == self.value,
            MatchOp::NotEqual => actual != self.value,
        }
    }
}

/// Conjunction of label matchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesMatcher {
    matchers: Vec<LabelMatcher>,
}

impl SeriesMatcher {
    pub fn new(matchers: Vec<LabelMatcher>) -> Result<Self> {
        // A selector that also matches the empty label set would select every series
        if matchers.iter().all(|m| m.matches_empty()) {
            return Err(Error::InvalidMatcher(
                "selector must contain at least one non-empty equality matcher".to_string(),
            ));
        }
        Ok(Self { matchers })
    }

    /// Select every series of one metric
    pub fn metric(name: &str) -> Self {
        Self {
            matchers: vec![LabelMatcher::equal(METRIC_NAME_LABEL, name)],
        }
    }

    pub fn with(mut self, matcher: LabelMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn matchers(&self) -> &[LabelMatcher] {
        &self.matchers
    }

    pub fn matches(&self, key: &SeriesKey) -> bool {
        self.matchers.iter().all(|m| m.matches(key))
    }

    pub fn parse(input: &str) -> Result<Self> {
        Parser::new(input).parse()
    }
}

impl LabelMatcher {
    fn matches_empty(&self) -> bool {
        match self.op {
            MatchOp::Equal => self.value.is_empty(),
            MatchOp::NotEqual => !self.value.is_empty(),
        }
    }
}

impl FromStr for SeriesMatcher {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SeriesMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .matchers
            .iter()
            .find(|m| m.name == METRIC_NAME_LABEL && m.op == MatchOp::Equal);
        if let Some(m) = name {
            f.write_str(&m.value)?;
        }
        f.write_str("{")?;
        let mut first = true;
        for m in &self.matchers {
            if name.is_some_and(|n| std::ptr::eq(n, m)) {
                continue;
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            let op = match m.op {
                MatchOp::Equal => "=",
                MatchOp::NotEqual => "!=",
            };
            write!(f, "{}{}{:?}", m.name, op, m.value)?;
        }
        f.write_str("}")
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Result<SeriesMatcher> {
        let mut matchers = Vec::new();

        self.skip_ws();
        if self.peek().is_some_and(is_ident_start) {
            let name = self.ident()?;
            matchers.push(LabelMatcher::equal(METRIC_NAME_LABEL, name));
            self.skip_ws();
        }

        if self.peek() == Some('{') {
            self.bump();
            loop {
                self.skip_ws();
                if self.peek() == Some('}') {
                    self.bump();
                    break;
                }

                let name = self.ident()?;
                self.skip_ws();
                let op = match (self.bump(), self.peek()) {
                    (Some('='), _) => MatchOp::Equal,
                    (Some('!'), Some('=')) => {
                        self.bump();
                        MatchOp::NotEqual
                    }
                    _ => return Err(self.error("expected '=' or '!='")),
                };
                self.skip_ws();
                let value = self.quoted()?;
                matchers.push(LabelMatcher { name, op, value });

                self.skip_ws();
                match self.bump() {
                    Some(',') => continue,
                    Some('}') => break,
                    _ => return Err(self.error("expected ',' or '}'")),
                }
            }
        }

        self.skip_ws();
        if self.pos != self.input.len() {
            return Err(self.error("unexpected trailing input"));
        }
        if matchers.is_empty() {
            return Err(Error::InvalidMatcher("empty selector".to_string()));
        }
        SeriesMatcher::new(matchers)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn ident(&mut self) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if is_ident_start(c) => {
                self.bump();
            }
            _ => return Err(self.error("expected identifier")),
        }
        while self
            .peek()
            .is_some_and(|c| is_ident_start(c) || c.is_ascii_digit())
        {
            self.bump();
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn quoted(&mut self) -> Result<String> {
        if self.bump() != Some('"') {
            return Err(self.error("expected '\"'"));
        }
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c @ ('"' | '\\')) => out.push(c),
                    _ => return Err(self.error("invalid escape")),
                },
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::InvalidMatcher(format!("{} at offset {} in {:?}", msg, self.pos, self.input))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, pairs: &[(&str, &str)]) -> SeriesKey {
        SeriesKey::metric(name, pairs).unwrap()
    }

    #[test]
    fn test_parse_metric_with_labels() {
        let m = SeriesMatcher::parse(r#"cpu{host="a", dc!="us"}"#).unwrap();
        assert_eq!(m.matchers().len(), 3);
        assert!(m.matches(&key("cpu", &[("host", "a"), ("dc", "eu")])));
        assert!(m.matches(&key("cpu", &[("host", "a")])));
        assert!(!m.matches(&key("cpu", &[("host", "a"), ("dc", "us")])));
        assert!(!m.matches(&key("mem", &[("host", "a")])));
    }

    #[test]
    fn test_parse_bare_metric_and_label_only() {
        let m = SeriesMatcher::parse("up").unwrap();
        assert!(m.matches(&key("up", &[("job", "x")])));

        let m = SeriesMatcher::parse(r#"{job="api"}"#).unwrap();
        assert!(m.matches(&key("up", &[("job", "api")])));
        assert!(m.matches(&key("down", &[("job", "api")])));
        assert!(!m.matches(&key("up", &[("job", "db")])));
    }

    #[test]
    fn test_escapes_and_trailing_comma() {
        let m = SeriesMatcher::parse(r#"x{path="a\"b",}"#).unwrap();
        assert!(m.matches(&key("x", &[("path", "a\"b")])));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "{}",
            r#"{job!="x"}"#,
            r#"cpu{host="a""#,
            r#"cpu{host=a}"#,
            r#"cpu{host~"a"}"#,
            r#"cpu{host="a"} extra"#,
            "1cpu",
        ] {
            let err = SeriesMatcher::parse(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidMatcher(_)), "{bad}");
        }
    }

    #[test]
    fn test_display_parses_back() {
        let m = SeriesMatcher::parse(r#"cpu{host="a",dc!="us"}"#).unwrap();
        let text = m.to_string();
        assert_eq!(text, r#"cpu{host="a",dc!="us"}"#);
        assert_eq!(SeriesMatcher::parse(&text).unwrap(), m);
    }
}
