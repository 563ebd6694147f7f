//! Filter expressions over container metadata.
//!
//! The syntax follows containerd's filters:
//!
//! ```text
//! config.labels.app==web,config.env.TIER!=batch
//! label."io.kubernetes.pod.namespace"==default
//! config.image~=^docker\.io/
//! config.labels.expose
//! ```
//!
//! Terms are separated by `,` and all must match. A bare field path tests for
//! presence. The empty expression matches every container.

use regex::Regex;

use crate::error::DiscoveryError;
use crate::metadata::Adaptor;

/// Comparison applied by a single term.
#[derive(Debug, Clone)]
enum Operator {
    Present,
    Equal(String),
    NotEqual(String),
    Matches(Regex),
}

#[derive(Debug, Clone)]
struct Selector {
    path: Vec<String>,
    operator: Operator,
}

impl Selector {
    fn matches<A: Adaptor + ?Sized>(&self, adaptor: &A) -> bool {
        let path: Vec<&str> = self.path.iter().map(String::as_str).collect();
        let value = adaptor.field(&path);
        match &self.operator {
            Operator::Present => value.is_some(),
            Operator::Equal(expected) => value.as_deref() == Some(expected.as_str()),
            Operator::NotEqual(expected) => value.as_deref().unwrap_or("") != expected,
            Operator::Matches(re) => value.is_some_and(|v| re.is_match(&v)),
        }
    }
}

/// A compiled, immutable filter.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    selectors: Vec<Selector>,
}

impl Filter {
    /// Compile a filter expression.
    pub fn parse(expr: &str) -> Result<Self, DiscoveryError> {
        Parser::new(expr).parse()
    }

    /// Evaluate the filter against a container.
    pub fn matches<A: Adaptor + ?Sized>(&self, adaptor: &A) -> bool {
        self.selectors.iter().all(|s| s.matches(adaptor))
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

    fn parse(mut self) -> Result<Filter, DiscoveryError> {
        let mut selectors = Vec::new();
        self.skip_whitespace();
        if self.at_end() {
            return Ok(Filter { selectors });
        }

        loop {
            selectors.push(self.selector()?);
            self.skip_whitespace();
            match self.peek() {
                None => break,
                Some(',') => {
                    self.bump();
                    self.skip_whitespace();
                }
                Some(c) => return Err(self.error(format!("unexpected {c:?}"))),
            }
        }

        Ok(Filter { selectors })
    }

    fn selector(&mut self) -> Result<Selector, DiscoveryError> {
        let path = self.field_path()?;
        self.skip_whitespace();

        let operator = if self.eat("==") {
            Operator::Equal(self.value()?)
        } else if self.eat("!=") {
            Operator::NotEqual(self.value()?)
        } else if self.eat("~=") {
            let start = self.pos;
            let pattern = self.value()?;
            let re = Regex::new(&pattern).map_err(|e| DiscoveryError::Parse {
                expr: self.input.to_string(),
                offset: start,
                reason: e.to_string(),
            })?;
            Operator::Matches(re)
        } else {
            match self.peek() {
                None | Some(',') => Operator::Present,
                Some(c) => return Err(self.error(format!("expected operator, found {c:?}"))),
            }
        };

        Ok(Selector { path, operator })
    }

    fn field_path(&mut self) -> Result<Vec<String>, DiscoveryError> {
        let mut path = vec![self.segment()?];
        while self.peek() == Some('.') {
            self.bump();
            path.push(self.segment()?);
        }
        Ok(path)
    }

    fn segment(&mut self) -> Result<String, DiscoveryError> {
        if self.peek() == Some('"') {
            return self.quoted();
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, '.' | ',' | '=' | '!' | '~' | '"') {
                break;
            }
            self.bump();
        }
        if self.pos == start {
            return Err(self.error("expected field name".to_string()));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn value(&mut self) -> Result<String, DiscoveryError> {
        self.skip_whitespace();
        if self.peek() == Some('"') {
            return self.quoted();
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ',' {
                break;
            }
            self.bump();
        }
        let value = self.input[start..self.pos].trim_end();
        if value.is_empty() {
            return Err(self.error("expected value".to_string()));
        }
        Ok(value.to_string())
    }

    fn quoted(&mut self) -> Result<String, DiscoveryError> {
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(DiscoveryError::Parse {
                        expr: self.input.to_string(),
                        offset: start,
                        reason: "unterminated quote".to_string(),
                    })
                }
                Some('"') => {
                    self.bump();
                    return Ok(out);
                }
                Some('\\') => {
                    self.bump();
                    match self.peek() {
                        Some(c) => {
                            out.push(c);
                            self.bump();
                        }
                        None => continue,
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.bump();
                }
            }
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.input[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn error(&self, reason: String) -> DiscoveryError {
        DiscoveryError::Parse {
            expr: self.input.to_string(),
            offset: self.pos,
            reason,
        }
    }
}
