//! Kubernetes label selectors (equality and set based).
//!
//! Grammar: requirements separated by commas, each one of `key`, `!key`,
//! `key=v`, `key==v`, `key!=v`, `key in (a,b)`, `key notin (a,b)`,
//! `key>n`, `key<n` (integer `n`).

use std::collections::BTreeMap;
use std::str::FromStr;

use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unable to parse requirement in {input:?}: {reason}")]
pub struct SelectorError {
    pub input: String,
    pub reason: String,
}

type Values = SmallVec<[String; 4]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Exists(String),
    NotExists(String),
    Equals(String, String),
    NotEquals(String, String),
    In(String, Values),
    NotIn(String, Values),
    Gt(String, i64),
    Lt(String, i64),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).map(|l| vs.contains(l)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|l| !vs.contains(l)).unwrap_or(true),
            Requirement::Gt(k, n) => labels.get(k).and_then(|l| l.parse::<i64>().ok()).map(|l| l > *n).unwrap_or(false),
            Requirement::Lt(k, n) => labels.get(k).and_then(|l| l.parse::<i64>().ok()).map(|l| l < *n).unwrap_or(false),
        }
    }
}

/// Conjunction of requirements; the empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    reqs: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self { Self::default() }
    pub fn is_empty(&self) -> bool { self.reqs.is_empty() }
    pub fn requirements(&self) -> &[Requirement] { &self.reqs }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool { self.reqs.iter().all(|r| r.matches(labels)) }

    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        if input.trim().is_empty() {
            return Ok(Self::everything());
        }
        let toks = lex(input)?;
        Parser { input, toks, pos: 0 }.selector()
    }
}

impl FromStr for Selector {
    type Err = SelectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Selector::parse(s) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Bang,
    Eq,
    DoubleEq,
    NotEq,
    Gt,
    Lt,
    LParen,
    RParen,
    Comma,
    In,
    NotIn,
}

fn is_ident_char(c: char) -> bool { c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/') }

fn lex(input: &str) -> Result<Vec<Tok>, SelectorError> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => { chars.next(); }
            ',' => { chars.next(); out.push(Tok::Comma); }
            '(' => { chars.next(); out.push(Tok::LParen); }
            ')' => { chars.next(); out.push(Tok::RParen); }
            '>' => { chars.next(); out.push(Tok::Gt); }
            '<' => { chars.next(); out.push(Tok::Lt); }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') { chars.next(); out.push(Tok::DoubleEq); } else { out.push(Tok::Eq); }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') { chars.next(); out.push(Tok::NotEq); } else { out.push(Tok::Bang); }
            }
            c if is_ident_char(c) => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_ident_char(c) { break; }
                    s.push(c);
                    chars.next();
                }
                out.push(match s.as_str() { "in" => Tok::In, "notin" => Tok::NotIn, _ => Tok::Ident(s) });
            }
            other => {
                return Err(SelectorError { input: input.to_string(), reason: format!("unexpected character {other:?}") });
            }
        }
    }
    Ok(out)
}

struct Parser<'a> {
    input: &'a str,
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser<'_> {
    fn err(&self, reason: impl Into<String>) -> SelectorError {
        SelectorError { input: self.input.to_string(), reason: reason.into() }
    }

    fn peek(&self) -> Option<&Tok> { self.toks.get(self.pos) }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn ident(&mut self, what: &str) -> Result<String, SelectorError> {
        match self.next() {
            Some(Tok::Ident(s)) => Ok(s),
            other => Err(self.err(format!("expected {what}, found {other:?}"))),
        }
    }

    fn selector(mut self) -> Result<Selector, SelectorError> {
        let mut reqs = Vec::new();
        loop {
            reqs.push(self.requirement()?);
            match self.next() {
                None => break,
                Some(Tok::Comma) => continue,
                Some(other) => return Err(self.err(format!("expected ',' between requirements, found {other:?}"))),
            }
        }
        Ok(Selector { reqs })
    }

    fn requirement(&mut self) -> Result<Requirement, SelectorError> {
        if self.peek() == Some(&Tok::Bang) {
            self.next();
            return Ok(Requirement::NotExists(self.ident("label key")?));
        }
        let key = self.ident("label key")?;
        match self.peek().cloned() {
            None | Some(Tok::Comma) => Ok(Requirement::Exists(key)),
            Some(Tok::Eq) | Some(Tok::DoubleEq) => {
                self.next();
                Ok(Requirement::Equals(key, self.value()))
            }
            Some(Tok::NotEq) => {
                self.next();
                Ok(Requirement::NotEquals(key, self.value()))
            }
            Some(Tok::In) => {
                self.next();
                Ok(Requirement::In(key, self.set()?))
            }
            Some(Tok::NotIn) => {
                self.next();
                Ok(Requirement::NotIn(key, self.set()?))
            }
            Some(op @ (Tok::Gt | Tok::Lt)) => {
                self.next();
                let raw = self.value();
                let n = raw
                    .parse::<i64>()
                    .map_err(|_| self.err(format!("for 'Gt', 'Lt' operators, the value must be an integer, got {raw:?}")))?;
                Ok(if op == Tok::Gt { Requirement::Gt(key, n) } else { Requirement::Lt(key, n) })
            }
            Some(other) => Err(self.err(format!("unexpected {other:?} after key {key:?}"))),
        }
    }

    /// Optional value: `key=` selects the empty label value.
    fn value(&mut self) -> String {
        if let Some(Tok::Ident(s)) = self.peek() {
            let s = s.clone();
            self.pos += 1;
            return s;
        }
        String::new()
    }

    fn set(&mut self) -> Result<Values, SelectorError> {
        match self.next() {
            Some(Tok::LParen) => {}
            other => return Err(self.err(format!("expected '(' to open value set, found {other:?}"))),
        }
        let mut vals = Values::new();
        loop {
            vals.push(self.value());
            match self.next() {
                Some(Tok::Comma) => continue,
                Some(Tok::RParen) => break,
                other => return Err(self.err(format!("expected ',' or ')' in value set, found {other:?}"))),
            }
        }
        Ok(vals)
    }
}
