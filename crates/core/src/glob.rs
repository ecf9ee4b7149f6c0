//! Glob patterns compiled to anchored regexes.
//!
//! `*` matches any run of characters (including `/`), `?` matches one
//! character, everything else is literal. Patterns without wildcards
//! compare as plain strings.

use std::sync::{OnceLock, RwLock};

use regex::Regex;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone)]
pub struct Glob {
    raw: String,
    re: Option<Regex>,
}

impl Glob {
    pub fn new(pattern: &str) -> Self {
        if !pattern.contains(['*', '?']) {
            return Self { raw: pattern.to_string(), re: None };
        }
        let mut rx = String::with_capacity(pattern.len() + 8);
        rx.push('^');
        let mut lit = [0u8; 4];
        for ch in pattern.chars() {
            match ch {
                '*' => rx.push_str(".*"),
                '?' => rx.push('.'),
                c => rx.push_str(&regex::escape(c.encode_utf8(&mut lit))),
            }
        }
        rx.push('$');
        // An uncompilable pattern degrades to a literal comparison.
        Self { raw: pattern.to_string(), re: Regex::new(&rx).ok() }
    }

    pub fn as_str(&self) -> &str { &self.raw }

    pub fn matches(&self, text: &str) -> bool {
        match &self.re {
            Some(re) => re.is_match(text),
            None => self.raw == text,
        }
    }
}

fn cache() -> &'static RwLock<FxHashMap<String, Glob>> {
    static CACHE: OnceLock<RwLock<FxHashMap<String, Glob>>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(FxHashMap::default()))
}

/// Match `text` against an ad-hoc pattern, compiling it at most once per process.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if let Ok(map) = cache().read() {
        if let Some(g) = map.get(pattern) {
            return g.matches(text);
        }
    }
    let g = Glob::new(pattern);
    let hit = g.matches(text);
    if let Ok(mut map) = cache().write() {
        map.insert(pattern.to_string(), g);
    }
    hit
}

pub fn match_any<S: AsRef<str>>(patterns: &[S], text: &str) -> bool {
    patterns.iter().any(|p| glob_match(p.as_ref(), text))
}
