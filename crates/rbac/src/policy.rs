//! CSV policy documents.
//!
//! Two line shapes are understood:
//!
//! ```text
//! p, <subject>, <resource>, <action>, <object>[, allow|deny]
//! g, <subject>, <role>
//! ```
//!
//! Blank lines and `#` comments are skipped. Resource, action and object
//! fields are globs; subjects are literal.

use keel_core::glob::Glob;
use rustc_hash::FxHashMap;

use crate::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub subject: String,
    pub resource: Glob,
    pub action: Glob,
    pub object: Glob,
    pub effect: Effect,
}

impl Rule {
    pub fn matches(&self, resource: &str, action: &str, object: &str) -> bool {
        self.resource.matches(resource) && self.action.matches(action) && self.object.matches(object)
    }
}

/// A parsed policy: permission rules plus the role graph.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub rules: Vec<Rule>,
    /// subject -> roles it is granted
    pub grants: FxHashMap<String, Vec<String>>,
}

impl Policy {
    pub fn parse(csv: &str) -> Result<Self, PolicyError> {
        let mut out = Policy::default();
        for (idx, raw) in csv.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let bad = |reason: &str| PolicyError::Malformed { line: idx + 1, reason: reason.to_string() };
            match fields.as_slice() {
                ["p", sub, res, act, obj] => out.rules.push(rule(sub, res, act, obj, Effect::Allow)),
                ["p", sub, res, act, obj, eff] => {
                    let effect = match eff.to_ascii_lowercase().as_str() {
                        "allow" => Effect::Allow,
                        "deny" => Effect::Deny,
                        _ => return Err(bad("effect must be allow or deny")),
                    };
                    out.rules.push(rule(sub, res, act, obj, effect));
                }
                ["p", ..] => return Err(bad("expected p, subject, resource, action, object[, effect]")),
                ["g", sub, role] => out.grants.entry(sub.to_string()).or_default().push(role.to_string()),
                ["g", ..] => return Err(bad("expected g, subject, role")),
                _ => return Err(bad("line must start with p or g")),
            }
        }
        Ok(out)
    }

    /// Concatenate two documents, `self` first.
    pub fn merged(&self, other: &Policy) -> Policy {
        let mut out = self.clone();
        out.rules.extend(other.rules.iter().cloned());
        for (sub, roles) in &other.grants {
            out.grants.entry(sub.clone()).or_default().extend(roles.iter().cloned());
        }
        out
    }

    /// `seeds` plus every role reachable from them through `g` lines.
    pub fn expand_subjects<'a, I>(&self, seeds: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out: Vec<String> = Vec::new();
        let mut stack: Vec<String> = seeds.into_iter().filter(|s| !s.is_empty()).map(str::to_string).collect();
        while let Some(s) = stack.pop() {
            if out.contains(&s) {
                continue;
            }
            if let Some(roles) = self.grants.get(&s) {
                stack.extend(roles.iter().filter(|r| !out.contains(r)).cloned());
            }
            out.push(s);
        }
        out
    }
}

fn rule(sub: &str, res: &str, act: &str, obj: &str, effect: Effect) -> Rule {
    Rule { subject: sub.to_string(), resource: Glob::new(res), action: Glob::new(act), object: Glob::new(obj), effect }
}
