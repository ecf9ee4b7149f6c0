//! Keel RBAC: a small CSV policy engine answering
//! `enforce(claims, resource, action, object)`.
//!
//! The enforcer keeps a built-in document, an operator-supplied document and
//! a default role. Both documents are merged and swapped in atomically, so
//! readers never observe a half-loaded policy. For bulk scans,
//! [`Enforcer::for_claims`] resolves the principal's subjects once and keeps
//! only the rules that can apply to them.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use keel_core::Claims;
use tracing::debug;

pub mod policy;

pub use policy::{Effect, Policy, Rule};

/// Built-in roles shipped with the binary.
pub const BUILTIN_POLICY: &str = include_str!("builtin-policy.csv");

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("policy line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Outcome of evaluating every applicable rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// An explicit deny matched; it outranks any allow.
    Deny,
    NoMatch,
}

impl Decision {
    pub fn allowed(self) -> bool { matches!(self, Decision::Allow) }
}

fn decide_rules<'a, I>(rules: I, resource: &str, action: &str, object: &str) -> Decision
where
    I: IntoIterator<Item = &'a Rule>,
{
    let mut allowed = false;
    for r in rules {
        if !r.matches(resource, action, object) {
            continue;
        }
        match r.effect {
            Effect::Deny => return Decision::Deny,
            Effect::Allow => allowed = true,
        }
    }
    if allowed { Decision::Allow } else { Decision::NoMatch }
}

#[derive(Debug, Default)]
struct State {
    builtin: Policy,
    user: Policy,
    merged: Policy,
    default_role: String,
}

impl State {
    fn remerge(mut self) -> Self {
        self.merged = self.builtin.merged(&self.user);
        self
    }
}

pub struct Enforcer {
    state: ArcSwap<State>,
}

impl Default for Enforcer {
    fn default() -> Self { Self { state: ArcSwap::from_pointee(State::default()) } }
}

impl Enforcer {
    /// An enforcer with no rules: everything is denied.
    pub fn new() -> Self { Self::default() }

    /// An enforcer preloaded with [`BUILTIN_POLICY`].
    pub fn with_builtin() -> Result<Self, PolicyError> {
        let e = Self::new();
        e.set_builtin_policy(BUILTIN_POLICY)?;
        Ok(e)
    }

    fn swap<F: FnOnce(&mut State)>(&self, f: F) {
        let cur = self.state.load();
        let mut next = State {
            builtin: cur.builtin.clone(),
            user: cur.user.clone(),
            merged: Policy::default(),
            default_role: cur.default_role.clone(),
        };
        f(&mut next);
        self.state.store(Arc::new(next.remerge()));
    }

    pub fn set_builtin_policy(&self, csv: &str) -> Result<(), PolicyError> {
        let p = Policy::parse(csv)?;
        debug!(rules = p.rules.len(), "rbac: builtin policy loaded");
        self.swap(|s| s.builtin = p);
        Ok(())
    }

    pub fn set_user_policy(&self, csv: &str) -> Result<(), PolicyError> {
        let p = Policy::parse(csv)?;
        debug!(rules = p.rules.len(), "rbac: user policy loaded");
        self.swap(|s| s.user = p);
        Ok(())
    }

    /// Role granted to every principal, including anonymous ones. Empty clears it.
    pub fn set_default_role(&self, role: &str) {
        let role = role.trim().to_string();
        self.swap(|s| s.default_role = role);
    }

    /// The principal's subject, its groups, the default role and every role
    /// reachable from those.
    pub fn subjects(&self, claims: &Claims) -> Vec<String> {
        let st = self.state.load();
        subjects_of(&st, claims)
    }

    pub fn decide(&self, claims: &Claims, resource: &str, action: &str, object: &str) -> Decision {
        let st = self.state.load();
        let subs = subjects_of(&st, claims);
        decide_rules(st.merged.rules.iter().filter(|r| subs.contains(&r.subject)), resource, action, object)
    }

    pub fn enforce(&self, claims: &Claims, resource: &str, action: &str, object: &str) -> bool {
        self.decide(claims, resource, action, object).allowed()
    }

    /// Resolve `claims` once against the current policy for repeated checks.
    pub fn for_claims(&self, claims: &Claims) -> ClaimsEnforcer {
        let st = self.state.load();
        let subs = subjects_of(&st, claims);
        let rules: Vec<Rule> = st.merged.rules.iter().filter(|r| subs.contains(&r.subject)).cloned().collect();
        ClaimsEnforcer { rules }
    }
}

fn subjects_of(st: &State, claims: &Claims) -> Vec<String> {
    let seeds = claims
        .subject
        .iter()
        .map(String::as_str)
        .chain(claims.groups.iter().map(String::as_str))
        .chain(std::iter::once(st.default_role.as_str()));
    st.merged.expand_subjects(seeds)
}

/// Rules pre-filtered for one principal.
#[derive(Debug, Clone)]
pub struct ClaimsEnforcer {
    rules: Vec<Rule>,
}

impl ClaimsEnforcer {
    pub fn decide(&self, resource: &str, action: &str, object: &str) -> Decision {
        decide_rules(self.rules.iter(), resource, action, object)
    }

    pub fn enforce(&self, resource: &str, action: &str, object: &str) -> bool { self.decide(resource, action, object).allowed() }

    /// Number of rules that can apply to the principal.
    pub fn len(&self) -> usize { self.rules.len() }
    pub fn is_empty(&self) -> bool { self.rules.is_empty() }
}
