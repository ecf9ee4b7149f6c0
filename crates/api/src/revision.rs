//! Ambiguous -> concrete revision resolution through the repo backend.

use std::sync::Arc;

use keel_core::{ports::RepoBackend, AppSource, Application};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolved {
    pub revision: String,
    pub display: String,
}

/// Result of resolving a request against an Application.
///
/// Single-source apps fill `single`. Multi-source apps fill `sources` with
/// one `(position, resolved)` pair per requested override, in request order;
/// no overrides leaves both empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRevisions {
    pub single: Option<Resolved>,
    pub sources: Vec<(usize, Resolved)>,
}

impl ResolvedRevisions {
    pub fn revisions(&self) -> Vec<String> { self.sources.iter().map(|(_, r)| r.revision.clone()).collect() }
    pub fn displays(&self) -> Vec<String> { self.sources.iter().map(|(_, r)| r.display.clone()).collect() }
    pub fn positions(&self) -> Vec<usize> { self.sources.iter().map(|(p, _)| *p).collect() }
}

/// Revision overrides as supplied by a caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct RevisionRequest<'a> {
    pub revision: &'a str,
    pub revisions: &'a [String],
    pub positions: &'a [usize],
}

/// Full commit SHA-1 or SHA-256.
pub fn is_commit_sha(rev: &str) -> bool { (rev.len() == 40 || rev.len() == 64) && rev.bytes().all(|b| b.is_ascii_hexdigit()) }

pub struct RevisionResolver {
    repo: Arc<dyn RepoBackend>,
}

impl RevisionResolver {
    pub fn new(repo: Arc<dyn RepoBackend>) -> Self { Self { repo } }

    pub async fn resolve(&self, app: &Application, req: RevisionRequest<'_>) -> AppResult<ResolvedRevisions> {
        if app.is_multi_source() {
            return self.resolve_multi(app, req).await;
        }
        let source = app.spec.source.clone().unwrap_or_default();
        let ambiguous = if !req.revision.is_empty() {
            req.revision
        } else if !source.target_revision.is_empty() {
            source.target_revision.as_str()
        } else {
            "HEAD"
        };
        let single = self.resolve_one(&source, ambiguous).await?;
        Ok(ResolvedRevisions { single: Some(single), sources: Vec::new() })
    }

    async fn resolve_multi(&self, app: &Application, req: RevisionRequest<'_>) -> AppResult<ResolvedRevisions> {
        if req.revisions.len() != req.positions.len() {
            return Err(AppError::InvalidArgument(format!(
                "number of revisions ({}) does not match number of source positions ({})",
                req.revisions.len(),
                req.positions.len()
            )));
        }
        let mut out = ResolvedRevisions::default();
        for (pos, rev) in req.positions.iter().copied().zip(req.revisions) {
            let source = app
                .spec
                .sources
                .get(pos)
                .ok_or_else(|| AppError::InvalidArgument(format!("source position {pos} is out of range")))?;
            let ambiguous = if rev.is_empty() { source.target_revision.as_str() } else { rev.as_str() };
            let ambiguous = if ambiguous.is_empty() { "HEAD" } else { ambiguous };
            out.sources.push((pos, self.resolve_one(source, ambiguous).await?));
        }
        Ok(out)
    }

    async fn resolve_one(&self, source: &AppSource, ambiguous: &str) -> AppResult<Resolved> {
        if !source.is_helm() && is_commit_sha(ambiguous) {
            return Ok(Resolved { revision: ambiguous.to_string(), display: ambiguous.to_string() });
        }
        let r = self
            .repo
            .resolve_revision(source, ambiguous)
            .await
            .map_err(|e| AppError::Unavailable(format!("unable to resolve revision {ambiguous:?} of {}: {e:#}", source.repo_url)))?;
        debug!(repo = %source.repo_url, ambiguous, revision = %r.revision, "api: revision resolved");
        Ok(Resolved { revision: r.revision, display: r.display })
    }
}
