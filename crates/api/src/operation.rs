//! Sync, rollback and terminate: the only stage transitions the API layer
//! owns (Idle/Terminal -> Pending, Running -> Terminating).

use std::time::Instant;

use chrono::Utc;
use keel_core::{
    ports::{RevisionMetadata, REASON_OPERATION_STARTED},
    AppSource, Application, Claims, InitiatedBy, ObjectKey, Operation, OperationInfo, OperationPhase, RevisionHistory, Stage, SyncOperation,
    SyncResource, SyncStrategy, WindowState,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    revision::{ResolvedRevisions, RevisionRequest},
    AppError, AppRef, AppResult, AppService, Check,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub app: AppRef,
    #[serde(default)]
    pub revision: String,
    /// Multi-source overrides, paired with `source_positions` (zero-based).
    #[serde(default)]
    pub revisions: Vec<String>,
    #[serde(default)]
    pub source_positions: Vec<usize>,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Inline manifests for a local sync.
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub sync_options: Vec<String>,
    #[serde(default)]
    pub resources: Vec<SyncResource>,
    #[serde(default)]
    pub strategy: Option<SyncStrategy>,
    #[serde(default)]
    pub infos: Vec<OperationInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub app: AppRef,
    pub id: i64,
    /// Required when the history entry and the live app differ in source count.
    #[serde(default)]
    pub source_index: Option<usize>,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionMetadataRequest {
    pub app: AppRef,
    /// Revision to describe; defaults to the chosen source's target revision.
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub source_index: Option<usize>,
    #[serde(default)]
    pub version_id: Option<i64>,
}

const IN_PROGRESS: &str = "another operation is already in progress";

fn ensure_idle(app: &Application) -> AppResult<()> {
    match app.stage() {
        Stage::Idle | Stage::Terminal(_) => Ok(()),
        _ => Err(AppError::FailedPrecondition(IN_PROGRESS.into())),
    }
}

fn target_of(source: Option<&AppSource>) -> &str { source.map(|s| s.target_revision.as_str()).unwrap_or("") }

/// Automated sync pins the app to its spec; only dry runs may deviate.
fn check_auto_sync(app: &Application, req: &SyncRequest) -> AppResult<()> {
    if !app.automated_sync() || req.dry_run {
        return Ok(());
    }
    if !req.manifests.is_empty() {
        return Err(AppError::FailedPrecondition("Cannot use local sync when Automatic Sync Policy is enabled except with dry run".into()));
    }
    let mismatch = |asked: &str, target: &str| AppError::FailedPrecondition(format!("Cannot sync to {asked}: auto-sync currently set to {target}"));
    if app.is_multi_source() {
        for (pos, rev) in req.source_positions.iter().zip(&req.revisions) {
            let target = target_of(app.spec.sources.get(*pos));
            if !rev.is_empty() && rev != target {
                return Err(mismatch(rev, target));
            }
        }
    } else {
        let target = target_of(app.spec.source.as_ref());
        if !req.revision.is_empty() && req.revision != target {
            return Err(mismatch(&req.revision, target));
        }
    }
    Ok(())
}

/// Sync payload reconstructing a history entry, honoring `index` when the
/// entry and the live app differ in source cardinality.
pub fn rollback_payload(app: &Application, entry: &RevisionHistory, index: Option<usize>) -> AppResult<SyncOperation> {
    let not_found = |i: usize| AppError::InvalidArgument(format!("source index {i} not found"));
    match (app.is_multi_source(), entry.is_multi_source(), index) {
        (false, false, _) => Ok(SyncOperation { source: entry.source.clone(), revision: entry.revision.clone(), ..Default::default() }),
        (true, true, _) => Ok(SyncOperation { sources: entry.sources.clone(), revisions: entry.revisions.clone(), ..Default::default() }),
        (live_multi, _, None) => Err(AppError::InvalidArgument(format!(
            "deployment {} has {} source(s) while the application has {}; a source index is required to roll back across a source-count change",
            entry.id,
            entry.recorded_sources().len(),
            if live_multi { app.spec.sources.len() } else { 1 }
        ))),
        (false, true, Some(i)) => {
            let source = entry.sources.get(i).cloned().ok_or_else(|| not_found(i))?;
            let revision = entry.revisions.get(i).cloned().unwrap_or_default();
            Ok(SyncOperation { source: Some(source), revision, ..Default::default() })
        }
        (true, false, Some(i)) => {
            let mut sources = app.spec.sources.clone();
            if i >= sources.len() {
                return Err(not_found(i));
            }
            let mut revisions: Vec<String> = sources.iter().map(|s| s.target_revision.clone()).collect();
            sources[i] = entry.source.clone().ok_or_else(|| not_found(i))?;
            revisions[i] = entry.revision.clone();
            Ok(SyncOperation { sources, revisions, ..Default::default() })
        }
    }
}

/// Which source (and default revision) a metadata lookup describes.
pub fn metadata_source(app: &Application, source_index: Option<usize>, version_id: Option<i64>) -> AppResult<AppSource> {
    let out_of_range = |i: usize, n: usize| {
        let tail = if n == 1 { "there is only 1 source".to_string() } else { format!("there are only {n} sources") };
        AppError::InvalidArgument(format!("source index {i} not found because {tail}"))
    };
    let Some(v) = version_id else {
        return match source_index {
            None => app.source_at(0).cloned().ok_or_else(|| AppError::FailedPrecondition("application has no source".into())),
            Some(i) => app.source_at(i).cloned().ok_or_else(|| out_of_range(i, app.source_count().max(1))),
        };
    };
    if app.status.history.is_empty() {
        return Err(AppError::InvalidArgument(format!("version ID {v} not found because the app has no history")));
    }
    let entry = app
        .status
        .history
        .iter()
        .find(|h| h.id == v)
        .ok_or_else(|| AppError::InvalidArgument(format!("history not found for version ID {v}")))?;
    let recorded = entry.recorded_sources();
    let i = source_index.unwrap_or(0);
    recorded.get(i).cloned().ok_or_else(|| out_of_range(i, recorded.len().max(1)))
}

impl AppService {
    /// Store `op` on the app, re-reading and retrying on version conflicts.
    async fn set_operation(&self, key: &ObjectKey, op: Operation, kind: &'static str) -> AppResult<Application> {
        for attempt in 0..=self.cfg.conflict_retries {
            let mut app = self.store.get(key).await?;
            ensure_idle(&app)?;
            app.operation = Some(op.clone());
            match self.store.update(app).await {
                Ok(a) => return Ok(a),
                Err(e) if e.is_conflict() => {
                    counter!("operation_conflicts_total", 1u64, "op" => kind);
                    debug!(app = %key, attempt, "api: operation write conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Conflict(format!("unable to set {kind} operation on {key} after {} attempts", self.cfg.conflict_retries + 1)))
    }

    /// Sync windows of `app`'s project, evaluated now.
    async fn window_state(&self, app: &Application, manual: bool) -> AppResult<WindowState> {
        let project = self
            .projects
            .get(app.project())
            .await?
            .ok_or_else(|| AppError::FailedPrecondition(format!("project '{}' does not exist", app.project())))?;
        Ok(WindowState::evaluate(&project.spec.sync_windows, app, manual, Utc::now())?)
    }

    /// Assigned and active sync windows, and whether a manual sync may start now.
    pub async fn sync_windows(&self, claims: &Claims, r: &AppRef) -> AppResult<WindowState> {
        let app = self.authz.resolve(claims, r, Check::Action("get")).await?;
        self.window_state(&app, true).await
    }

    pub async fn sync(&self, claims: &Claims, req: SyncRequest) -> AppResult<Application> {
        let t0 = Instant::now();
        let app = self.authz.resolve(claims, &req.app, Check::Action("sync")).await?;
        if !req.manifests.is_empty() {
            self.authz.require(claims, Check::Action("override"), &app)?;
        }
        let key = app.key();
        let _guard = self.locks.lock(&key).await;
        let app = self.store.get(&key).await?;
        ensure_idle(&app)?;
        check_auto_sync(&app, &req)?;
        if !self.window_state(&app, true).await?.can_sync {
            return Err(AppError::FailedPrecondition("cannot sync: blocked by sync window".into()));
        }

        let resolved = self
            .revisions
            .resolve(&app, RevisionRequest { revision: &req.revision, revisions: &req.revisions, positions: &req.source_positions })
            .await?;
        let mut sync = SyncOperation {
            prune: req.prune,
            dry_run: req.dry_run,
            manifests: req.manifests.clone(),
            sync_options: req.sync_options.clone(),
            resources: req.resources.clone(),
            sync_strategy: req.strategy,
            ..Default::default()
        };
        let what = describe_sync(&app, &req, &resolved);
        match &resolved.single {
            Some(r) => sync.revision = r.revision.clone(),
            None => {
                sync.revisions = resolved.revisions();
                sync.source_positions = resolved.positions();
            }
        }
        let op = Operation {
            sync: Some(sync),
            initiated_by: InitiatedBy { username: claims.subject.clone().unwrap_or_default(), automated: false },
            info: req.infos.clone(),
        };
        let updated = self.set_operation(&key, op, "sync").await?;
        counter!("operations_requested_total", 1u64, "kind" => "sync");
        self.emit(claims, &updated, REASON_OPERATION_STARTED, &what).await;
        info!(app = %key, took_ms = %t0.elapsed().as_millis(), "api: sync ok");
        Ok(updated)
    }

    pub async fn rollback(&self, claims: &Claims, req: RollbackRequest) -> AppResult<Application> {
        let t0 = Instant::now();
        let app = self.authz.resolve(claims, &req.app, Check::Action("sync")).await?;
        let key = app.key();
        let _guard = self.locks.lock(&key).await;
        let mut app = self.store.get(&key).await?;
        ensure_idle(&app)?;
        if app.automated_sync() && !req.dry_run {
            return Err(AppError::FailedPrecondition("rollback cannot be initiated when auto-sync is enabled".into()));
        }
        let entry = app
            .status
            .history
            .iter()
            .find(|h| h.id == req.id)
            .cloned()
            .ok_or_else(|| AppError::InvalidArgument(format!("application {} does not have deployment with id {}", app.name(), req.id)))?;
        if entry.source.is_none() && entry.sources.is_empty() {
            return Err(AppError::FailedPrecondition(format!("cannot rollback to deployment {}: no source recorded", req.id)));
        }
        let mut sync = rollback_payload(&app, &entry, req.source_index)?;
        sync.prune = req.prune;
        sync.dry_run = req.dry_run;
        app.operation = Some(Operation {
            sync: Some(sync),
            initiated_by: InitiatedBy { username: claims.subject.clone().unwrap_or_default(), automated: false },
            info: Vec::new(),
        });
        // History was chosen against this exact version: no retry.
        let updated = self.store.update(app).await.map_err(|e| {
            if e.is_conflict() {
                counter!("operation_conflicts_total", 1u64, "op" => "rollback");
            }
            AppError::from(e)
        })?;
        counter!("operations_requested_total", 1u64, "kind" => "rollback");
        self.emit(claims, &updated, REASON_OPERATION_STARTED, &format!("initiated rollback to {}", req.id)).await;
        info!(app = %key, id = req.id, took_ms = %t0.elapsed().as_millis(), "api: rollback ok");
        Ok(updated)
    }

    pub async fn terminate_operation(&self, claims: &Claims, r: &AppRef) -> AppResult<Application> {
        let app = self.authz.resolve(claims, r, Check::Action("sync")).await?;
        let key = app.key();
        let _guard = self.locks.lock(&key).await;
        for attempt in 0..=self.cfg.conflict_retries {
            let mut app = self.store.get(&key).await?;
            match app.status.operation_state.as_mut() {
                Some(st) if st.phase == OperationPhase::Running => st.phase = OperationPhase::Terminating,
                _ => return Err(AppError::InvalidArgument("Unable to terminate operation. No operation is in progress".into())),
            }
            match self.store.update_status(app).await {
                Ok(updated) => {
                    counter!("operations_requested_total", 1u64, "kind" => "terminate");
                    self.emit(claims, &updated, REASON_OPERATION_STARTED, "terminated running operation").await;
                    info!(app = %key, attempt, "api: terminate ok");
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => {
                    counter!("operation_conflicts_total", 1u64, "op" => "terminate");
                    debug!(app = %key, attempt, "api: terminate conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::Conflict(format!("unable to terminate operation on {key} after {} attempts", self.cfg.conflict_retries + 1)))
    }

    pub async fn revision_metadata(&self, claims: &Claims, req: RevisionMetadataRequest) -> AppResult<RevisionMetadata> {
        let app = self.authz.resolve(claims, &req.app, Check::Action("get")).await?;
        let source = metadata_source(&app, req.source_index, req.version_id)?;
        let revision = if req.revision.is_empty() { source.target_revision.clone() } else { req.revision.clone() };
        self.repo
            .revision_metadata(&source.repo_url, &revision)
            .await
            .map_err(|e| AppError::Unavailable(format!("unable to read revision {revision:?} of {}: {e:#}", source.repo_url)))
    }
}

fn describe_sync(app: &Application, req: &SyncRequest, resolved: &ResolvedRevisions) -> String {
    if !req.manifests.is_empty() {
        return "initiated sync locally".into();
    }
    match &resolved.single {
        Some(r) => format!("initiated sync to {}", r.display),
        None if app.is_multi_source() => format!("initiated multi-source sync to [{}]", resolved.displays().join(", ")),
        None => "initiated sync".into(),
    }
}
