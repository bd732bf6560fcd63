//! The face pipeline worker.
//!
//! A run goes through cleanup, reference repair, subject backfill, cluster
//! optimization, matching, clustering and a second matching pass. Only one
//! run may be active per [`RunContext`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::config::{FacesConfig, Tuning};
use crate::error::{FacesError, Partial, Result};
use crate::matching::MatchResult;
use crate::store::FaceStore;

/// Shared state of the face worker: the run lock, the cancel flag and the
/// time of the last matching pass.
#[derive(Debug)]
pub struct RunContext {
    running: Mutex<()>,
    canceled: AtomicBool,
    last_match: Mutex<DateTime<Utc>>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            running: Mutex::new(()),
            canceled: AtomicBool::new(false),
            last_match: Mutex::new(DateTime::<Utc>::default()),
        }
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the run lock without waiting. `None` if a run is active.
    pub fn try_start(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self.running.try_lock()?;
        self.canceled.store(false, Ordering::SeqCst);
        Some(guard)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_locked()
    }

    /// Asks the active run to stop at the next check.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn last_match(&self) -> DateTime<Utc> {
        *self.last_match.lock()
    }

    pub(crate) fn set_last_match(&self, at: DateTime<Utc>) {
        *self.last_match.lock() = at;
    }
}

/// Options for a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FacesOptions {
    /// Rematch every marker and cluster regardless of new data.
    pub force: bool,
    /// New samples needed to trigger clustering; 0 uses the configured
    /// default.
    pub threshold: usize,
}

impl FacesOptions {
    pub fn sample_threshold(&self, tuning: &Tuning) -> usize {
        if self.threshold > 0 {
            self.threshold
        } else {
            tuning.sample_threshold
        }
    }
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub removed_markers: usize,
    pub removed_faces: usize,
    pub removed_subjects: usize,
    pub fixed_references: usize,
    pub created_subjects: usize,
    pub merged_faces: usize,
    pub new_faces: usize,
    pub updated_markers: usize,
    pub recognized: usize,
    pub unknown: usize,
}

impl RunReport {
    fn add_matches(&mut self, r: MatchResult) {
        self.updated_markers += r.updated;
        self.recognized += r.recognized;
        self.unknown += r.unknown;
    }
}

/// Face clustering and matching worker.
#[derive(Debug, Clone)]
pub struct Faces {
    pub(crate) store: Arc<FaceStore>,
    pub(crate) config: FacesConfig,
    pub(crate) ctx: Arc<RunContext>,
}

impl Faces {
    pub fn new(store: Arc<FaceStore>, config: FacesConfig) -> Self {
        Self::with_context(store, config, Arc::new(RunContext::new()))
    }

    /// Builds a worker sharing `ctx` with other workers, so they exclude
    /// each other and see the same cancel flag.
    pub fn with_context(store: Arc<FaceStore>, config: FacesConfig, ctx: Arc<RunContext>) -> Self {
        Self { store, config, ctx }
    }

    pub fn store(&self) -> &Arc<FaceStore> {
        &self.store
    }

    pub fn config(&self) -> &FacesConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    pub(crate) fn tuning(&self) -> &Tuning {
        &self.config.tuning
    }

    pub fn disabled(&self) -> bool {
        self.config.disabled
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub fn canceled(&self) -> bool {
        self.ctx.canceled()
    }

    pub(crate) fn check_canceled(&self) -> Result<()> {
        if self.canceled() {
            return Err(FacesError::Canceled);
        }
        Ok(())
    }

    /// Runs the whole pipeline.
    ///
    /// Fails fast with `Busy` if another run holds the context. On failure
    /// the counters gathered so far are returned with the error. A panic
    /// inside a stage is caught and reported as `FacesError::Panic`.
    pub fn start(&self, opts: FacesOptions) -> std::result::Result<RunReport, Partial<RunReport>> {
        if self.disabled() {
            return Err(Partial::new(FacesError::Disabled, RunReport::default()));
        }
        let Some(_running) = self.ctx.try_start() else {
            return Err(Partial::new(FacesError::Busy, RunReport::default()));
        };

        let mut report = RunReport::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_stages(opts, &mut report)));

        match outcome {
            Ok(Ok(())) => Ok(report),
            Ok(Err(e)) => {
                if e.is_canceled() {
                    tracing::info!("faces: run canceled");
                } else {
                    tracing::error!("faces: {}", e);
                }
                Err(Partial::new(e, report))
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("faces: {} (panic)", msg);
                Err(Partial::new(FacesError::Panic(msg), report))
            }
        }
    }

    fn run_stages(&self, opts: FacesOptions, report: &mut RunReport) -> Result<()> {
        self.check_canceled()?;
        self.cleanup(report);

        self.check_canceled()?;
        let start = Instant::now();
        match self.store.fix_marker_references() {
            Err(e) => tracing::error!("markers: {} (fix references)", e),
            Ok(0) => tracing::debug!("markers: found no invalid references [{:?}]", start.elapsed()),
            Ok(n) => {
                report.fixed_references = n;
                tracing::info!("markers: fixed {} references [{:?}]", n, start.elapsed());
            }
        }

        self.check_canceled()?;
        let start = Instant::now();
        match self.store.create_marker_subjects() {
            Err(e) => tracing::error!("markers: {} (create subjects)", e),
            Ok(0) => tracing::debug!("markers: found no missing subjects [{:?}]", start.elapsed()),
            Ok(n) => {
                report.created_subjects = n;
                tracing::info!("markers: added {} known subjects [{:?}]", n, start.elapsed());
            }
        }

        self.check_canceled()?;
        let start = Instant::now();
        let merged = self.optimize()?.merged;
        report.merged_faces = merged;
        if merged > 0 {
            tracing::info!("faces: merged {} clusters [{:?}]", merged, start.elapsed());
        } else {
            tracing::debug!("faces: found no clusters to be merged [{:?}]", start.elapsed());
        }

        self.check_canceled()?;
        self.run_match(opts, report)?;

        self.check_canceled()?;
        let start = Instant::now();
        let added = self.cluster(opts)?;
        report.new_faces = added.len();
        if added.is_empty() {
            tracing::debug!("faces: found no new faces [{:?}]", start.elapsed());
        } else {
            tracing::info!("faces: added {} new faces [{:?}]", added.len(), start.elapsed());
        }

        self.check_canceled()?;
        self.run_match(opts, report)
    }

    /// Removes orphan markers, then faces, then subjects, so a subject
    /// only a removed face referred to goes in the same pass. Failures are
    /// logged.
    fn cleanup(&self, report: &mut RunReport) {
        let start = Instant::now();
        match self.store.remove_orphan_markers() {
            Err(e) => tracing::error!("faces: {} (remove orphan markers)", e),
            Ok(0) => tracing::debug!("faces: found no orphan markers [{:?}]", start.elapsed()),
            Ok(n) => {
                report.removed_markers = n;
                tracing::info!("faces: removed {} orphan markers [{:?}]", n, start.elapsed());
            }
        }

        let start = Instant::now();
        match self.store.delete_orphan_faces() {
            Err(e) => tracing::error!("faces: {} (remove clusters)", e),
            Ok(n) => {
                report.removed_faces = n;
                if n > 0 {
                    tracing::debug!("faces: removed {} clusters [{:?}]", n, start.elapsed());
                }
            }
        }

        let start = Instant::now();
        match self.store.delete_orphan_people() {
            Err(e) => tracing::error!("faces: {} (remove people)", e),
            Ok(n) => {
                report.removed_subjects = n;
                if n > 0 {
                    tracing::debug!("faces: removed {} people [{:?}]", n, start.elapsed());
                }
            }
        }
    }

    fn run_match(&self, opts: FacesOptions, report: &mut RunReport) -> Result<()> {
        let start = Instant::now();
        let (result, err) = match self.match_markers(opts) {
            Ok(r) => (r, None),
            Err(p) => (p.done, Some(p.error)),
        };
        report.add_matches(result);

        if result.updated > 0 {
            tracing::info!(
                "faces: updated {} markers, recognized {} faces, {} unknown [{:?}]",
                result.updated,
                result.recognized,
                result.unknown,
                start.elapsed()
            );
        } else {
            tracing::debug!(
                "faces: updated {} markers, recognized {} faces, {} unknown [{:?}]",
                result.updated,
                result.recognized,
                result.unknown,
                start.elapsed()
            );
        }

        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_excludes_second_run() {
        let ctx = RunContext::new();
        let first = ctx.try_start().unwrap();
        assert!(ctx.is_running());
        assert!(ctx.try_start().is_none());
        drop(first);
        assert!(ctx.try_start().is_some());
    }

    #[test]
    fn start_resets_cancel_flag() {
        let ctx = RunContext::new();
        ctx.cancel();
        assert!(ctx.canceled());
        let _guard = ctx.try_start().unwrap();
        assert!(!ctx.canceled());
    }

    #[test]
    fn sample_threshold_falls_back_to_tuning() {
        let tuning = Tuning::default();
        assert_eq!(FacesOptions::default().sample_threshold(&tuning), 8);
        let opts = FacesOptions {
            threshold: 3,
            ..FacesOptions::default()
        };
        assert_eq!(opts.sample_threshold(&tuning), 3);
    }
}
