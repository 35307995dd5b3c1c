//! Submission scheduler: decides when queued operations are applied.
//!
//! [`SimpleSubmissionScheduler`] submits on demand. Reactive handlers queue
//! follow-up operations into the next buffer while a submission replays; with
//! `max_passes > 1` the scheduler keeps submitting until nothing is queued or
//! the pass budget is spent.
//!
//! ```
//! use grove_ecs::prelude::*;
//!
//! #[derive(Default)]
//! struct Hp(u32);
//! impl Component for Hp {}
//!
//! let mut db = EntitiesDb::new();
//! let desc = db.descriptor().with::<Hp>().build().unwrap();
//! let group = db.allocate_group().unwrap();
//!
//! let mut scheduler = SimpleSubmissionScheduler::new(SchedulerConfig::default());
//! db.build_entity(Egid::new(0, group), &desc).unwrap();
//!
//! scheduler.pause();
//! assert!(scheduler.submit_entities(&mut db).unwrap().is_empty());
//! scheduler.resume();
//! assert_eq!(scheduler.submit_entities(&mut db).unwrap().entities_added, 1);
//! ```

use std::time::{Duration, Instant};

use tracing::debug;

use crate::db::EntitiesDb;
use crate::operations::SubmissionReport;
use crate::EcsError;

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Submissions run per call while operations stay queued. At least one
    /// pass always runs.
    pub max_passes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_passes: 1 }
    }
}

// ---------------------------------------------------------------------------
// SchedulerDiagnostics
// ---------------------------------------------------------------------------

/// Figures about the last [`SimpleSubmissionScheduler::submit_entities`] call.
#[derive(Debug, Clone, Default)]
pub struct SchedulerDiagnostics {
    /// Submissions actually run.
    pub passes: u32,
    /// Wall-clock time of the whole call.
    pub total_time: Duration,
    /// Whether operations were still queued when the pass budget ran out.
    pub left_queued: bool,
}

// ---------------------------------------------------------------------------
// SimpleSubmissionScheduler
// ---------------------------------------------------------------------------

/// Submits on request unless paused.
#[derive(Debug, Default)]
pub struct SimpleSubmissionScheduler {
    config: SchedulerConfig,
    paused: bool,
    submissions: u64,
    diagnostics: SchedulerDiagnostics,
}

impl SimpleSubmissionScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Stop applying operations; they stay queued.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Total submissions run by this scheduler.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    pub fn diagnostics(&self) -> &SchedulerDiagnostics {
        &self.diagnostics
    }

    /// Submit `db`'s queued operations, re-submitting what reactive handlers
    /// queue up to `max_passes` times. Returns the merged report.
    ///
    /// Does nothing while paused. The first failing pass ends the call.
    pub fn submit_entities(&mut self, db: &mut EntitiesDb) -> Result<SubmissionReport, EcsError> {
        let mut total = SubmissionReport::default();
        if self.paused {
            return Ok(total);
        }

        let start = Instant::now();
        let max_passes = self.config.max_passes.max(1);
        let mut passes = 0;
        while passes < max_passes && db.has_queued_operations() {
            passes += 1;
            self.submissions += 1;
            total.merge(&db.submit_entities()?);
        }

        self.diagnostics = SchedulerDiagnostics {
            passes,
            total_time: start.elapsed(),
            left_queued: db.has_queued_operations(),
        };
        if self.diagnostics.left_queued {
            debug!(passes, "operations left queued for the next submission");
        }
        Ok(total)
    }
}
