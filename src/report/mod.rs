//! Diagnostics sinks for the sky fit.
//!
//! The fitter never logs through a global: it talks to whatever
//! [`Reporter`] the caller put into the context. The binary uses
//! [`LogReporter`] (forwarding to the `log` facade); tests use
//! [`MemoryReporter`] to assert on what was reported.

use serde::Serialize;

use crate::domain::FitSummary;
use crate::math::SolveMethod;

pub mod format;

pub use format::*;

/// Per-iteration diagnostics of the rejection loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationReport {
    pub iteration: u32,
    pub chi2: f64,
    pub ndf: i64,
    pub chi2pdf: f64,
    /// Pixels rejected during this iteration.
    pub nout: usize,
    pub method: SolveMethod,
}

pub trait Reporter {
    fn info(&mut self, message: &str);
    fn warn(&mut self, message: &str);
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self, _summary: &FitSummary) {}

    /// Queried at every iteration boundary; returning `true` aborts the fit.
    fn should_abort(&self, _iteration: u32) -> bool {
        false
    }
}

/// Forwards everything to the `log` facade.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn info(&mut self, message: &str) {
        log::info!("{message}");
    }

    fn warn(&mut self, message: &str) {
        log::warn!("{message}");
    }

    fn on_iteration(&mut self, r: &IterationReport) {
        log::info!(
            "iter #{} chi2={:.6} ndf={} chi2pdf={:.6} nout={} ({})",
            r.iteration,
            r.chi2,
            r.ndf,
            r.chi2pdf,
            r.nout,
            r.method.display_name()
        );
    }

    fn on_finish(&mut self, summary: &FitSummary) {
        log::info!("nout tot={}", summary.nrej);
    }
}

/// Records everything in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryReporter {
    pub infos: Vec<String>,
    pub warnings: Vec<String>,
    pub iterations: Vec<IterationReport>,
    pub summary: Option<FitSummary>,
    /// Abort once this many iterations have completed.
    pub abort_after: Option<u32>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reporter for MemoryReporter {
    fn info(&mut self, message: &str) {
        self.infos.push(message.to_string());
    }

    fn warn(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    fn on_iteration(&mut self, report: &IterationReport) {
        self.iterations.push(report.clone());
    }

    fn on_finish(&mut self, summary: &FitSummary) {
        self.summary = Some(summary.clone());
    }

    fn should_abort(&self, iteration: u32) -> bool {
        self.abort_after.is_some_and(|n| iteration >= n)
    }
}
