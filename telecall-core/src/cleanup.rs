//! Fault-tolerant resource release
//!
//! Cleanup is a fixed sequence of independent steps. A step that fails or
//! panics is logged and recorded, and the next step still runs.

use futures::FutureExt;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};

/// Guard that lets a cleanup sequence run at most once
#[derive(Debug, Default)]
pub struct CleanupLatch {
    fired: AtomicBool,
}

impl CleanupLatch {
    /// Create an unfired latch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the cleanup; only the first caller gets `true`
    pub fn try_begin(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether cleanup was claimed
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Outcome of one cleanup step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Step name
    pub name: &'static str,
    /// Failure description, if the step failed or panicked
    pub error: Option<String>,
}

/// Outcomes of a whole cleanup sequence, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Executed steps
    pub steps: Vec<StepOutcome>,
}

impl CleanupReport {
    /// Steps that failed
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.error.is_some())
    }

    /// Whether every step succeeded
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Runs cleanup steps, never short-circuiting
#[derive(Debug, Default)]
pub struct CleanupRunner {
    report: CleanupReport,
}

impl CleanupRunner {
    /// Start an empty sequence
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run an async step
    pub async fn step<F, E>(&mut self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>>,
        E: Display,
    {
        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        self.record(name, outcome.map(|r| r.map_err(|e| e.to_string())));
    }

    /// Run a synchronous step
    pub fn step_sync<F, E>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce() -> Result<(), E>,
        E: Display,
    {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(f));
        self.record(name, outcome.map(|r| r.map_err(|e| e.to_string())));
    }

    fn record(
        &mut self,
        name: &'static str,
        outcome: Result<Result<(), String>, Box<dyn std::any::Any + Send>>,
    ) {
        let error = match outcome {
            Ok(Ok(())) => {
                tracing::debug!(step = name, "Cleanup step completed");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(step = name, error = %e, "Cleanup step failed, continuing");
                Some(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(step = name, panic = %message, "Cleanup step panicked, continuing");
                Some(format!("panicked: {message}"))
            }
        };
        self.report.steps.push(StepOutcome { name, error });
    }

    /// Finish the sequence
    #[must_use]
    pub fn finish(self) -> CleanupReport {
        self.report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    async fn explode() -> Result<(), String> {
        panic!("closed twice")
    }

    #[test]
    fn test_latch_fires_once() {
        let latch = CleanupLatch::new();
        assert!(!latch.is_fired());
        assert!(latch.try_begin());
        assert!(!latch.try_begin());
        assert!(latch.is_fired());
    }

    #[tokio::test]
    async fn test_latch_concurrent_claim() {
        let latch = Arc::new(CleanupLatch::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let latch = latch.clone();
            let wins = wins.clone();
            tasks.push(tokio::spawn(async move {
                if latch.try_begin() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_steps_do_not_block_later_steps() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut runner = CleanupRunner::new();

        runner
            .step("first", async { Err::<(), _>("device busy") })
            .await;
        runner.step("second", explode()).await;
        let counter = ran.clone();
        runner.step_sync("third", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        });

        let report = runner.finish();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(report.steps.len(), 3);
        assert!(!report.is_clean());
        let failed: Vec<_> = report.failures().map(|s| s.name).collect();
        assert_eq!(failed, vec!["first", "second"]);
        assert_eq!(
            report.steps[1].error.as_deref(),
            Some("panicked: closed twice")
        );
    }
}
