//! The polling loop around the executor.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{self, Aborted, Client, Cycle, Executor};
use crate::plan::DeviceCategory;

#[derive(thiserror::Error, Debug)]
pub enum Error<E> {
    #[error("polling stopped")]
    Aborted(#[source] Aborted),
    #[error("could not report the outcome of a poll cycle")]
    Report(#[source] E),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub completed: u64,
    pub aborted: u64,
}

/// Decides how many cycles to run, how to pace them, and what to do when one fails.
///
/// By default cycles run back to back, forever, and an aborted cycle is followed by the next
/// full cycle.
#[derive(Clone, Debug, Default)]
pub struct Driver {
    cycles: Option<u64>,
    interval: Duration,
    stop_on_error: bool,
    shutdown: CancellationToken,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(mut self, cycles: Option<u64>) -> Self {
        self.cycles = cycles;
        self
    }

    /// The minimum time between the starts of two consecutive cycles.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run cycles until the cycle count is reached or shutdown is requested.
    ///
    /// `report` sees every cycle, including aborted ones, as soon as it ends.
    pub async fn run<C: Client, E>(
        &self,
        executor: &Executor,
        category: DeviceCategory,
        client: &mut C,
        mut report: impl FnMut(&Result<Cycle, Aborted>) -> Result<(), E>,
    ) -> Result<Summary, Error<E>> {
        let mut summary = Summary::default();
        loop {
            if self.finished(&summary) {
                break;
            }
            let cycle_start = Instant::now();
            let result = executor.run_cycle(category, client).await;
            report(&result).map_err(Error::Report)?;
            match result {
                Ok(_) => summary.completed += 1,
                Err(Aborted { error: engine::Error::Interrupted { .. }, .. }) => break,
                Err(aborted @ Aborted { error: engine::Error::Plan(_), .. }) => {
                    return Err(Error::Aborted(aborted));
                }
                Err(aborted) if self.stop_on_error => return Err(Error::Aborted(aborted)),
                Err(aborted) => {
                    summary.aborted += 1;
                    warn!(
                        message = "poll cycle aborted, starting over",
                        completed = aborted.completed.len(),
                        error = (&aborted.error as &dyn std::error::Error)
                    );
                }
            }
            if !self.interval.is_zero() && !self.finished(&summary) {
                tokio::select! {
                    _ = tokio::time::sleep_until(cycle_start + self.interval) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }
        info!(message = "polling finished", completed = summary.completed, aborted = summary.aborted);
        Ok(summary)
    }

    fn finished(&self, summary: &Summary) -> bool {
        self.shutdown.is_cancelled()
            || self.cycles.is_some_and(|cycles| summary.completed + summary.aborted >= cycles)
    }
}
