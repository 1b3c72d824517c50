//! Periodic trigger for the actuator controller.
//!
//! The timer lives in a spawned task owned through a replaceable handle.
//! Replacing or clearing the handle cancels the timer but never aborts a run
//! that is already in flight; a shared gate keeps runs from overlapping even
//! across a restart with a new interval.

use crate::config::ActuatorConfig;
use crate::logger::Logger;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Work triggered on every tick.
pub trait Job: Send + Sync {
    fn run(&self) -> BoxFuture<'_, ()>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("interval must be at least 1 second, got {0}")]
    InvalidInterval(u64),
}

struct Ticker {
    interval_seconds: u64,
    // Dropping the sender stops the timer loop after the current run, or
    // before the next one if it is still waiting on the gate.
    _cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    job: Arc<dyn Job>,
    gate: Arc<AsyncMutex<()>>,
    active: Mutex<Option<Ticker>>,
    log: Logger,
}

impl Scheduler {
    pub fn new(job: Arc<dyn Job>, log: &Logger) -> Self {
        Scheduler {
            job,
            gate: Arc::new(AsyncMutex::new(())),
            active: Mutex::new(None),
            log: log.for_target("ruuvi_station::scheduler"),
        }
    }

    /// Run the job now and then every `interval_seconds`, replacing any
    /// running timer.
    pub fn start(&self, interval_seconds: u64) -> Result<(), ScheduleError> {
        if interval_seconds < 1 {
            return Err(ScheduleError::InvalidInterval(interval_seconds));
        }

        let (cancel, stop) = oneshot::channel();
        let task = tokio::spawn(tick_loop(
            self.job.clone(),
            self.gate.clone(),
            Duration::from_secs(interval_seconds),
            stop,
        ));
        let ticker = Ticker {
            interval_seconds,
            _cancel: cancel,
            task,
        };

        // The previous ticker (if any) is dropped here, which cancels it.
        if let Ok(mut active) = self.active.lock() {
            active.replace(ticker);
        }
        self.log
            .info(format_args!("running every {interval_seconds}s"));
        Ok(())
    }

    /// Restart with a new interval; no-op when it equals the current one.
    ///
    /// Returns whether the timer was restarted.
    pub fn update_interval(&self, interval_seconds: u64) -> Result<bool, ScheduleError> {
        if self.interval() == Some(interval_seconds) {
            return Ok(false);
        }
        self.start(interval_seconds)?;
        Ok(true)
    }

    /// Cancel the pending timer. Safe to call repeatedly.
    pub fn clear(&self) {
        let previous = self.active.lock().ok().and_then(|mut active| active.take());
        if previous.is_some() {
            self.log.info(format_args!("timer cleared"));
        }
    }

    /// Cancel the timer and wait for an in-flight run to finish.
    pub async fn shutdown(&self) {
        let previous = self.active.lock().ok().and_then(|mut active| active.take());
        if let Some(Ticker { _cancel, task, .. }) = previous {
            drop(_cancel);
            if let Err(e) = task.await {
                self.log.warn(format_args!("timer task ended abnormally: {e}"));
            }
            self.log.info(format_args!("timer stopped"));
        }
    }

    /// Interval of the active timer, `None` when cleared.
    pub fn interval(&self) -> Option<u64> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|t| t.interval_seconds))
    }

    /// Apply interval changes from the live configuration until it goes away.
    pub async fn follow(&self, mut changes: watch::Receiver<ActuatorConfig>) {
        while changes.changed().await.is_ok() {
            let interval_seconds = changes.borrow_and_update().interval_seconds;
            match self.update_interval(interval_seconds) {
                Ok(true) => self
                    .log
                    .info(format_args!("interval changed to {interval_seconds}s")),
                Ok(false) => {}
                Err(error) => self.log.warn(format_args!("{error}")),
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.clear();
    }
}

async fn tick_loop(
    job: Arc<dyn Job>,
    gate: Arc<AsyncMutex<()>>,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        // The first tick completes immediately.
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }
        // A timer cancelled while another run holds the gate never runs.
        let _running = tokio::select! {
            biased;
            _ = &mut stop => break,
            running = gate.lock() => running,
        };
        job.run().await;
    }
}
