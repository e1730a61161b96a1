//! Background training scheduler
//!
//! Three trainers share the engine's admission control:
//! - periodic: one standard step per interval
//! - micro: one small-batch step per fast tick
//! - daily: inside a local-time window, once per day, re-ingests logged
//!   experiences and runs a bounded number of batches
//!
//! Each trainer is a task with its own shutdown signal. Stopping waits for
//! the task, so a pass that already started always finishes.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use ethos_core::DailyConfig;

use crate::engine::{DecisionEngine, TrainOutcome};

/// Trainer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerKind {
    /// Fixed-interval trainer
    Periodic,
    /// Daily batch trainer
    Daily,
    /// Small-batch fast trainer
    Micro,
}

impl TrainerKind {
    /// Every trainer
    pub const ALL: [TrainerKind; 3] = [TrainerKind::Periodic, TrainerKind::Daily, TrainerKind::Micro];

    /// Lower-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrainerKind::Periodic => "periodic",
            TrainerKind::Daily => "daily",
            TrainerKind::Micro => "micro",
        }
    }

    fn interval(self, engine: &DecisionEngine) -> Duration {
        let config = engine.config();
        let millis = match self {
            TrainerKind::Periodic => config.training.periodic_interval_ms,
            TrainerKind::Micro => config.training.micro_interval_ms,
            TrainerKind::Daily => config.daily.check_interval_secs.saturating_mul(1000),
        };
        Duration::from_millis(millis.max(1))
    }
}

impl fmt::Display for TrainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `time` falls inside the daily window; windows may cross midnight
#[must_use]
pub fn in_daily_window(time: NaiveTime, daily: &DailyConfig) -> bool {
    const DAY: u32 = 24 * 60;
    let minute = time.hour() * 60 + time.minute();
    let start = daily.hour * 60;
    let end = start + daily.window_minutes.min(DAY);
    if end <= DAY {
        (start..end).contains(&minute)
    } else {
        minute >= start || minute < end - DAY
    }
}

/// Date the window containing `now` opened on. A window that crosses
/// midnight keeps the start date after midnight.
#[must_use]
pub fn daily_window_date(now: NaiveDateTime, daily: &DailyConfig) -> NaiveDate {
    let minute = now.hour() * 60 + now.minute();
    let date = now.date();
    if minute < daily.hour * 60 {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}

/// Re-ingest logged experiences, then train up to `max_batches_per_run`
/// batches spread over `passes`. Returns the number of batches trained.
pub async fn run_daily_batch(engine: &DecisionEngine) -> usize {
    let daily = engine.config().daily.clone();
    match engine.ingest_logged_experiences().await {
        Ok(count) => tracing::debug!(count, "daily trainer re-ingested experiences"),
        Err(error) => tracing::warn!(%error, "daily re-ingestion failed"),
    }

    let passes = daily.passes.max(1);
    let per_pass = daily.max_batches_per_run.div_ceil(passes);
    let mut trained = 0;
    for _ in 0..passes {
        let remaining = daily.max_batches_per_run - trained;
        if remaining == 0 {
            break;
        }
        match engine.train_batches(per_pass.min(remaining)).await {
            Ok(0) => break,
            Ok(n) => trained += n,
            Err(error) => {
                tracing::warn!(%error, "daily training pass failed");
                break;
            }
        }
    }
    tracing::info!(trained, "daily training run finished");
    trained
}

struct RunningTrainer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Starts and stops the background trainers of one engine
pub struct TrainingScheduler {
    engine: DecisionEngine,
    running: Mutex<HashMap<TrainerKind, RunningTrainer>>,
}

impl fmt::Debug for TrainingScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainingScheduler").finish_non_exhaustive()
    }
}

impl TrainingScheduler {
    /// Scheduler for `engine`; nothing runs until started
    #[must_use]
    pub fn new(engine: DecisionEngine) -> Self {
        Self {
            engine,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Start one trainer; false if it is already running
    pub async fn start(&self, kind: TrainerKind) -> bool {
        let mut running = self.running.lock().await;
        if running.contains_key(&kind) {
            return false;
        }
        let (shutdown, signal) = watch::channel(false);
        let handle = tokio::spawn(run_trainer(self.engine.clone(), kind, signal));
        running.insert(kind, RunningTrainer { shutdown, handle });
        drop(running);

        tracing::info!(trainer = %kind, "trainer started");
        self.engine.log().training_started(kind.as_str()).await;
        true
    }

    /// Start the periodic and micro trainers, plus the daily one when enabled
    pub async fn start_configured(&self) -> Vec<TrainerKind> {
        let mut started = Vec::new();
        for kind in TrainerKind::ALL {
            if kind == TrainerKind::Daily && !self.engine.config().daily.enabled {
                continue;
            }
            if self.start(kind).await {
                started.push(kind);
            }
        }
        started
    }

    /// Stop one trainer and wait for it; false if it was not running
    pub async fn stop(&self, kind: TrainerKind) -> bool {
        let Some(trainer) = self.running.lock().await.remove(&kind) else {
            return false;
        };
        let _ = trainer.shutdown.send(true);
        if let Err(error) = trainer.handle.await {
            tracing::warn!(trainer = %kind, %error, "trainer task failed");
        }
        tracing::info!(trainer = %kind, "trainer stopped");
        self.engine.log().training_stopped(kind.as_str()).await;
        true
    }

    /// Whether `kind` is running
    pub async fn is_running(&self, kind: TrainerKind) -> bool {
        self.running.lock().await.contains_key(&kind)
    }

    /// Running trainers
    pub async fn running(&self) -> Vec<TrainerKind> {
        let running = self.running.lock().await;
        TrainerKind::ALL
            .into_iter()
            .filter(|k| running.contains_key(k))
            .collect()
    }

    /// Stop every trainer
    pub async fn shutdown(&self) {
        for kind in TrainerKind::ALL {
            self.stop(kind).await;
        }
    }
}

async fn run_trainer(engine: DecisionEngine, kind: TrainerKind, mut shutdown: watch::Receiver<bool>) {
    let interval = kind.interval(&engine);
    let mut last_daily_run: Option<NaiveDate> = None;
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => {
                run_pass(&engine, kind, &mut last_daily_run).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_pass(engine: &DecisionEngine, kind: TrainerKind, last_daily_run: &mut Option<NaiveDate>) {
    let outcome = match kind {
        TrainerKind::Periodic => engine.train_step().await,
        TrainerKind::Micro => {
            engine
                .train_step_with(engine.config().training.micro_batch_size)
                .await
        }
        TrainerKind::Daily => {
            let now = Local::now().naive_local();
            let daily = &engine.config().daily;
            let opened = daily_window_date(now, daily);
            if *last_daily_run != Some(opened) && in_daily_window(now.time(), daily) {
                *last_daily_run = Some(opened);
                run_daily_batch(engine).await;
            }
            return;
        }
    };
    match outcome {
        Ok(TrainOutcome::Trained { step, loss, .. }) => tracing::debug!(trainer = %kind, step, loss, "trained"),
        Ok(TrainOutcome::Skipped(reason)) => tracing::debug!(trainer = %kind, ?reason, "training skipped"),
        Err(error) => tracing::warn!(trainer = %kind, %error, "training step failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(hour: u32, minutes: u32) -> DailyConfig {
        DailyConfig {
            hour,
            window_minutes: minutes,
            ..DailyConfig::default()
        }
    }

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn window_inside_one_day() {
        let daily = window(3, 60);
        assert!(!in_daily_window(at(2, 59), &daily));
        assert!(in_daily_window(at(3, 0), &daily));
        assert!(in_daily_window(at(3, 59), &daily));
        assert!(!in_daily_window(at(4, 0), &daily));
    }

    #[test]
    fn window_crossing_midnight() {
        let daily = window(23, 90);
        assert!(in_daily_window(at(23, 30), &daily));
        assert!(in_daily_window(at(0, 29), &daily));
        assert!(!in_daily_window(at(0, 30), &daily));
        assert!(!in_daily_window(at(12, 0), &daily));
    }

    #[test]
    fn midnight_crossing_window_runs_once() {
        let daily = window(23, 90);
        let evening = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let before = evening.and_time(at(23, 10));
        let after = evening.succ_opt().unwrap().and_time(at(0, 5));
        assert!(in_daily_window(before.time(), &daily));
        assert!(in_daily_window(after.time(), &daily));
        assert_eq!(daily_window_date(before, &daily), evening);
        assert_eq!(daily_window_date(after, &daily), evening);

        let next_evening = evening.succ_opt().unwrap().and_time(at(23, 0));
        assert_eq!(daily_window_date(next_evening, &daily), next_evening.date());
    }

    #[test]
    fn trainer_names() {
        assert_eq!(TrainerKind::Micro.to_string(), "micro");
        assert_eq!(serde_json::to_string(&TrainerKind::Daily).unwrap(), "\"daily\"");
    }
}
