//! Weekly broadcast scheduler.
//!
//! A ticker calls [`ReviewScheduler::fire_if_due`] periodically. An
//! occurrence of the cron schedule fires at most once: the last fired
//! occurrence is kept in memory and in the state store, so a restart near
//! the trigger time does not broadcast twice. Occurrences older than the
//! grace window are skipped.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, ReviewError};
use crate::review::engine::{ReviewEngine, StartOutcome};
use crate::review::roster::EnrolledPerson;
use crate::store::StateStore;

const STATE_OWNER: &str = "scheduler";
const LAST_FIRED_KEY: &str = "last_fired_at";

/// What the broadcast starts reviews on.
#[async_trait]
pub trait BroadcastTarget: Send + Sync {
    /// Runs once before each broadcast. Failures stay inside.
    async fn prepare(&self) {}

    async fn enrolled(&self) -> Result<Vec<EnrolledPerson>, ReviewError>;
    async fn start_scheduled(&self, person: &EnrolledPerson) -> Result<StartOutcome, ReviewError>;
}

#[async_trait]
impl BroadcastTarget for ReviewEngine {
    /// Pick up question edits made since the last broadcast.
    async fn prepare(&self) {
        if !self.has_catalog_source() {
            return;
        }
        if let Err(e) = self.refresh_catalog().await {
            tracing::warn!(error = %e, "Catalog refresh failed, keeping the current questions");
        }
    }

    async fn enrolled(&self) -> Result<Vec<EnrolledPerson>, ReviewError> {
        self.gate().enrolled().await
    }

    async fn start_scheduled(&self, person: &EnrolledPerson) -> Result<StartOutcome, ReviewError> {
        ReviewEngine::start_scheduled(self, person).await
    }
}

/// Per-person tally of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub started: usize,
    pub already_active: usize,
    pub unreachable: usize,
    pub failed: usize,
}

impl BroadcastReport {
    fn record(&mut self, outcome: &Result<StartOutcome, ReviewError>) {
        match outcome {
            Ok(StartOutcome::Started) => self.started += 1,
            Ok(StartOutcome::AlreadyActive) => self.already_active += 1,
            Ok(StartOutcome::Unreachable) => self.unreachable += 1,
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Debug)]
pub enum FireOutcome {
    /// No occurrence inside the grace window.
    NotDue,
    /// The due occurrence was already broadcast.
    AlreadyFired,
    Fired(BroadcastReport),
    /// The roster could not be read; the occurrence stays due.
    Failed(ReviewError),
}

pub struct ReviewScheduler {
    schedule: cron::Schedule,
    utc_offset: FixedOffset,
    grace: TimeDelta,
    max_fanout: usize,
    target: Arc<dyn BroadcastTarget>,
    state: Option<Arc<dyn StateStore>>,
    last_fired: Mutex<Option<DateTime<Utc>>>,
}

impl ReviewScheduler {
    pub fn new(
        config: &SchedulerConfig,
        target: Arc<dyn BroadcastTarget>,
    ) -> Result<Self, ConfigError> {
        let schedule =
            cron::Schedule::from_str(&config.schedule).map_err(|e| ConfigError::InvalidValue {
                key: "REVIEW_SCHEDULE".into(),
                message: e.to_string(),
            })?;
        let grace = TimeDelta::from_std(config.grace).map_err(|e| ConfigError::InvalidValue {
            key: "REVIEW_SCHEDULE_GRACE_MINS".into(),
            message: e.to_string(),
        })?;

        Ok(Self {
            schedule,
            utc_offset: config.utc_offset,
            grace,
            max_fanout: config.max_fanout.max(1),
            target,
            state: None,
            last_fired: Mutex::new(None),
        })
    }

    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Load the last fired occurrence from the state store.
    pub async fn restore(&self) {
        let Some(state) = &self.state else {
            return;
        };
        match state.get_setting(STATE_OWNER, LAST_FIRED_KEY).await {
            Ok(Some(value)) => {
                let parsed = value
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                match parsed {
                    Some(at) => {
                        tracing::info!(last_fired_at = %at, "Scheduler state restored");
                        *self.last_fired.lock().await = Some(at);
                    }
                    None => tracing::warn!(?value, "Ignoring unparseable scheduler state"),
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read scheduler state"),
        }
    }

    pub async fn last_fired(&self) -> Option<DateTime<Utc>> {
        *self.last_fired.lock().await
    }

    /// Most recent occurrence in `(now - grace, now]`.
    pub fn due_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window_start = (now - self.grace).with_timezone(&self.utc_offset);
        self.schedule
            .after(&window_start)
            .map(|o| o.with_timezone(&Utc))
            .take_while(|o| *o <= now)
            .last()
    }

    /// Next occurrence after `now`.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&now.with_timezone(&self.utc_offset))
            .next()
            .map(|o| o.with_timezone(&Utc))
    }

    /// Broadcast if an occurrence is due and has not fired yet.
    pub async fn fire_if_due(&self, now: DateTime<Utc>) -> FireOutcome {
        let Some(occurrence) = self.due_occurrence(now) else {
            return FireOutcome::NotDue;
        };

        let mut last_fired = self.last_fired.lock().await;
        if (*last_fired).is_some_and(|at| at >= occurrence) {
            return FireOutcome::AlreadyFired;
        }

        tracing::info!(occurrence = %occurrence, "Weekly review broadcast firing");
        let report = match self.broadcast().await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Broadcast aborted");
                return FireOutcome::Failed(e);
            }
        };

        *last_fired = Some(occurrence);
        self.persist_last_fired(occurrence).await;
        tracing::info!(
            started = report.started,
            already_active = report.already_active,
            unreachable = report.unreachable,
            failed = report.failed,
            "Weekly review broadcast finished"
        );
        FireOutcome::Fired(report)
    }

    /// Start a review for every enrolled person, at most `max_fanout` at a
    /// time. One person's failure never stops the others.
    pub async fn broadcast(&self) -> Result<BroadcastReport, ReviewError> {
        self.target.prepare().await;
        let persons = self.target.enrolled().await?;

        let outcomes: Vec<Result<StartOutcome, ReviewError>> = futures::stream::iter(persons)
            .map(|person| {
                let target = Arc::clone(&self.target);
                async move {
                    let outcome = target.start_scheduled(&person).await;
                    match &outcome {
                        Ok(StartOutcome::Unreachable) => {
                            tracing::info!(identity = %person.identity, "No chat known yet, skipping");
                        }
                        Err(e) => {
                            tracing::warn!(identity = %person.identity, error = %e, "Scheduled start failed");
                        }
                        Ok(_) => {}
                    }
                    outcome
                }
            })
            .buffer_unordered(self.max_fanout)
            .collect()
            .await;

        let mut report = BroadcastReport::default();
        for outcome in &outcomes {
            report.record(outcome);
        }
        Ok(report)
    }

    async fn persist_last_fired(&self, at: DateTime<Utc>) {
        let Some(state) = &self.state else {
            return;
        };
        let value = serde_json::Value::String(at.to_rfc3339());
        if let Err(e) = state.set_setting(STATE_OWNER, LAST_FIRED_KEY, &value).await {
            tracing::warn!(error = %e, "Failed to persist scheduler state");
        }
    }
}

/// Spawn the periodic ticker driving the scheduler.
pub fn spawn_scheduler_ticker(
    scheduler: Arc<ReviewScheduler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        scheduler.restore().await;
        if let Some(next) = scheduler.next_occurrence(Utc::now()) {
            tracing::info!(next = %next, "Review scheduler started");
        }

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match scheduler.fire_if_due(Utc::now()).await {
                FireOutcome::NotDue | FireOutcome::AlreadyFired => {}
                FireOutcome::Fired(_) | FireOutcome::Failed(_) => {
                    if let Some(next) = scheduler.next_occurrence(Utc::now()) {
                        tracing::info!(next = %next, "Next review broadcast");
                    }
                }
            }
        }
    })
}
