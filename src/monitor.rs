use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, JobApi};
use crate::db::Store;
use crate::models::Outcome;
use crate::notify::{Event, Notifier};
use crate::pipeline::Pipeline;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub tick_interval: Duration,
    pub per_page: u32,
    pub daily_cap: Option<u32>,
    pub concurrency: usize,
}

/// Top-level control loop. Each tick fans out bounded per-user tasks and
/// joins them before the next tick's bookkeeping; one user's failure never
/// touches another's processing.
#[derive(Clone)]
pub struct Monitor {
    store: Store,
    api: Arc<dyn JobApi>,
    pipeline: Arc<Pipeline>,
    notifier: Arc<dyn Notifier>,
    cfg: MonitorConfig,
}

impl Monitor {
    pub fn new(
        store: Store,
        api: Arc<dyn JobApi>,
        pipeline: Arc<Pipeline>,
        notifier: Arc<dyn Notifier>,
        cfg: MonitorConfig,
    ) -> Self {
        Self {
            store,
            api,
            pipeline,
            notifier,
            cfg,
        }
    }

    /// Run ticks on the configured cadence until the stop signal flips.
    /// An in-flight tick finishes the users it already started.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.cfg.tick_interval, "monitoring started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
            }
            if *stop.borrow() {
                break;
            }
            self.tick(&stop).await;
        }
        info!("monitoring stopped");
    }

    /// One pass over all enabled users.
    pub async fn tick(&self, stop: &watch::Receiver<bool>) {
        let users = match self.store.list_enabled_users() {
            Ok(users) => users,
            Err(err) => {
                error!(error = %err, "failed to enumerate users");
                return;
            }
        };
        debug!(users = users.len(), "tick started");

        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for chat_id in users {
            // Graceful stop: started users run to completion, no new ones.
            if *stop.borrow() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let monitor = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                monitor.check_user(chat_id).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "user task panicked");
            }
        }
    }

    /// Per-user failure domain: whatever happens inside, the error lands in
    /// this user's monitoring state and `last_check` still advances.
    async fn check_user(&self, chat_id: i64) {
        let error = match self.process_user(chat_id).await {
            Ok(()) => None,
            Err(err) => {
                warn!(chat_id, error = %err, "user check failed");
                Some(format!("{:#}", err))
            }
        };
        if let Err(err) = self.store.record_check(chat_id, error.as_deref()) {
            error!(chat_id, error = %err, "failed to record check result");
        }
    }

    async fn process_user(&self, chat_id: i64) -> Result<()> {
        let prefs = self.store.get_prefs(chat_id)?;
        let mut cap_announced = false;

        // One search per keyword; no keywords means one broad search.
        let searches: Vec<Option<&str>> = if prefs.filter.keywords.is_empty() {
            vec![None]
        } else {
            prefs.filter.keywords.iter().map(|k| Some(k.as_str())).collect()
        };

        for keyword in searches {
            let filter = match keyword {
                Some(kw) => prefs.filter.with_keyword(kw),
                None => prefs.filter.clone(),
            };
            let listings = self
                .api
                .search(&filter, self.cfg.per_page)
                .await
                .with_context(|| {
                    format!("search for '{}'", keyword.unwrap_or("<all>"))
                })?;

            for listing in listings {
                // The dedup claim comes first: once a listing is surfaced in
                // any way it must never show up again, even if we crash
                // between notifying and finishing the pipeline.
                if !self.store.mark_seen(chat_id, &listing.id)? {
                    continue;
                }

                let auto = prefs.auto_apply && !self.cap_is_reached(chat_id, &mut cap_announced).await?;

                if !auto {
                    let app = self.pipeline.process(&prefs, &listing, false).await?;
                    debug_assert_eq!(app.outcome, Outcome::Pending);
                    self.notify(Event::ManualReview { chat_id, listing }).await;
                    continue;
                }

                self.notify(Event::NewListing {
                    chat_id,
                    listing: listing.clone(),
                })
                .await;

                // Full text is needed for the cover letter. A listing that
                // vanished between search and detail fetch is just skipped;
                // it stays marked as seen.
                let details = match self.api.vacancy_details(&listing.id).await {
                    Ok(details) => details,
                    Err(ApiError::NotFound(_)) => {
                        debug!(chat_id, vacancy = %listing.id, "listing vanished upstream");
                        continue;
                    }
                    Err(err) => return Err(err).context("fetch details"),
                };

                let app = self.pipeline.process(&prefs, &details, true).await?;
                self.notify(Event::ApplicationResult {
                    chat_id,
                    title: app.vacancy_title.clone(),
                    success: app.outcome == Outcome::Success,
                    detail: app.error_message.clone(),
                })
                .await;
            }
        }
        Ok(())
    }

    /// Daily cap gate. The period is the current UTC calendar day; when the
    /// cap is hit the user is told once per tick why listings are routed to
    /// manual review.
    async fn cap_is_reached(&self, chat_id: i64, announced: &mut bool) -> Result<bool> {
        let Some(cap) = self.cfg.daily_cap else {
            return Ok(false);
        };
        let midnight = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let used = self.store.successes_since(chat_id, midnight)?;
        if used < cap as i64 {
            return Ok(false);
        }
        if !*announced {
            self.notify(Event::CapReached { chat_id, cap }).await;
            *announced = true;
        }
        Ok(true)
    }

    /// Notification delivery is best effort; a dead sink must not stop the
    /// pipeline from recording outcomes.
    async fn notify(&self, event: Event) {
        if let Err(err) = self.notifier.notify(event).await {
            warn!(error = %err, "notification delivery failed");
        }
    }
}
