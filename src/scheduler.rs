//! Background scheduler.
//!
//! Two tickers run from startup to shutdown:
//! - fast tick (default 30 s): fire due schedules, then sweep calls nobody
//!   answered;
//! - slow tick (2 min): escalate stale unacknowledged alerts.
//!
//! Any single tick is bounded by a 10-minute deadline; store failures log
//! and skip the tick rather than killing the loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Local, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::notify::NotificationDispatcher;
use crate::session::SessionRegistry;
use crate::store::alerts::NewAlert;
use crate::store::Store;
use crate::types::{AlertKind, AlertSeverity, ScheduleStatus, TimelineEntry};

/// Invite-to-accept round trip plus a human reaction window. A policy knob,
/// not a correctness knob.
const ANSWER_WINDOW_SECS: i64 = 45;
const FIRE_BATCH_LIMIT: i64 = 10;
const TICK_DEADLINE: StdDuration = StdDuration::from_secs(600);

pub struct Scheduler {
    store: Arc<Store>,
    notifier: Arc<NotificationDispatcher>,
    registry: Arc<SessionRegistry>,
    cfg: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        notifier: Arc<NotificationDispatcher>,
        registry: Arc<SessionRegistry>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            registry,
            cfg,
        }
    }

    /// Spawn the two ticker loops for the lifetime of the process.
    pub fn spawn(self: Arc<Self>) {
        let cfg_max_retries = self.cfg.max_retries;
        let fast = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(fast.cfg.fast_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                if tokio::time::timeout(TICK_DEADLINE, fast.fast_tick())
                    .await
                    .is_err()
                {
                    error!("Fast scheduler tick exceeded its deadline, aborted");
                }
            }
        });

        let slow = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(slow.cfg.slow_tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tokio::time::timeout(TICK_DEADLINE, slow.slow_tick())
                    .await
                    .is_err()
                {
                    error!("Escalation tick exceeded its deadline, aborted");
                }
            }
        });

        info!(
            max_retries = cfg_max_retries,
            "Scheduler started (fast tick for calls, 2m tick for escalation)"
        );
    }

    async fn fast_tick(&self) {
        if let Err(e) = self.fire_due().await {
            error!("fire_due failed: {}", e);
        }
        if let Err(e) = self.sweep_missed().await {
            error!("sweep_missed failed: {}", e);
        }
    }

    async fn slow_tick(&self) {
        if let Err(e) = self.escalate_stale().await {
            error!("escalate_stale failed: {}", e);
        }
    }

    /// Dispatch call invites for pending schedules whose time has come.
    pub async fn fire_due(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let due = self.store.due_pending_schedules(now, FIRE_BATCH_LIMIT).await?;
        let push = self.notifier.push_sender();

        for call in due {
            let Some(token) = call.device_token.as_deref().filter(|t| !t.is_empty()) else {
                warn!(subject = %call.subject_name, "No device token, schedule fails");
                self.store
                    .transition_schedule(call.schedule_id, ScheduleStatus::FailedNoToken, false)
                    .await?;
                continue;
            };

            let token_ok = call.device_token_valid && push.validate_token(token).await;
            if !token_ok {
                warn!(subject = %call.subject_name, "Device token invalid, schedule fails");
                self.store
                    .transition_schedule(call.schedule_id, ScheduleStatus::FailedInvalidToken, false)
                    .await?;
                self.store.mark_subject_token_invalid(call.subject_id).await?;
                continue;
            }

            // The device correlates the push with its session by this id.
            let session_id = format!("call-{}-{}", call.schedule_id, now.timestamp());
            match push
                .send_call_invite(token, &session_id, &call.subject_name)
                .await
            {
                Ok(_) => {
                    info!(subject = %call.subject_name, session_id, "Call invite dispatched");
                    self.store
                        .transition_schedule(call.schedule_id, ScheduleStatus::InProgress, true)
                        .await?;
                }
                Err(e) => {
                    warn!(subject = %call.subject_name, "Call invite failed: {}", e);
                    self.store
                        .transition_schedule(call.schedule_id, ScheduleStatus::FailedSend, false)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Detect invites that rang past the answer window with no session.
    pub async fn sweep_missed(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(ANSWER_WINDOW_SECS);
        let stalled = self.store.stalled_in_progress(cutoff).await?;

        for missed in stalled {
            // A live relay session means the call was answered; the
            // post-call hook will complete the schedule.
            if self.registry.is_active(missed.subject_id).await {
                continue;
            }
            // Another tick may have raced us here.
            if !self.store.mark_schedule_unanswered(missed.schedule_id).await? {
                continue;
            }
            warn!(
                subject = %missed.subject_name,
                schedule_id = missed.schedule_id,
                "Missed call detected"
            );

            let record_id = self
                .store
                .insert_missed_call_record(
                    missed.subject_id,
                    missed.schedule_id,
                    now - Duration::seconds(ANSWER_WINDOW_SECS),
                    now,
                    "no answer within 45 seconds",
                    &format!(
                        "Push notification sent but the device never responded. Subject: {}",
                        missed.subject_name
                    ),
                )
                .await?;

            let alert_id = self
                .store
                .insert_alert(&NewAlert {
                    subject_id: missed.subject_id,
                    call_record_id: Some(record_id),
                    kind: AlertKind::MissedCall,
                    severity: AlertSeverity::Medium,
                    message: &format!(
                        "{} não atendeu a chamada programada da EVA às {}",
                        missed.subject_name,
                        Local::now().format("%H:%M")
                    ),
                    recipients: &["cuidador".to_string()],
                })
                .await?;

            self.store
                .insert_timeline_entry(&TimelineEntry {
                    subject_id: missed.subject_id,
                    kind: "call".into(),
                    subkind: "missed".into(),
                    title: "Chamada Não Atendida".into(),
                    description: format!(
                        "EVA tentou contato com {} mas a chamada não foi atendida.",
                        missed.subject_name
                    ),
                    occurred_at: now,
                })
                .await?;

            let caregiver = self.store.primary_caregiver(missed.subject_id).await?;
            let token = caregiver
                .as_ref()
                .and_then(|c| c.device_token.as_deref())
                .filter(|t| !t.is_empty());
            match token {
                Some(token) => {
                    match self
                        .notifier
                        .push_sender()
                        .send_missed_call_alert(token, &missed.subject_name)
                        .await
                    {
                        Ok(()) => {
                            self.store.mark_alert_sent(alert_id).await?;
                            info!(subject = %missed.subject_name, "Primary caregiver notified of missed call");
                        }
                        Err(e) => {
                            warn!(subject = %missed.subject_name, "Missed-call push failed: {}", e);
                            self.store
                                .flag_alert_for_escalation(
                                    alert_id,
                                    now + self.escalation_delay(),
                                    false,
                                )
                                .await?;
                        }
                    }
                }
                None => {
                    warn!(subject = %missed.subject_name, "No caregiver token for missed-call alert");
                    self.store
                        .flag_alert_for_escalation(alert_id, now + self.escalation_delay(), false)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Walk the fallback chain for unacknowledged critical/high alerts whose
    /// escalation time has come.
    pub async fn escalate_stale(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let stale = self.store.stale_unacknowledged_alerts(now).await?;
        if stale.is_empty() {
            return Ok(());
        }
        info!(count = stale.len(), "Escalating unacknowledged alerts");

        for alert in stale {
            let Some(caregiver) = self.store.primary_caregiver(alert.subject_id).await? else {
                warn!(alert_id = alert.alert_id, "No caregiver to escalate to");
                continue;
            };

            if let Err(e) = self.notifier.escalate(&alert, &caregiver).await {
                warn!(alert_id = alert.alert_id, "Escalation attempt failed: {}", e);
            }
            // The attempt counts either way; the next revisit is pushed out
            // so a broken tier is not hammered every tick.
            self.store
                .record_escalation_attempt(alert.alert_id, now + self.retry_interval())
                .await?;
        }
        Ok(())
    }

    fn escalation_delay(&self) -> Duration {
        Duration::from_std(self.cfg.escalation_delay).unwrap_or_else(|_| Duration::minutes(5))
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_std(self.cfg.retry_interval).unwrap_or_else(|_| Duration::minutes(10))
    }
}
