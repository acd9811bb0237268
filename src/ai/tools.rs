//! Tool-call executor.
//!
//! The live session exposes exactly two callable tools to the AI. Their
//! effects are durable state transitions plus caregiver notifications;
//! execution failures are logged and swallowed so the conversational flow is
//! never blocked by notification infrastructure.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::notify::NotificationDispatcher;
use crate::store::alerts::NewAlert;
use crate::store::Store;
use crate::types::{AlertKind, AlertSeverity};

/// Tool schema sent in the upstream setup record.
pub fn default_tools() -> Value {
    json!([
        {
            "function_declarations": [
                {
                    "name": "alert_family",
                    "description": "Alerta a família em caso de emergência detectada na conversa com o idoso",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "reason": {
                                "type": "string",
                                "description": "Motivo do alerta (ex: 'Paciente relatou dor no peito', 'Idoso parece confuso')"
                            },
                            "severity": {
                                "type": "string",
                                "description": "Severidade do alerta: critica, alta, media, baixa",
                                "enum": ["critica", "alta", "media", "baixa"]
                            }
                        },
                        "required": ["reason"]
                    }
                },
                {
                    "name": "confirm_medication",
                    "description": "Confirma que o idoso tomou o remédio",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "medication_name": {
                                "type": "string",
                                "description": "Nome do medicamento tomado"
                            }
                        },
                        "required": ["medication_name"]
                    }
                }
            ]
        }
    ])
}

pub struct ToolExecutor {
    store: Arc<Store>,
    notifier: Arc<NotificationDispatcher>,
    escalation_delay: Duration,
}

impl ToolExecutor {
    pub fn new(
        store: Arc<Store>,
        notifier: Arc<NotificationDispatcher>,
        escalation_delay: std::time::Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            escalation_delay: Duration::from_std(escalation_delay)
                .unwrap_or_else(|_| Duration::minutes(5)),
        }
    }

    /// Entry point for function-call events from the demux. Never errors:
    /// the AI is not told about notification failures.
    pub async fn execute(&self, subject_id: i64, name: &str, args: &Value) {
        info!(subject_id, tool = name, "Tool call requested");
        match name {
            "alert_family" => {
                let Some(reason) = args.get("reason").and_then(|r| r.as_str()) else {
                    warn!(subject_id, "alert_family called without a reason");
                    return;
                };
                let severity = args
                    .get("severity")
                    .and_then(|s| s.as_str())
                    .and_then(AlertSeverity::parse_tool_arg)
                    .unwrap_or(AlertSeverity::High);
                if let Err(e) = self.alert_family(subject_id, reason, severity).await {
                    error!(subject_id, "alert_family failed: {}", e);
                }
            }
            "confirm_medication" => {
                let Some(medication) = args.get("medication_name").and_then(|m| m.as_str()) else {
                    warn!(subject_id, "confirm_medication called without a medication name");
                    return;
                };
                if let Err(e) = self.confirm_medication(subject_id, medication).await {
                    error!(subject_id, "confirm_medication failed: {}", e);
                }
            }
            other => warn!(subject_id, tool = other, "Unknown tool requested, ignoring"),
        }
    }

    /// Dispatch an emergency alert to every active caregiver. Returns the
    /// alert id. Delivery bookkeeping:
    /// - any success ⇒ sent
    /// - zero successes ⇒ queued for escalation with one attempt counted
    /// - critical severity ⇒ queued for escalation regardless, so an
    ///   unacknowledged alert is revisited even after a delivered push
    pub async fn alert_family(
        &self,
        subject_id: i64,
        reason: &str,
        severity: AlertSeverity,
    ) -> anyhow::Result<i64> {
        let subject = self
            .store
            .get_subject(subject_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown subject {}", subject_id))?;
        let caregivers = self.store.list_active_caregivers(subject_id).await?;
        if caregivers.is_empty() {
            warn!(subject_id, "No active caregivers for family alert");
        }

        let recipients: Vec<String> = caregivers.iter().map(|c| c.name.clone()).collect();
        let alert_id = self
            .store
            .insert_alert(&NewAlert {
                subject_id,
                call_record_id: None,
                kind: AlertKind::Family,
                severity,
                message: reason,
                recipients: &recipients,
            })
            .await?;

        let push = self.notifier.push_sender();
        let mut successes = 0usize;
        let mut attempted = 0usize;
        for caregiver in &caregivers {
            let Some(token) = caregiver.device_token.as_deref().filter(|t| !t.is_empty()) else {
                continue;
            };
            attempted += 1;
            let delivery = push.send_family_alert(token, &subject.name, reason).await;
            if delivery.success {
                successes += 1;
            } else {
                warn!(
                    alert_id,
                    caregiver = %caregiver.name,
                    "Family alert push failed: {}",
                    delivery.error.as_deref().unwrap_or("unknown")
                );
            }
        }

        if successes > 0 {
            self.store.mark_alert_sent(alert_id).await?;
            info!(alert_id, successes, attempted, "Family alert delivered");
        } else {
            self.store
                .flag_alert_for_escalation(alert_id, Utc::now() + self.escalation_delay, true)
                .await?;
            warn!(alert_id, attempted, "No family alert push succeeded, queued for escalation");
        }

        if severity == AlertSeverity::Critical {
            self.store
                .flag_alert_for_escalation(alert_id, Utc::now() + self.escalation_delay, false)
                .await?;
            info!(alert_id, "Critical alert armed for escalation if unacknowledged");
        }

        Ok(alert_id)
    }

    /// Record medication adherence, close out the day's schedule, and let
    /// caregivers know. Notification failures are logged only.
    pub async fn confirm_medication(
        &self,
        subject_id: i64,
        medication: &str,
    ) -> anyhow::Result<()> {
        let subject = self
            .store
            .get_subject(subject_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("unknown subject {}", subject_id))?;

        self.store.log_medication(subject_id, medication).await?;
        let closed = self.store.complete_in_progress_for_day(subject_id).await?;
        info!(subject_id, medication, closed_schedules = closed, "Medication confirmed");

        let caregivers = self.store.list_active_caregivers(subject_id).await?;
        let sent = self
            .notifier
            .notify_medication_confirmed(&caregivers, &subject.name, medication)
            .await;
        if sent > 0 {
            info!(subject_id, sent, "Caregivers notified about medication");
        }
        Ok(())
    }
}
