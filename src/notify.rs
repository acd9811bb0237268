//! Tiered notification fallback.
//!
//! The chain is push → SMS → email → voice call. The initial push happens at
//! alert creation (tool executor or missed-call sweep); each escalation pass
//! walks one tier further, skipping tiers the deployment has not enabled.
//! Once the chain is exhausted the last enabled tier keeps being retried.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::FallbackConfig;
use crate::email::EmailService;
use crate::push::PushSender;
use crate::sms::SmsService;
use crate::store::alerts::StaleAlert;
use crate::types::Caregiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTier {
    Push,
    Sms,
    Email,
    VoiceCall,
}

impl FallbackTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackTier::Push => "push",
            FallbackTier::Sms => "sms",
            FallbackTier::Email => "email",
            FallbackTier::VoiceCall => "call",
        }
    }
}

/// Pick the escalation tier for the Nth attempt (0-based) given which tiers
/// the deployment enabled. With nothing enabled, push is retried.
pub fn select_tier(cfg: &FallbackConfig, attempts: i64) -> FallbackTier {
    let mut chain = Vec::with_capacity(3);
    if cfg.sms {
        chain.push(FallbackTier::Sms);
    }
    if cfg.email {
        chain.push(FallbackTier::Email);
    }
    if cfg.voice_call {
        chain.push(FallbackTier::VoiceCall);
    }

    if chain.is_empty() {
        return FallbackTier::Push;
    }
    let index = (attempts.max(0) as usize).min(chain.len() - 1);
    chain[index]
}

pub struct NotificationDispatcher {
    push: Arc<dyn PushSender>,
    email: Option<EmailService>,
    sms: Option<SmsService>,
    fallback: FallbackConfig,
}

impl NotificationDispatcher {
    pub fn new(
        push: Arc<dyn PushSender>,
        email: Option<EmailService>,
        sms: Option<SmsService>,
        fallback: FallbackConfig,
    ) -> Self {
        // A tier without its service behaves as disabled.
        let fallback = FallbackConfig {
            sms: fallback.sms && sms.is_some(),
            email: fallback.email && email.is_some(),
            voice_call: fallback.voice_call && sms.is_some(),
        };
        Self {
            push,
            email,
            sms,
            fallback,
        }
    }

    pub fn push_sender(&self) -> Arc<dyn PushSender> {
        self.push.clone()
    }

    /// Attempt the next tier for a stale alert. Returns the tier attempted;
    /// delivery failures are reported as errors so the scheduler can leave
    /// the alert queued.
    pub async fn escalate(
        &self,
        alert: &StaleAlert,
        caregiver: &Caregiver,
    ) -> anyhow::Result<FallbackTier> {
        let tier = select_tier(&self.fallback, alert.attempts);
        info!(
            alert_id = alert.alert_id,
            subject = %alert.subject_name,
            tier = tier.as_str(),
            attempt = alert.attempts + 1,
            "Escalating unacknowledged alert"
        );

        match tier {
            FallbackTier::Push => {
                let token = caregiver.device_token.as_deref().unwrap_or_default();
                let delivery = self
                    .push
                    .send_family_alert(token, &alert.subject_name, &alert.message)
                    .await;
                if !delivery.success {
                    anyhow::bail!(
                        "push escalation failed: {}",
                        delivery.error.unwrap_or_else(|| "unknown".into())
                    );
                }
            }
            FallbackTier::Sms => {
                let sms = self
                    .sms
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("SMS tier selected but not configured"))?;
                let phone = caregiver
                    .phone
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("caregiver has no phone number"))?;
                sms.send_alert_sms(phone, &alert.subject_name, &alert.message)
                    .await?;
            }
            FallbackTier::Email => {
                let email = self
                    .email
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("email tier selected but not configured"))?;
                let address = caregiver
                    .email
                    .as_deref()
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("caregiver has no email address"))?;
                email
                    .send_emergency_alert(address, &caregiver.name, &alert.subject_name, &alert.message)
                    .await?;
            }
            FallbackTier::VoiceCall => {
                let sms = self
                    .sms
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("voice tier selected but not configured"))?;
                let phone = caregiver
                    .phone
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("caregiver has no phone number"))?;
                sms.place_alert_call(phone, &alert.subject_name, &alert.message)
                    .await?;
            }
        }

        Ok(tier)
    }

    /// Best-effort medication confirmation fan-out to every caregiver with a
    /// token. Failures are logged, never propagated.
    pub async fn notify_medication_confirmed(
        &self,
        caregivers: &[Caregiver],
        subject_name: &str,
        medication: &str,
    ) -> usize {
        let mut sent = 0;
        for caregiver in caregivers {
            let Some(token) = caregiver.device_token.as_deref().filter(|t| !t.is_empty()) else {
                continue;
            };
            match self
                .push
                .send_medication_confirmation(token, subject_name, medication)
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => warn!(caregiver = %caregiver.name, "Medication push failed: {}", e),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(sms: bool, email: bool, voice_call: bool) -> FallbackConfig {
        FallbackConfig {
            sms,
            email,
            voice_call,
        }
    }

    #[test]
    fn tiers_walk_in_chain_order() {
        let all = cfg(true, true, true);
        assert_eq!(select_tier(&all, 0), FallbackTier::Sms);
        assert_eq!(select_tier(&all, 1), FallbackTier::Email);
        assert_eq!(select_tier(&all, 2), FallbackTier::VoiceCall);
        // Exhausted: keep retrying the last enabled tier.
        assert_eq!(select_tier(&all, 7), FallbackTier::VoiceCall);
    }

    #[test]
    fn disabled_tiers_are_skipped() {
        let email_only = cfg(false, true, false);
        assert_eq!(select_tier(&email_only, 0), FallbackTier::Email);
        assert_eq!(select_tier(&email_only, 3), FallbackTier::Email);

        let sms_voice = cfg(true, false, true);
        assert_eq!(select_tier(&sms_voice, 0), FallbackTier::Sms);
        assert_eq!(select_tier(&sms_voice, 1), FallbackTier::VoiceCall);
    }

    #[test]
    fn no_tiers_falls_back_to_push() {
        let none = cfg(false, false, false);
        assert_eq!(select_tier(&none, 0), FallbackTier::Push);
        assert_eq!(select_tier(&none, 5), FallbackTier::Push);
    }

    #[test]
    fn negative_attempts_clamp_to_first_tier() {
        let all = cfg(true, true, true);
        assert_eq!(select_tier(&all, -3), FallbackTier::Sms);
    }
}
