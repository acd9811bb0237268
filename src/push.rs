//! Push dispatcher.
//!
//! Wraps the mobile push provider behind [`PushSender`] so the scheduler,
//! tool executor, and tests all speak to the same seam. The concrete
//! implementation talks to FCM over HTTP; errors are classified so callers
//! can tell a dead token from a transient outage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct PushError {
    pub kind: PushErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushErrorKind {
    /// The provider no longer recognizes this registration token. The caller
    /// should mark the token invalid and stop retrying against it.
    InvalidToken,
    /// Missing/empty token before any provider round-trip.
    EmptyToken,
    /// Transient provider or network failure; retry under escalation policy.
    Unavailable,
    Other,
}

impl PushError {
    pub fn is_invalid_token(&self) -> bool {
        matches!(self.kind, PushErrorKind::InvalidToken)
    }

    fn empty_token() -> Self {
        Self {
            kind: PushErrorKind::EmptyToken,
            message: "device token is empty".into(),
        }
    }
}

/// Outcome of a family-alert delivery attempt. Mirrors what the store needs
/// to record on the alert row.
#[derive(Debug, Clone)]
pub struct AlertDelivery {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    /// Signal the device app to open the voice-call screen.
    async fn send_call_invite(
        &self,
        token: &str,
        session_id: &str,
        subject_name: &str,
    ) -> Result<String, PushError>;

    /// Emergency alert to a caregiver. Never errors; delivery status is in
    /// the result so the caller can count successes across recipients.
    async fn send_family_alert(&self, token: &str, subject_name: &str, reason: &str)
        -> AlertDelivery;

    async fn send_medication_confirmation(
        &self,
        token: &str,
        subject_name: &str,
        medication: &str,
    ) -> Result<(), PushError>;

    async fn send_missed_call_alert(&self, token: &str, subject_name: &str)
        -> Result<(), PushError>;

    /// Silent data message used to probe whether a token is still live.
    async fn validate_token(&self, token: &str) -> bool;
}

// ---------------------------------------------------------------------------
// FCM implementation
// ---------------------------------------------------------------------------

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

pub struct FcmDispatcher {
    client: Client,
    server_key: String,
    endpoint: String,
}

impl FcmDispatcher {
    /// Read the provider credentials file (JSON with a `server_key` field,
    /// or the bare key) and build the HTTP client.
    pub fn from_credentials_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read push credentials '{}': {}", path, e))?;
        let server_key = match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => value
                .get("server_key")
                .and_then(|k| k.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("push credentials missing 'server_key'"))?,
            Err(_) => raw.trim().to_string(),
        };
        if server_key.is_empty() {
            anyhow::bail!("push credentials are empty");
        }

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        info!("Push dispatcher initialized");
        Ok(Self {
            client,
            server_key,
            endpoint: FCM_ENDPOINT.to_string(),
        })
    }

    #[cfg(test)]
    fn with_endpoint(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            server_key: "test-key".into(),
            endpoint,
        }
    }

    /// POST one message; classify provider-reported token errors.
    async fn send(&self, payload: serde_json::Value) -> Result<String, PushError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| PushError {
                kind: PushErrorKind::Unavailable,
                message: e.to_string(),
            })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or(json!({}));

        if !status.is_success() {
            let kind = if status.as_u16() >= 500 {
                PushErrorKind::Unavailable
            } else {
                PushErrorKind::Other
            };
            return Err(PushError {
                kind,
                message: format!("provider returned {}", status),
            });
        }

        // Per-message results carry the token errors even on HTTP 200.
        if let Some(error) = body
            .get("results")
            .and_then(|r| r.as_array())
            .and_then(|r| r.first())
            .and_then(|r| r.get("error"))
            .and_then(|e| e.as_str())
        {
            let kind = if is_invalid_token_error(error) {
                PushErrorKind::InvalidToken
            } else if error == "Unavailable" || error == "InternalServerError" {
                PushErrorKind::Unavailable
            } else {
                PushErrorKind::Other
            };
            return Err(PushError {
                kind,
                message: error.to_string(),
            });
        }

        let message_id = body
            .get("results")
            .and_then(|r| r.as_array())
            .and_then(|r| r.first())
            .and_then(|r| r.get("message_id"))
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(message_id)
    }
}

/// Placeholder used when the process starts without push credentials: every
/// delivery fails as unavailable, and the outbound-call scheduler is kept
/// down by the composition root.
pub struct DisabledPush;

#[async_trait]
impl PushSender for DisabledPush {
    async fn send_call_invite(
        &self,
        _token: &str,
        _session_id: &str,
        _subject_name: &str,
    ) -> Result<String, PushError> {
        Err(PushError {
            kind: PushErrorKind::Unavailable,
            message: "push provider not configured".into(),
        })
    }

    async fn send_family_alert(
        &self,
        _token: &str,
        _subject_name: &str,
        _reason: &str,
    ) -> AlertDelivery {
        AlertDelivery {
            success: false,
            message_id: None,
            error: Some("push provider not configured".into()),
            sent_at: Utc::now(),
        }
    }

    async fn send_medication_confirmation(
        &self,
        _token: &str,
        _subject_name: &str,
        _medication: &str,
    ) -> Result<(), PushError> {
        Err(PushError {
            kind: PushErrorKind::Unavailable,
            message: "push provider not configured".into(),
        })
    }

    async fn send_missed_call_alert(
        &self,
        _token: &str,
        _subject_name: &str,
    ) -> Result<(), PushError> {
        Err(PushError {
            kind: PushErrorKind::Unavailable,
            message: "push provider not configured".into(),
        })
    }

    async fn validate_token(&self, _token: &str) -> bool {
        false
    }
}

/// Provider error strings that mean the registration token is dead.
pub fn is_invalid_token_error(error: &str) -> bool {
    matches!(
        error,
        "NotRegistered" | "InvalidRegistration" | "MismatchSenderId"
    )
}

#[async_trait]
impl PushSender for FcmDispatcher {
    async fn send_call_invite(
        &self,
        token: &str,
        session_id: &str,
        subject_name: &str,
    ) -> Result<String, PushError> {
        if token.is_empty() {
            return Err(PushError::empty_token());
        }

        let payload = json!({
            "to": token,
            "priority": "high",
            "time_to_live": 0,
            "notification": {
                "title": "🤖 EVA está chamando",
                "body": format!("Olá {}, vamos conversar?", subject_name),
                "sound": "default",
                "android_channel_id": "eva_calls",
                "click_action": "OPEN_CALL_ACTIVITY",
            },
            "data": {
                "type": "incoming_call",
                "sessionId": session_id,
                "action": "START_VOICE_CALL",
                "priority": "high",
                "timestamp": Utc::now().timestamp().to_string(),
            },
        });

        let message_id = self.send(payload).await?;
        info!(subject = %subject_name, session_id, "Call invite pushed");
        Ok(message_id)
    }

    async fn send_family_alert(
        &self,
        token: &str,
        subject_name: &str,
        reason: &str,
    ) -> AlertDelivery {
        let sent_at = Utc::now();
        if token.is_empty() {
            return AlertDelivery {
                success: false,
                message_id: None,
                error: Some("device token is empty".into()),
                sent_at,
            };
        }

        let payload = json!({
            "to": token,
            "priority": "high",
            "notification": {
                "title": "⚠️ ALERTA CRÍTICO: EVA",
                "body": format!("{} precisa de ajuda: {}", subject_name, reason),
                "sound": "alert",
                "android_channel_id": "eva_alerts",
                "color": "#FF0000",
            },
            "data": {
                "type": "emergency_alert",
                "reason": reason,
                "priority": "high",
                "timestamp": sent_at.timestamp().to_string(),
                "alert_id": format!("alert-{}", uuid::Uuid::new_v4()),
            },
        });

        match self.send(payload).await {
            Ok(message_id) => AlertDelivery {
                success: true,
                message_id: Some(message_id),
                error: None,
                sent_at,
            },
            Err(e) => {
                warn!(subject = %subject_name, "Family alert push failed: {}", e);
                AlertDelivery {
                    success: false,
                    message_id: None,
                    error: Some(e.to_string()),
                    sent_at,
                }
            }
        }
    }

    async fn send_medication_confirmation(
        &self,
        token: &str,
        subject_name: &str,
        medication: &str,
    ) -> Result<(), PushError> {
        if token.is_empty() {
            return Err(PushError::empty_token());
        }

        let payload = json!({
            "to": token,
            "priority": "normal",
            "notification": {
                "title": "✅ Medicamento Confirmado",
                "body": format!("{} tomou o remédio: {}", subject_name, medication),
                "sound": "default",
                "android_channel_id": "eva_medications",
                "color": "#00FF00",
            },
            "data": {
                "type": "medication_confirmed",
                "medication": medication,
                "priority": "normal",
                "timestamp": Utc::now().timestamp().to_string(),
            },
        });

        self.send(payload).await.map(|_| ())
    }

    async fn send_missed_call_alert(
        &self,
        token: &str,
        subject_name: &str,
    ) -> Result<(), PushError> {
        if token.is_empty() {
            return Err(PushError::empty_token());
        }

        let payload = json!({
            "to": token,
            "priority": "high",
            "notification": {
                "title": "⚠️ Chamada Não Atendida",
                "body": format!(
                    "{} não atendeu a chamada programada da EVA. Verifique se está tudo bem.",
                    subject_name
                ),
                "sound": "alert",
                "android_channel_id": "eva_alerts",
                "color": "#FF0000",
            },
            "data": {
                "type": "missed_call_alert",
                "elder_name": subject_name,
                "priority": "high",
                "timestamp": Utc::now().timestamp().to_string(),
            },
        });

        self.send(payload).await.map(|_| ())
    }

    async fn validate_token(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }

        let payload = json!({
            "to": token,
            "priority": "normal",
            "data": { "type": "token_validation" },
        });

        match self.send(payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Token validation failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory push sender used across the test suite.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SentPush {
        CallInvite {
            token: String,
            session_id: String,
        },
        FamilyAlert {
            token: String,
            reason: String,
        },
        MedicationConfirmation {
            token: String,
            medication: String,
        },
        MissedCallAlert {
            token: String,
        },
    }

    #[derive(Default)]
    pub struct MockPush {
        pub sent: Mutex<Vec<SentPush>>,
        /// Tokens the provider rejects as dead.
        pub invalid_tokens: Mutex<Vec<String>>,
        /// When true, every delivery fails transiently.
        pub fail_all: Mutex<bool>,
    }

    impl MockPush {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn mark_invalid(&self, token: &str) {
            self.invalid_tokens.lock().unwrap().push(token.to_string());
        }

        pub fn set_fail_all(&self, fail: bool) {
            *self.fail_all.lock().unwrap() = fail;
        }

        pub fn sent(&self) -> Vec<SentPush> {
            self.sent.lock().unwrap().clone()
        }

        fn token_ok(&self, token: &str) -> Result<(), PushError> {
            if *self.fail_all.lock().unwrap() {
                return Err(PushError {
                    kind: PushErrorKind::Unavailable,
                    message: "mock outage".into(),
                });
            }
            if self.invalid_tokens.lock().unwrap().iter().any(|t| t == token) {
                return Err(PushError {
                    kind: PushErrorKind::InvalidToken,
                    message: "NotRegistered".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PushSender for MockPush {
        async fn send_call_invite(
            &self,
            token: &str,
            session_id: &str,
            _subject_name: &str,
        ) -> Result<String, PushError> {
            self.token_ok(token)?;
            self.sent.lock().unwrap().push(SentPush::CallInvite {
                token: token.to_string(),
                session_id: session_id.to_string(),
            });
            Ok("mock-id".into())
        }

        async fn send_family_alert(
            &self,
            token: &str,
            _subject_name: &str,
            reason: &str,
        ) -> AlertDelivery {
            let sent_at = Utc::now();
            match self.token_ok(token) {
                Ok(()) => {
                    self.sent.lock().unwrap().push(SentPush::FamilyAlert {
                        token: token.to_string(),
                        reason: reason.to_string(),
                    });
                    AlertDelivery {
                        success: true,
                        message_id: Some("mock-id".into()),
                        error: None,
                        sent_at,
                    }
                }
                Err(e) => AlertDelivery {
                    success: false,
                    message_id: None,
                    error: Some(e.to_string()),
                    sent_at,
                },
            }
        }

        async fn send_medication_confirmation(
            &self,
            token: &str,
            _subject_name: &str,
            medication: &str,
        ) -> Result<(), PushError> {
            self.token_ok(token)?;
            self.sent
                .lock()
                .unwrap()
                .push(SentPush::MedicationConfirmation {
                    token: token.to_string(),
                    medication: medication.to_string(),
                });
            Ok(())
        }

        async fn send_missed_call_alert(
            &self,
            token: &str,
            _subject_name: &str,
        ) -> Result<(), PushError> {
            self.token_ok(token)?;
            self.sent.lock().unwrap().push(SentPush::MissedCallAlert {
                token: token.to_string(),
            });
            Ok(())
        }

        async fn validate_token(&self, token: &str) -> bool {
            !token.is_empty() && self.token_ok(token).is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_error_classification() {
        assert!(is_invalid_token_error("NotRegistered"));
        assert!(is_invalid_token_error("InvalidRegistration"));
        assert!(is_invalid_token_error("MismatchSenderId"));
        assert!(!is_invalid_token_error("Unavailable"));
        assert!(!is_invalid_token_error(""));
    }

    #[test]
    fn invalid_token_error_is_classified() {
        let err = PushError {
            kind: PushErrorKind::InvalidToken,
            message: "NotRegistered".into(),
        };
        assert!(err.is_invalid_token());
        let err = PushError {
            kind: PushErrorKind::Unavailable,
            message: "timeout".into(),
        };
        assert!(!err.is_invalid_token());
    }

    #[tokio::test]
    async fn empty_token_fails_before_any_network_io() {
        // Endpoint that would refuse connections if ever dialed.
        let dispatcher = FcmDispatcher::with_endpoint("http://127.0.0.1:1/unreachable".into());
        let err = dispatcher
            .send_call_invite("", "call-1-1", "Maria")
            .await
            .unwrap_err();
        assert_eq!(err.kind, PushErrorKind::EmptyToken);

        assert!(!dispatcher.validate_token("").await);

        let delivery = dispatcher.send_family_alert("", "Maria", "dor").await;
        assert!(!delivery.success);
        assert!(delivery.error.is_some());
    }

    #[test]
    fn credentials_file_accepts_json_and_bare_key() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("creds.json");
        std::fs::write(&json_path, r#"{"server_key": "AAAA:key"}"#).unwrap();
        let dispatcher = FcmDispatcher::from_credentials_file(json_path.to_str().unwrap()).unwrap();
        assert_eq!(dispatcher.server_key, "AAAA:key");

        let bare_path = dir.path().join("creds.txt");
        std::fs::write(&bare_path, "BBBB:key\n").unwrap();
        let dispatcher = FcmDispatcher::from_credentials_file(bare_path.to_str().unwrap()).unwrap();
        assert_eq!(dispatcher.server_key, "BBBB:key");

        assert!(FcmDispatcher::from_credentials_file("/nonexistent").is_err());
    }
}
