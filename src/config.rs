use std::time::Duration;

/// Process configuration, read from the environment.
///
/// The daemon refuses to start without the store URL and the AI provider
/// key; everything else has a default. Fallback channels that are enabled
/// without their credentials produce a startup warning, not an error; the
/// escalation chain simply skips them at runtime.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,

    pub ai: AiConfig,
    pub push: PushConfig,
    pub scheduler: SchedulerConfig,
    pub fallback: FallbackConfig,
    pub smtp: SmtpConfig,
    pub twilio: TwilioConfig,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    /// Realtime (live audio) model.
    pub model_id: String,
    /// Post-call analysis model.
    pub analysis_model_id: String,
    pub voice_name: String,
    pub language_code: String,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub credentials_path: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fast tick: fire due schedules + sweep missed calls.
    pub fast_tick: Duration,
    /// Slow tick: escalate stale unacknowledged alerts.
    pub slow_tick: Duration,
    pub max_retries: i64,
    /// Window before an unacknowledged alert is first revisited.
    pub escalation_delay: Duration,
    /// Window between subsequent escalation attempts.
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct FallbackConfig {
    pub sms: bool,
    pub email: bool,
    pub voice_call: bool,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_name: String,
    pub from_email: String,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            port: env_parsed("PORT", 8080),
            database_url: env_or_default("DATABASE_URL", ""),
            ai: AiConfig {
                api_key: env_or_default("GOOGLE_API_KEY", ""),
                model_id: env_or_default("MODEL_ID", "gemini-2.0-flash-exp"),
                analysis_model_id: env_or_default("ANALYSIS_MODEL_ID", "gemini-2.5-flash"),
                voice_name: env_or_default("VOICE_NAME", "Aoede"),
                language_code: env_or_default("LANGUAGE_CODE", "pt-BR"),
            },
            push: PushConfig {
                credentials_path: env_or_default("FCM_CREDENTIALS_PATH", ""),
            },
            scheduler: SchedulerConfig {
                fast_tick: Duration::from_secs(env_parsed("SCHEDULER_INTERVAL_SECS", 30u64)),
                slow_tick: Duration::from_secs(120),
                max_retries: env_parsed("MAX_RETRIES", 3i64),
                escalation_delay: Duration::from_secs(
                    env_parsed("ALERT_ESCALATION_MIN", 5u64) * 60,
                ),
                retry_interval: Duration::from_secs(
                    env_parsed("ALERT_RETRY_INTERVAL_MIN", 10u64) * 60,
                ),
            },
            fallback: FallbackConfig {
                sms: env_bool("ENABLE_SMS_FALLBACK", false),
                email: env_bool("ENABLE_EMAIL_FALLBACK", true),
                voice_call: env_bool("ENABLE_CALL_FALLBACK", false),
            },
            smtp: SmtpConfig {
                host: env_or_default("SMTP_HOST", "smtp.gmail.com"),
                port: env_parsed("SMTP_PORT", 587),
                username: env_or_default("SMTP_USERNAME", ""),
                password: env_or_default("SMTP_PASSWORD", ""),
                from_name: env_or_default("SMTP_FROM_NAME", "EVA - Assistente Virtual"),
                from_email: env_or_default("SMTP_FROM_EMAIL", ""),
            },
            twilio: TwilioConfig {
                account_sid: env_or_default("TWILIO_ACCOUNT_SID", ""),
                auth_token: env_or_default("TWILIO_AUTH_TOKEN", ""),
                phone_number: env_or_default("TWILIO_PHONE_NUMBER", ""),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("DATABASE_URL is required");
        }
        if self.ai.api_key.is_empty() {
            anyhow::bail!("GOOGLE_API_KEY is required");
        }

        if self.fallback.sms && (self.twilio.account_sid.is_empty() || self.twilio.auth_token.is_empty()) {
            tracing::warn!("SMS fallback enabled but Twilio credentials are not configured");
        }
        if self.fallback.email && (self.smtp.username.is_empty() || self.smtp.password.is_empty()) {
            tracing::warn!("Email fallback enabled but SMTP credentials are not configured");
        }
        if self.fallback.voice_call && self.twilio.phone_number.is_empty() {
            tracing::warn!("Voice-call fallback enabled but no Twilio phone number configured");
        }

        Ok(())
    }
}

/// Per-subscription feature gating predicate. Subscription plans are managed
/// outside this service; the relay only ever asks a yes/no question.
#[allow(dead_code)]
pub fn has_feature(_entity_id: i64, flag: &str) -> bool {
    // Every deployment of the core relay currently ships all features; plans
    // that restrict them answer through this seam.
    !flag.is_empty()
}

fn env_or_default(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}
