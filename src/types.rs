//! Shared domain types for the care relay.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The monitored person. Rows are managed by the operator dashboard; the
/// relay reads them but never creates them.
#[derive(Debug, Clone)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    /// National identifier, used as the session auth key. Stored as entered
    /// (may contain punctuation); compare with [`normalize_auth_key`].
    pub cpf: String,
    pub birth_date: Option<NaiveDate>,
    pub device_token: Option<String>,
    pub device_token_valid: bool,
    pub active: bool,
    pub cognitive_level: String,
    pub hearing_impaired: bool,
    pub uses_hearing_aid: bool,
    pub voice_tone: String,
}

impl Subject {
    pub fn age_years(&self, today: NaiveDate) -> Option<i32> {
        let birth = self.birth_date?;
        let mut age = today.years_since(birth)? as i32;
        if age < 0 {
            age = 0;
        }
        Some(age)
    }
}

/// A family member or professional authorized to receive alerts.
#[derive(Debug, Clone)]
pub struct Caregiver {
    pub id: i64,
    pub subject_id: i64,
    pub name: String,
    pub device_token: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// 1 = primary.
    pub priority: i64,
    pub active: bool,
}

/// Strip everything but ASCII digits. Idempotent by construction.
pub fn normalize_auth_key(key: &str) -> String {
    key.chars().filter(|c| c.is_ascii_digit()).collect()
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Pending,
    InProgress,
    Completed,
    Unanswered,
    FailedNoToken,
    FailedInvalidToken,
    FailedSend,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::InProgress => "in_progress",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Unanswered => "unanswered",
            ScheduleStatus::FailedNoToken => "failed_no_token",
            ScheduleStatus::FailedInvalidToken => "failed_invalid_token",
            ScheduleStatus::FailedSend => "failed_send",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "pending" => ScheduleStatus::Pending,
            "in_progress" => ScheduleStatus::InProgress,
            "completed" => ScheduleStatus::Completed,
            "unanswered" => ScheduleStatus::Unanswered,
            "failed_no_token" => ScheduleStatus::FailedNoToken,
            "failed_invalid_token" => ScheduleStatus::FailedInvalidToken,
            "failed_send" => ScheduleStatus::FailedSend,
            _ => return None,
        })
    }

    /// True for states that never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScheduleStatus::Pending | ScheduleStatus::InProgress)
    }

    /// The schedule state DAG: pending → in_progress → {completed,
    /// unanswered}; pending may also fail directly (token problems surface
    /// before the invite push goes out). Terminal states never regress.
    pub fn can_transition(from: Self, to: Self) -> bool {
        use ScheduleStatus::*;
        match (from, to) {
            (Pending, InProgress)
            | (Pending, FailedNoToken)
            | (Pending, FailedInvalidToken)
            | (Pending, FailedSend) => true,
            (InProgress, Completed) | (InProgress, Unanswered) => true,
            _ => false,
        }
    }

    /// States a row may be in for `to` to be a legal next state. Used to
    /// build guarded single-row updates.
    pub fn allowed_sources(to: Self) -> &'static [&'static str] {
        use ScheduleStatus::*;
        match to {
            InProgress | FailedNoToken | FailedInvalidToken | FailedSend => &["pending"],
            Completed | Unanswered => &["in_progress"],
            Pending => &[],
        }
    }
}

/// A planned outbound call to a subject.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: i64,
    pub subject_id: i64,
    pub kind: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub retries: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Call records
// ---------------------------------------------------------------------------

/// Durable record of one conducted or attempted call. The transcript blob is
/// append-only for the record's lifetime.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub id: i64,
    pub subject_id: i64,
    pub schedule_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub completed: bool,
    pub failure_reason: Option<String>,
    pub transcript: Option<String>,
    pub analysis: Option<serde_json::Value>,
    pub urgency: Option<String>,
    pub mood: Option<String>,
    pub summary: Option<String>,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Critical => "critical",
            AlertSeverity::High => "high",
            AlertSeverity::Medium => "medium",
            AlertSeverity::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "critical" => AlertSeverity::Critical,
            "high" => AlertSeverity::High,
            "medium" => AlertSeverity::Medium,
            "low" => AlertSeverity::Low,
            _ => return None,
        })
    }

    /// Parse the value the AI emits in tool calls. The tool schema speaks
    /// Portuguese (matching the voice persona); accept both spellings.
    pub fn parse_tool_arg(raw: &str) -> Option<Self> {
        Some(match raw.trim().to_lowercase().as_str() {
            "critica" | "crítica" | "critical" => AlertSeverity::Critical,
            "alta" | "high" => AlertSeverity::High,
            "media" | "média" | "medium" => AlertSeverity::Medium,
            "baixa" | "low" => AlertSeverity::Low,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Family,
    MissedCall,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Family => "family",
            AlertKind::MissedCall => "missed_call",
        }
    }
}

/// A notification of consequence, with severity and escalation metadata.
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: i64,
    pub subject_id: i64,
    pub call_record_id: Option<i64>,
    pub kind: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub recipients: Vec<String>,
    pub sent: bool,
    pub acknowledged: bool,
    pub needs_escalation: bool,
    pub escalation_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Append-only activity feed entry shown on the caregiver dashboard.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub subject_id: i64,
    pub kind: String,
    pub subkind: String,
    pub title: String,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Post-call analysis verdict
// ---------------------------------------------------------------------------

/// Structured verdict produced by the post-call analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    // Physical health
    #[serde(default)]
    pub reported_pain: bool,
    #[serde(default)]
    pub pain_location: String,
    #[serde(default)]
    pub pain_intensity: i32,
    #[serde(default)]
    pub emergency_symptoms: bool,
    #[serde(default)]
    pub emergency_type: String,

    // Mental health
    #[serde(default)]
    pub mood_state: String,
    #[serde(default)]
    pub depression: bool,
    #[serde(default)]
    pub confusion: bool,
    #[serde(default)]
    pub loneliness: bool,

    // Medication
    #[serde(default)]
    pub medication_taken: bool,
    #[serde(default)]
    pub medication_issues: bool,
    #[serde(default)]
    pub side_effects: bool,

    // Urgency
    #[serde(default)]
    pub urgency_level: String,
    #[serde(default)]
    pub recommended_action: String,

    // Summary
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_concerns: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_analysis_at: Option<DateTime<Utc>>,
}

impl ConversationAnalysis {
    /// High-urgency verdicts trigger a derived family alert.
    pub fn is_urgent(&self) -> bool {
        matches!(self.urgency_level.as_str(), "CRITICO" | "ALTO")
    }
}
