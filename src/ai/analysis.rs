//! Post-call conversation analysis.
//!
//! Runs on orderly session teardown: the device is already gone, so this is
//! off the latency path. The open transcript is sent to the analysis model,
//! the structured verdict is persisted onto the call record, and an urgent
//! verdict raises a derived family alert.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, warn};

use super::tools::ToolExecutor;
use crate::config::AiConfig;
use crate::store::Store;
use crate::types::{AlertSeverity, ConversationAnalysis};

const ANALYSIS_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1/models";
/// Transcripts shorter than this carry no clinical signal.
const MIN_TRANSCRIPT_LEN: i64 = 50;

pub struct Analyzer {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl Analyzer {
    pub fn new(cfg: &AiConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: cfg.api_key.clone(),
            model: cfg.analysis_model_id.clone(),
            base_url: ANALYSIS_BASE_URL.to_string(),
        }
    }

    /// Ask the analysis model for a structured verdict on one transcript.
    pub async fn analyze(&self, transcript: &str) -> anyhow::Result<ConversationAnalysis> {
        if transcript.trim().is_empty() {
            anyhow::bail!("empty transcript");
        }
        if contains_english_markers(transcript) {
            warn!("Transcript contains English markers; analysis prompt expects Portuguese");
        }

        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let payload = json!({
            "contents": [
                { "parts": [ { "text": build_analysis_prompt(transcript) } ] }
            ],
            "generationConfig": {
                "temperature": 0.1,
                "maxOutputTokens": 2048,
            }
        });

        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!("analysis model returned {}: {}", status, body);
        }

        let text = body
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("empty analysis response"))?;

        let mut analysis = parse_analysis_response(text)?;
        analysis.last_analysis_at = Some(Utc::now());
        Ok(analysis)
    }
}

/// Model output arrives fenced more often than not; strip that before
/// parsing.
pub fn parse_analysis_response(text: &str) -> anyhow::Result<ConversationAnalysis> {
    let cleaned = strip_code_fences(text);
    let analysis: ConversationAnalysis = serde_json::from_str(cleaned)
        .map_err(|e| anyhow::anyhow!("unparseable analysis verdict: {} (response: {})", e, cleaned))?;
    Ok(analysis)
}

fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let text = text.strip_prefix("```json").unwrap_or(text);
    let text = text.strip_prefix("```").unwrap_or(text);
    let text = text.strip_suffix("```").unwrap_or(text);
    text.trim()
}

/// Plain substring scan for common English function words. Transcripts are
/// expected in Portuguese; a hit only downgrades confidence in the verdict.
pub fn contains_english_markers(text: &str) -> bool {
    const MARKERS: [&str; 6] = [" the ", " and ", " you ", " hello", " thanks", " please"];
    let lowered = text.to_lowercase();
    MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn build_analysis_prompt(transcript: &str) -> String {
    format!(
        r#"Você é um médico especialista em gerontologia e psicologia. Analise esta conversa com um idoso e identifique:

CONVERSA:
{}

Responda APENAS com um JSON válido (sem markdown, sem explicações) seguindo exatamente esta estrutura:

{{
  "reported_pain": true/false,
  "pain_location": "localização exata ou vazio",
  "pain_intensity": 0-10,
  "emergency_symptoms": true/false,
  "emergency_type": "infarto/avc/queda/respiratorio ou vazio",
  "mood_state": "feliz/triste/ansioso/confuso/irritado/neutro",
  "depression": true/false,
  "confusion": true/false,
  "loneliness": true/false,
  "medication_taken": true/false,
  "medication_issues": true/false,
  "side_effects": true/false,
  "urgency_level": "CRITICO/ALTO/MEDIO/BAIXO",
  "recommended_action": "descrição breve da ação recomendada",
  "summary": "resumo clínico em 2-3 linhas",
  "key_concerns": ["preocupação 1", "preocupação 2"]
}}

CRITÉRIOS DE URGÊNCIA:
- CRÍTICO: Dor no peito, falta de ar severa, confusão súbita, queda com trauma, AVC
- ALTO: Dor persistente, depressão severa, recusa de medicação
- MÉDIO: Tristeza, solidão, desconforto leve
- BAIXO: Conversa normal, sem queixas

Seja objetivo e preciso. Se não tiver informação, use false/vazio/0."#,
        transcript
    )
}

/// The teardown hook: analyze the subject's open transcript, finalize the
/// call record, close out the answered schedule, and raise a derived alert
/// for urgent verdicts. Every failure path logs and returns; teardown never
/// propagates analyzer problems.
pub async fn run_post_call_hook(
    store: Arc<Store>,
    analyzer: Arc<Analyzer>,
    tools: Arc<ToolExecutor>,
    subject_id: i64,
) {
    let open = match store
        .latest_open_transcript(subject_id, MIN_TRANSCRIPT_LEN)
        .await
    {
        Ok(Some(open)) => open,
        Ok(None) => {
            info!(subject_id, "No transcript worth analyzing after call");
            return;
        }
        Err(e) => {
            error!(subject_id, "Transcript lookup failed: {}", e);
            return;
        }
    };
    let (record_id, transcript) = open;

    info!(
        subject_id,
        record_id,
        chars = transcript.len(),
        "Analyzing finished call"
    );
    let analysis = match analyzer.analyze(&transcript).await {
        Ok(a) => a,
        Err(e) => {
            error!(subject_id, record_id, "Post-call analysis failed: {}", e);
            return;
        }
    };
    info!(
        subject_id,
        record_id,
        urgency = %analysis.urgency_level,
        mood = %analysis.mood_state,
        "Analysis verdict received"
    );

    let verdict = match serde_json::to_value(&analysis) {
        Ok(v) => v,
        Err(e) => {
            error!(record_id, "Verdict serialization failed: {}", e);
            return;
        }
    };
    if let Err(e) = store
        .finalize_call_record(
            record_id,
            Utc::now(),
            &verdict,
            &analysis.urgency_level,
            &analysis.mood_state,
            &analysis.summary,
        )
        .await
    {
        error!(record_id, "Call record finalization failed: {}", e);
        return;
    }

    // The call happened, so the schedule that triggered it is done.
    match store.complete_answered_schedule(subject_id).await {
        Ok(true) => info!(subject_id, "Answered schedule completed"),
        Ok(false) => {}
        Err(e) => warn!(subject_id, "Schedule completion failed: {}", e),
    }

    if analysis.is_urgent() {
        let severity = if analysis.urgency_level == "CRITICO" {
            AlertSeverity::Critical
        } else {
            AlertSeverity::High
        };
        let message = format!(
            "URGÊNCIA {}: {}. {}",
            analysis.urgency_level,
            analysis.key_concerns.join(", "),
            analysis.recommended_action
        );
        if let Err(e) = tools.alert_family(subject_id, &message, severity).await {
            error!(subject_id, "Derived urgency alert failed: {}", e);
        }
    }
}
