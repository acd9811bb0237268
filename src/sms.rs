//! SMS and voice-call fallback channels (Twilio REST).
//!
//! Thin adapters: the escalation chain only needs "deliver this text to
//! this phone number" and "ring this phone". Both are config-gated; a
//! deployment without telephony credentials never constructs this service.

use reqwest::Client;
use std::time::Duration;
use tracing::info;

use crate::config::TwilioConfig;

pub struct SmsService {
    client: Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    base_url: String,
}

impl SmsService {
    pub fn new(cfg: &TwilioConfig) -> anyhow::Result<Self> {
        if cfg.account_sid.is_empty() || cfg.auth_token.is_empty() {
            anyhow::bail!("Twilio credentials not configured");
        }

        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(10)).build()?,
            account_sid: cfg.account_sid.clone(),
            auth_token: cfg.auth_token.clone(),
            from_number: cfg.phone_number.clone(),
            base_url: "https://api.twilio.com/2010-04-01".to_string(),
        })
    }

    pub async fn send_alert_sms(
        &self,
        phone: &str,
        subject_name: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let body = format!("EVA ALERTA - {}: {}", subject_name, message);
        let url = format!(
            "{}/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", phone), ("From", &self.from_number), ("Body", &body)])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("SMS provider returned {}", response.status());
        }
        info!(to = %phone, "Alert SMS sent");
        Ok(())
    }

    /// Last-resort tier: place a call that reads the alert aloud (TwiML).
    pub async fn place_alert_call(
        &self,
        phone: &str,
        subject_name: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let say = format!(
            "Alerta do sistema EVA. {} precisa de atenção. {}",
            subject_name, message
        );
        let twiml = format!(
            "<Response><Say language=\"pt-BR\">{}</Say></Response>",
            xml_escape(&say)
        );
        let url = format!("{}/Accounts/{}/Calls.json", self.base_url, self.account_sid);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", phone), ("From", &self.from_number), ("Twiml", &twiml)])
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Voice provider returned {}", response.status());
        }
        info!(to = %phone, "Alert voice call placed");
        Ok(())
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
