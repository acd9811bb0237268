//! Email fallback channel.
//!
//! Used by the escalation chain when push delivery fails or goes
//! unacknowledged. Bodies are self-contained HTML so they render in any
//! caregiver inbox.

use chrono::Local;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config::SmtpConfig;

pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl EmailService {
    pub fn new(cfg: &SmtpConfig) -> anyhow::Result<Self> {
        if cfg.username.is_empty() || cfg.password.is_empty() {
            anyhow::bail!("SMTP credentials not configured");
        }

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)?
            .port(cfg.port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .build();

        let from_email = if cfg.from_email.is_empty() {
            cfg.username.clone()
        } else {
            cfg.from_email.clone()
        };

        Ok(Self {
            transport,
            from: format!("{} <{}>", cfg.from_name, from_email),
        })
    }

    async fn send(&self, to: &str, subject: &str, html_body: String) -> anyhow::Result<()> {
        let message = Message::builder()
            .from(self.from.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body)?;

        self.transport.send(message).await?;
        Ok(())
    }

    pub async fn send_missed_call_alert(
        &self,
        caregiver_email: &str,
        caregiver_name: &str,
        subject_name: &str,
    ) -> anyhow::Result<()> {
        let subject = format!("⚠️ Chamada Não Atendida - {}", subject_name);
        let body = missed_call_template(subject_name, caregiver_name);
        self.send(caregiver_email, &subject, body).await?;
        info!(to = %caregiver_email, "Missed-call email sent");
        Ok(())
    }

    pub async fn send_emergency_alert(
        &self,
        caregiver_email: &str,
        caregiver_name: &str,
        subject_name: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        let subject = format!("🚨 ALERTA CRÍTICO - {}", subject_name);
        let body = emergency_template(subject_name, caregiver_name, reason);
        self.send(caregiver_email, &subject, body).await?;
        info!(to = %caregiver_email, "Emergency email sent");
        Ok(())
    }
}

fn missed_call_template(subject_name: &str, caregiver_name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <style>
        body {{ font-family: Arial, sans-serif; background-color: #f4f4f4; margin: 0; padding: 20px; }}
        .container {{ max-width: 600px; margin: 0 auto; background-color: #ffffff; border-radius: 8px; overflow: hidden; }}
        .header {{ background-color: #FF0000; color: white; padding: 20px; text-align: center; }}
        .content {{ padding: 30px; }}
        .alert-box {{ background-color: #FFF3CD; border-left: 4px solid #FF0000; padding: 15px; margin: 20px 0; }}
        .footer {{ background-color: #f8f9fa; padding: 15px; text-align: center; font-size: 12px; color: #666; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="header"><h1>⚠️ Chamada Não Atendida</h1></div>
        <div class="content">
            <p>Olá <strong>{caregiver}</strong>,</p>
            <div class="alert-box">
                <strong>ALERTA:</strong> <strong>{subject}</strong> não atendeu a chamada programada da EVA.
            </div>
            <p><strong>Data/Hora:</strong> {when}</p>
            <p>Por favor, verifique se está tudo bem com o idoso. Este alerta foi enviado porque a notificação push não foi entregue.</p>
            <p><strong>Ações recomendadas:</strong></p>
            <ul>
                <li>Ligar para o idoso para verificar se está tudo bem</li>
                <li>Verificar se o dispositivo móvel está funcionando</li>
                <li>Verificar se as notificações estão habilitadas no app</li>
            </ul>
        </div>
        <div class="footer">
            <p>Este é um email automático do sistema EVA - Assistente Virtual para Idosos</p>
            <p>Não responda a este email</p>
        </div>
    </div>
</body>
</html>"#,
        caregiver = caregiver_name,
        subject = subject_name,
        when = Local::now().format("%d/%m/%Y %H:%M"),
    )
}

fn emergency_template(subject_name: &str, caregiver_name: &str, reason: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <style>
        body {{ font-family: Arial, sans-serif; background-color: #f4f4f4; margin: 0; padding: 20px; }}
        .container {{ max-width: 600px; margin: 0 auto; background-color: #ffffff; border-radius: 8px; overflow: hidden; }}
        .header {{ background-color: #DC3545; color: white; padding: 20px; text-align: center; }}
        .content {{ padding: 30px; }}
        .critical-box {{ background-color: #F8D7DA; border-left: 4px solid #DC3545; padding: 15px; margin: 20px 0; }}
        .footer {{ background-color: #f8f9fa; padding: 15px; text-align: center; font-size: 12px; color: #666; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="header"><h1>🚨 ALERTA CRÍTICO</h1></div>
        <div class="content">
            <p>Olá <strong>{caregiver}</strong>,</p>
            <div class="critical-box">
                <strong>EMERGÊNCIA DETECTADA:</strong> {reason}
            </div>
            <p><strong>Idoso:</strong> {subject}</p>
            <p><strong>Data/Hora:</strong> {when}</p>
            <p><strong>⚠️ AÇÃO IMEDIATA NECESSÁRIA</strong></p>
            <p>Por favor, entre em contato com o idoso imediatamente ou acione serviços de emergência se necessário.</p>
        </div>
        <div class="footer">
            <p>Este é um email automático do sistema EVA - Assistente Virtual para Idosos</p>
            <p>Não responda a este email</p>
        </div>
    </div>
</body>
</html>"#,
        caregiver = caregiver_name,
        subject = subject_name,
        reason = reason,
        when = Local::now().format("%d/%m/%Y %H:%M"),
    )
}
