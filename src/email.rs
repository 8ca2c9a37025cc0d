//! Email nudge delivery over SMTP. Strictly best-effort: callers log
//! failures and never roll back in-app delivery.

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::config::SmtpConfig;
use crate::traits::Notifier;
use crate::types::Notification;

pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl Mailer {
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid from_address '{}': {}", config.from_address, e))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(Self { transport, from })
    }

    fn subject_for(notification: &Notification) -> String {
        if notification.message.contains("CRITICAL") {
            "🔴 Critical task starting now".to_string()
        } else if notification.message.contains("URGENT") {
            "⚠️ Urgent task starting now".to_string()
        } else {
            "📋 Task starting now".to_string()
        }
    }

    fn body_html(notification: &Notification) -> String {
        format!(
            "<html><body>\
             <p style=\"font-size:16px\">{}</p>\
             <p style=\"color:#666\">Scheduled for {}</p>\
             </body></html>",
            notification.message,
            notification.scheduled_at.format("%H:%M UTC")
        )
    }
}

#[async_trait]
impl Notifier for Mailer {
    async fn deliver(&self, to: &str, notification: &Notification) -> anyhow::Result<()> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid recipient '{}': {}", to, e))?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(Self::subject_for(notification))
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(notification.message.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(Self::body_html(notification)),
                    ),
            )?;

        self.transport.send(email).await?;
        debug!(notification = %notification.id, "email nudge delivered");
        Ok(())
    }
}
