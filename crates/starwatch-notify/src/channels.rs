//! Concrete notification channels: SMTP email, JSON webhook, and a local JSON-lines file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};
use starwatch_core::ChangeEvent;
use starwatch_storage::{classify_reqwest_error, classify_status, RetryDisposition};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{alert_body, alert_json, alert_subject, ChannelDeliveryError, ChannelKind, NotificationChannel, Payload};

fn payload_mismatch(kind: ChannelKind) -> ChannelDeliveryError {
    ChannelDeliveryError::Permanent(format!("{kind} channel received a payload it cannot send"))
}

/// STARTTLS SMTP relay. The password never leaves the `SecretString` except to
/// build the SMTP credentials.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl std::fmt::Debug for EmailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailChannel")
            .field("from", &self.from.to_string())
            .field("recipients", &self.to.len())
            .finish_non_exhaustive()
    }
}

impl EmailChannel {
    pub fn new(
        smtp_host: &str,
        smtp_port: u16,
        from: &str,
        to: &[String],
        username: String,
        password: SecretString,
        timeout: Duration,
    ) -> Result<Self, String> {
        let from: Mailbox = from
            .parse()
            .map_err(|err| format!("invalid sender address {from:?}: {err}"))?;
        let to = to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|err| format!("invalid recipient address {addr:?}: {err}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err("email channel has no recipients".to_string());
        }
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
            .map_err(|err| format!("smtp relay {smtp_host}: {err}"))?
            .port(smtp_port)
            .credentials(Credentials::new(
                username,
                password.expose_secret().to_string(),
            ))
            .timeout(Some(timeout))
            .build();
        Ok(Self {
            transport,
            from,
            to,
        })
    }

    fn message(&self, subject: &str, body: &str) -> Result<Message, ChannelDeliveryError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        builder
            .body(body.to_string())
            .map_err(|err| ChannelDeliveryError::Permanent(format!("building message: {err}")))
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn format(&self, events: &[ChangeEvent]) -> Payload {
        Payload::Text {
            subject: alert_subject(events.len()),
            body: alert_body(events),
        }
    }

    async fn deliver(&self, payload: &Payload) -> Result<(), ChannelDeliveryError> {
        let Payload::Text { subject, body } = payload else {
            return Err(payload_mismatch(self.kind()));
        };
        let message = self.message(subject, body)?;
        self.transport.send(message).await.map_err(|err| {
            if err.is_permanent() {
                ChannelDeliveryError::Permanent(err.to_string())
            } else {
                ChannelDeliveryError::Transient(err.to_string())
            }
        })?;
        debug!(recipients = self.to.len(), "alert email accepted by relay");
        Ok(())
    }
}

/// POSTs the JSON alert to an endpoint. The URL often embeds a token, so only the
/// host is ever logged.
#[derive(Debug)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: SecretString,
    host: String,
}

impl WebhookChannel {
    pub fn new(url: SecretString, timeout: Duration) -> Result<Self, String> {
        let parsed = reqwest::Url::parse(url.expose_secret())
            .map_err(|err| format!("invalid webhook url: {err}"))?;
        let host = parsed.host_str().unwrap_or("unknown").to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| format!("building webhook client: {err}"))?;
        Ok(Self { client, url, host })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    fn format(&self, events: &[ChangeEvent]) -> Payload {
        Payload::Json(alert_json(events, Utc::now()))
    }

    async fn deliver(&self, payload: &Payload) -> Result<(), ChannelDeliveryError> {
        let Payload::Json(value) = payload else {
            return Err(payload_mismatch(self.kind()));
        };
        let resp = self
            .client
            .post(self.url.expose_secret())
            .json(value)
            .send()
            .await
            .map_err(|err| {
                let disposition = classify_reqwest_error(&err);
                let reason = format!("posting to {}: {}", self.host, err.without_url());
                match disposition {
                    RetryDisposition::Retryable => ChannelDeliveryError::Transient(reason),
                    RetryDisposition::NonRetryable => ChannelDeliveryError::Permanent(reason),
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let reason = format!("{} answered http status {}", self.host, status.as_u16());
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => ChannelDeliveryError::Transient(reason),
                RetryDisposition::NonRetryable => ChannelDeliveryError::Permanent(reason),
            });
        }
        debug!(host = %self.host, status = status.as_u16(), "webhook accepted alert");
        Ok(())
    }
}

/// Appends each alert as one JSON line.
#[derive(Debug, Clone)]
pub struct FileChannel {
    path: PathBuf,
}

impl FileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_delivery_error(path: &Path, err: std::io::Error) -> ChannelDeliveryError {
    let reason = format!("{}: {err}", path.display());
    match err.kind() {
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput => {
            ChannelDeliveryError::Permanent(reason)
        }
        _ => ChannelDeliveryError::Transient(reason),
    }
}

#[async_trait]
impl NotificationChannel for FileChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::File
    }

    fn format(&self, events: &[ChangeEvent]) -> Payload {
        Payload::Json(alert_json(events, Utc::now()))
    }

    async fn deliver(&self, payload: &Payload) -> Result<(), ChannelDeliveryError> {
        let Payload::Json(value) = payload else {
            return Err(payload_mismatch(self.kind()));
        };
        let mut line = serde_json::to_string(value)
            .map_err(|err| ChannelDeliveryError::Permanent(err.to_string()))?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_delivery_error(parent, err))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| io_delivery_error(&self.path, err))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| io_delivery_error(&self.path, err))?;
        file.flush()
            .await
            .map_err(|err| io_delivery_error(&self.path, err))?;
        Ok(())
    }
}
