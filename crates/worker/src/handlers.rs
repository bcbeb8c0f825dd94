use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use taskflow::jobs::registry::RegistryError;
use taskflow::jobs::{HandlerError, HandlerRegistry, HandlerResult, Payload};

pub const SEND_EMAIL: &str = "send_email";
pub const EMAIL_SCHEMA: &str = "email.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub recipients: Vec<String>,
}

#[derive(Debug)]
pub enum MailError {
    /// Server unreachable, rate limited, etc. Worth retrying.
    Unavailable(String),
    /// Rejected for good (bad address, message refused).
    Rejected(String),
}

/// Outbound mail transport. The SMTP client lives outside this crate; the
/// worker only needs something that can hand a message off.
pub trait Mailer: Send + Sync + 'static {
    /// Returns a transport-assigned message id.
    fn send(&self, email: &EmailPayload) -> Result<String, MailError>;
}

/// Logs instead of delivering. Used when no transport is configured.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, email: &EmailPayload) -> Result<String, MailError> {
        let message_id = format!("<{}@taskflow.local>", Uuid::new_v4());
        tracing::info!(
            subject = %email.subject,
            recipients = ?email.recipients,
            body_bytes = email.body.len(),
            %message_id,
            "email handed off"
        );
        Ok(message_id)
    }
}

fn validate(email: &EmailPayload) -> Result<(), HandlerError> {
    if email.recipients.is_empty() {
        return Err(HandlerError::permanent("email has no recipients"));
    }
    if let Some(bad) = email
        .recipients
        .iter()
        .find(|r| r.trim().is_empty() || !r.contains('@'))
    {
        return Err(HandlerError::permanent(format!("invalid recipient {bad:?}")));
    }
    Ok(())
}

async fn send_email(mailer: Arc<dyn Mailer>, payload: Payload) -> HandlerResult {
    if payload.schema != EMAIL_SCHEMA {
        return Err(HandlerError::permanent(format!(
            "unsupported payload schema {:?}, expected {EMAIL_SCHEMA}",
            payload.schema
        )));
    }
    let email: EmailPayload = payload.decode()?;
    validate(&email)?;

    // transports block; keep them off the runtime threads
    let recipients = email.recipients.len();
    let sent = tokio::task::spawn_blocking(move || mailer.send(&email))
        .await
        .map_err(|e| HandlerError::transient(format!("mail task failed: {e}")))?;

    match sent {
        Ok(message_id) => Ok(Some(json!({
            "message_id": message_id,
            "recipients": recipients,
        }))),
        Err(MailError::Unavailable(msg)) => Err(HandlerError::transient(msg)),
        Err(MailError::Rejected(msg)) => Err(HandlerError::permanent(msg)),
    }
}

/// `send_email` runs under the pool's job timeout and slot count; it carries no
/// overrides of its own.
pub fn build_registry(mailer: Arc<dyn Mailer>) -> Result<Arc<HandlerRegistry>, RegistryError> {
    let mut registry = HandlerRegistry::builder();

    let handle = registry.register(SEND_EMAIL, move |payload, _ctx| {
        send_email(mailer.clone(), payload)
    });
    tracing::debug!(handler = handle.name(), "handler registered");

    registry.build()
}
