use tracing::info;

use send_emails_module::{
    one_click_unsubscribe_url, unsubscribe_mailto, SendEmailParams, SmtpEndpoint,
};

use crate::types::{Inbox, SendJob};

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

/// Delivery failures split the way the outcome recorder needs them: permanent
/// failures are terminal, transient ones feed the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Seam between the dispatch loop and the transport. Exactly one network send
/// attempt per invocation; retry policy lives in the loop.
pub trait DeliveryExecutor {
    fn send(&self, inbox: &Inbox, job: &SendJob) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Production executor: delivers through the job's selected inbox over
/// authenticated STARTTLS SMTP via `send_emails_module`.
#[derive(Debug, Clone)]
pub struct SmtpExecutor {
    app_base_url: String,
    unsubscribe_inbox: String,
}

impl SmtpExecutor {
    pub fn new(app_base_url: String, unsubscribe_inbox: String) -> Self {
        Self {
            app_base_url,
            unsubscribe_inbox,
        }
    }
}

impl DeliveryExecutor for SmtpExecutor {
    fn send(&self, inbox: &Inbox, job: &SendJob) -> Result<DeliveryReceipt, DeliveryError> {
        let params = SendEmailParams {
            smtp: SmtpEndpoint {
                host: inbox.smtp_host.clone(),
                port: inbox.smtp_port,
                username: inbox.username.clone(),
                password: inbox.password.clone(),
            },
            from_name: inbox.from_name.clone(),
            from_email: inbox.from_email.clone(),
            to: job.recipient_email.clone(),
            subject: job.subject.clone(),
            html_body: job.body_html.clone(),
            unsubscribe_url: one_click_unsubscribe_url(
                &self.app_base_url,
                &job.recipient_email,
                job.campaign_id,
            ),
            unsubscribe_mailto: unsubscribe_mailto(&self.unsubscribe_inbox, &job.recipient_email),
        };
        let response = send_emails_module::send_email(&params).map_err(|err| {
            if err.is_permanent() {
                DeliveryError::Permanent(err.to_string())
            } else {
                DeliveryError::Transient(err.to_string())
            }
        })?;
        Ok(DeliveryReceipt {
            message_id: response.message_id,
        })
    }
}

/// Renders nothing and transmits nothing; lets the whole pipeline run against
/// production data without sending mail.
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

impl DeliveryExecutor for DryRunExecutor {
    fn send(&self, inbox: &Inbox, job: &SendJob) -> Result<DeliveryReceipt, DeliveryError> {
        info!(
            "dry run: job {} to {} via inbox {} ({})",
            job.id, job.recipient_email, inbox.id, inbox.from_email
        );
        Ok(DeliveryReceipt {
            message_id: format!("<dry-run-{}@localhost>", job.id),
        })
    }
}
