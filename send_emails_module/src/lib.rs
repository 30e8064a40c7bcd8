use std::time::Duration;

use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SMTP_TIMEOUT_SECS: u64 = 30;

/// SMTP endpoint and credentials for a single sending identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SendEmailParams {
    pub smtp: SmtpEndpoint,
    pub from_name: String,
    pub from_email: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    /// One-click HTTPS unsubscribe link, already parameterized by recipient.
    pub unsubscribe_url: String,
    /// mailto: fallback for clients without one-click support.
    pub unsubscribe_mailto: String,
}

#[derive(Debug, Clone)]
pub struct SendEmailResponse {
    pub message_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendEmailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("message build error: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

impl SendEmailError {
    /// Permanent failures must not be retried: malformed addresses, unbuildable
    /// messages, and SMTP permanent (5xx) rejections, which covers rejected
    /// authentication and permanently refused recipients.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Address(_) | Self::Message(_) => true,
            Self::Smtp(err) => err.is_permanent(),
        }
    }
}

#[derive(Debug, Clone)]
struct ListUnsubscribe(String);

impl Header for ListUnsubscribe {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

#[derive(Debug, Clone)]
struct ListUnsubscribePost;

impl Header for ListUnsubscribePost {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe-Post")
    }

    fn parse(_s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self)
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), "List-Unsubscribe=One-Click".to_string())
    }
}

/// Build the one-click unsubscribe link served by the dashboard app.
pub fn one_click_unsubscribe_url(app_base_url: &str, email: &str, campaign_id: i64) -> String {
    format!(
        "{}/u?e={}&c={}",
        app_base_url.trim_end_matches('/'),
        urlencoding::encode(email),
        campaign_id
    )
}

/// Build the mailto: unsubscribe fallback.
pub fn unsubscribe_mailto(unsubscribe_inbox: &str, email: &str) -> String {
    format!(
        "mailto:{}?subject=unsubscribe&body={}",
        unsubscribe_inbox,
        urlencoding::encode(email)
    )
}

/// Build the outgoing message and its Message-ID without transmitting.
pub fn build_message(params: &SendEmailParams) -> Result<(Message, String), SendEmailError> {
    let from_address: Address = params.from_email.parse()?;
    let from_name = params.from_name.trim();
    let from = Mailbox::new(
        (!from_name.is_empty()).then(|| from_name.to_string()),
        from_address,
    );
    let to = Mailbox::new(None, params.to.parse::<Address>()?);

    let domain = params
        .from_email
        .split_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or("localhost");
    let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(params.subject.clone())
        .date_now()
        .message_id(Some(message_id.clone()))
        .header(ListUnsubscribe(format!(
            "<{}>, <{}>",
            params.unsubscribe_mailto, params.unsubscribe_url
        )))
        .header(ListUnsubscribePost)
        .singlepart(SinglePart::html(params.html_body.clone()))?;

    Ok((message, message_id))
}

/// Transmit one message over authenticated STARTTLS SMTP. Exactly one network
/// send attempt per call; retry policy belongs to the caller.
pub fn send_email(params: &SendEmailParams) -> Result<SendEmailResponse, SendEmailError> {
    let (message, message_id) = build_message(params)?;

    let mailer = SmtpTransport::starttls_relay(&params.smtp.host)?
        .port(params.smtp.port)
        .credentials(Credentials::new(
            params.smtp.username.clone(),
            params.smtp.password.clone(),
        ))
        .timeout(Some(Duration::from_secs(SMTP_TIMEOUT_SECS)))
        .build();

    mailer.send(&message)?;
    Ok(SendEmailResponse { message_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> SendEmailParams {
        SendEmailParams {
            smtp: SmtpEndpoint {
                host: "smtp.example.com".to_string(),
                port: 587,
                username: "outreach@example.com".to_string(),
                password: "secret".to_string(),
            },
            from_name: "Outreach Team".to_string(),
            from_email: "outreach@example.com".to_string(),
            to: "prospect@example.net".to_string(),
            subject: "Quick question".to_string(),
            html_body: "<p>Hello there</p>".to_string(),
            unsubscribe_url: one_click_unsubscribe_url(
                "https://app.example.com",
                "prospect@example.net",
                7,
            ),
            unsubscribe_mailto: unsubscribe_mailto(
                "unsubscribe@example.com",
                "prospect@example.net",
            ),
        }
    }

    #[test]
    fn message_carries_compliance_headers() {
        let (message, message_id) = build_message(&sample_params()).expect("build");
        let rendered = String::from_utf8(message.formatted()).expect("utf8");

        assert!(rendered.contains("Outreach Team"));
        assert!(rendered.contains("<outreach@example.com>"));
        assert!(rendered.contains("To: prospect@example.net"));
        assert!(rendered.contains("Subject: Quick question"));
        assert!(rendered.contains("List-Unsubscribe: <mailto:unsubscribe@example.com"));
        assert!(rendered.contains("<https://app.example.com/u?e=prospect%40example.net&c=7>"));
        assert!(rendered.contains("List-Unsubscribe-Post: List-Unsubscribe=One-Click"));
        assert!(rendered.contains("Date: "));
        assert!(rendered.contains(&format!("Message-ID: {}", message_id)));
        assert!(rendered.contains("Hello there"));
    }

    #[test]
    fn message_ids_are_unique_per_build() {
        let params = sample_params();
        let (_, first) = build_message(&params).expect("first build");
        let (_, second) = build_message(&params).expect("second build");
        assert_ne!(first, second);
        assert!(first.ends_with("@example.com>"));
    }

    #[test]
    fn empty_from_name_omits_display_name() {
        let mut params = sample_params();
        params.from_name = String::new();
        let (message, _) = build_message(&params).expect("build");
        let rendered = String::from_utf8(message.formatted()).expect("utf8");
        assert!(rendered.contains("From: outreach@example.com"));
    }

    #[test]
    fn malformed_recipient_is_permanent() {
        let mut params = sample_params();
        params.to = "not-an-address".to_string();
        let err = build_message(&params).expect_err("should fail");
        assert!(err.is_permanent());
    }

    #[test]
    fn unsubscribe_url_encodes_recipient() {
        let url = one_click_unsubscribe_url("https://app.example.com/", "a+b@example.net", 3);
        assert_eq!(url, "https://app.example.com/u?e=a%2Bb%40example.net&c=3");
    }
}
