//! Outgoing mail for reset links, e-mail change confirmations and donation notices.
//!
//! Delivery is fire-and-forget: callers log a failed send and carry on.

use async_trait::async_trait;
use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use std::path::Path;
use std::time::Duration;

use crate::config::{EmailConfig, EmailTransportConfig};
use crate::errors::{Error, Result};

/// Plain-text message ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub subject: String,
    pub body: String,
}

impl Email {
    pub fn password_reset(tag: &str, link: &str, valid_for: Duration) -> Self {
        Self {
            subject: format!("Reset the admin password of {tag}"),
            body: format!(
                "Hello,\n\n\
                 Someone asked to reset the admin password of your site {tag}. \
                 If that was not you, ignore this message.\n\n\
                 Choose a new password here:\n{link}\n\n\
                 The link is valid for {}.\n",
                humantime::format_duration(valid_for)
            ),
        }
    }

    pub fn email_change(tag: &str, new_email: &str, link: &str, valid_for: Duration) -> Self {
        Self {
            subject: format!("Confirm the new admin e-mail of {tag}"),
            body: format!(
                "Hello,\n\n\
                 Please confirm that {new_email} should become the admin e-mail of {tag}:\n{link}\n\n\
                 The link is valid for {}.\n",
                humantime::format_duration(valid_for)
            ),
        }
    }

    pub fn unmatched_donation(amount: &str, from_name: &str, from_email: &str, transaction_id: &str, message: &str) -> Self {
        Self {
            subject: "Donation without a matching site".to_string(),
            body: format!(
                "A donation of {amount} from {from_name} <{from_email}> matched no active site.\n\n\
                 Transaction: {transaction_id}\n\
                 Message: {message}\n"
            ),
        }
    }
}

/// The mail boundary
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, email: &Email) -> Result<()>;
}

pub struct EmailService {
    transport: EmailTransport,
    from: Mailbox,
    reply_to: Option<Mailbox>,
}

enum EmailTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

fn parse_mailbox(value: &str, what: &str) -> Result<Mailbox> {
    value.parse::<Mailbox>().map_err(|e| Error::Internal {
        operation: format!("parse {what} email: {e}"),
    })
}

impl EmailService {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let transport = match &config.transport {
            EmailTransportConfig::Smtp {
                host,
                port,
                username,
                password,
                use_tls,
            } => {
                if !use_tls {
                    tracing::warn!("SMTP TLS is disabled - this is not recommended for production");
                }

                let smtp_builder = if *use_tls {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                } else {
                    Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host))
                }
                .map_err(|e| Error::Internal {
                    operation: format!("create SMTP transport: {e}"),
                })?
                .port(*port)
                .credentials(Credentials::new(username.clone(), password.clone()));

                EmailTransport::Smtp(smtp_builder.build())
            }
            EmailTransportConfig::File { path } => {
                let emails_dir = Path::new(path);
                std::fs::create_dir_all(emails_dir).map_err(|e| Error::Internal {
                    operation: format!("create emails directory: {e}"),
                })?;
                EmailTransport::File(AsyncFileTransport::<Tokio1Executor>::new(emails_dir))
            }
        };

        Ok(Self {
            transport,
            from: parse_mailbox(&format!("{} <{}>", config.from_name, config.from_email), "from")?,
            reply_to: config.reply_to.as_deref().map(|r| parse_mailbox(r, "reply-to")).transpose()?,
        })
    }
}

#[async_trait]
impl Mailer for EmailService {
    #[tracing::instrument(skip(self, email), fields(subject = %email.subject), err)]
    async fn send(&self, to: &str, email: &Email) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(to, "to")?)
            .subject(email.subject.as_str())
            .header(ContentType::TEXT_PLAIN);
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(reply_to.clone());
        }
        let message = builder.body(email.body.clone()).map_err(|e| Error::Internal {
            operation: format!("build email message: {e}"),
        })?;

        match &self.transport {
            EmailTransport::Smtp(smtp) => {
                smtp.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send SMTP email: {e}"),
                })?;
            }
            EmailTransport::File(file) => {
                file.send(message).await.map_err(|e| Error::Internal {
                    operation: format!("send file email: {e}"),
                })?;
            }
        }

        Ok(())
    }
}
