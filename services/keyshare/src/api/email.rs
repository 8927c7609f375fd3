//! Email delivery abstraction for console notices.
//!
//! The server builds per-language messages (login links, removal notices)
//! and hands them to an [`EmailSender`]. The sender decides how to deliver
//! (SMTP, API, etc.); the default for local development is
//! [`LogEmailSender`], which logs and returns `Ok(())`. Email-dependent
//! endpoints are disabled entirely when no email server is configured.

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub template: String,
    pub payload_json: String,
}

/// Email delivery abstraction.
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to = %message.to,
            template = %message.template,
            subject = %message.subject,
            payload = %message.payload_json,
            "email send stub"
        );
        Ok(())
    }
}

/// Per-language subjects and login link bases for the console notices.
#[derive(Clone, Debug)]
pub struct EmailConfig {
    default_language: String,
    login_subjects: HashMap<String, String>,
    login_base_urls: HashMap<String, String>,
    email_removed_subjects: HashMap<String, String>,
    account_removed_subjects: HashMap<String, String>,
}

impl EmailConfig {
    #[must_use]
    pub fn new(default_language: String) -> Self {
        let default = |text: &str| {
            let mut map = HashMap::new();
            map.insert("en".to_string(), text.to_string());
            map
        };
        Self {
            default_language,
            login_subjects: default("Log in to your account"),
            login_base_urls: HashMap::new(),
            email_removed_subjects: default("Email address removed"),
            account_removed_subjects: default("Account deletion in progress"),
        }
    }

    #[must_use]
    pub fn with_login_subjects(mut self, subjects: HashMap<String, String>) -> Self {
        self.login_subjects.extend(subjects);
        self
    }

    #[must_use]
    pub fn with_login_base_urls(mut self, base_urls: HashMap<String, String>) -> Self {
        self.login_base_urls.extend(base_urls);
        self
    }

    #[must_use]
    pub fn with_email_removed_subjects(mut self, subjects: HashMap<String, String>) -> Self {
        self.email_removed_subjects.extend(subjects);
        self
    }

    #[must_use]
    pub fn with_account_removed_subjects(mut self, subjects: HashMap<String, String>) -> Self {
        self.account_removed_subjects.extend(subjects);
        self
    }
}

/// Pick the translation for `language`, falling back to the default
/// language.
fn translate<'a>(
    map: &'a HashMap<String, String>,
    language: &str,
    default_language: &str,
) -> Result<&'a str> {
    map.get(language)
        .or_else(|| map.get(default_language))
        .map(String::as_str)
        .ok_or_else(|| anyhow!("no translation for language {language} or {default_language}"))
}

/// Builds console notices and hands them to the configured sender.
#[derive(Clone)]
pub struct Mailer {
    sender: Arc<dyn EmailSender>,
    config: EmailConfig,
}

impl Mailer {
    #[must_use]
    pub fn new(sender: Arc<dyn EmailSender>, config: EmailConfig) -> Self {
        Self { sender, config }
    }

    /// Send a one-time login link built from the per-language base URL.
    pub fn send_login_email(&self, to: &str, language: &str, token: &str) -> Result<()> {
        let base = translate(
            &self.config.login_base_urls,
            language,
            &self.config.default_language,
        )
        .context("no login email base url configured")?;
        let subject = translate(
            &self.config.login_subjects,
            language,
            &self.config.default_language,
        )?;
        self.send(to, subject, "login_link", json!({ "token_url": format!("{base}{token}") }))
    }

    /// Confirm a scheduled email removal to the address being removed.
    pub fn send_email_removed(&self, to: &str, username: &str, language: &str) -> Result<()> {
        let subject = translate(
            &self.config.email_removed_subjects,
            language,
            &self.config.default_language,
        )?;
        self.send(to, subject, "email_removed", json!({ "username": username }))
    }

    /// Notify every active address that account deletion was requested.
    pub fn send_account_removed(
        &self,
        recipients: &[String],
        username: &str,
        language: &str,
    ) -> Result<()> {
        let subject = translate(
            &self.config.account_removed_subjects,
            language,
            &self.config.default_language,
        )?;
        for to in recipients {
            self.send(to, subject, "account_removed", json!({ "username": username }))?;
        }
        Ok(())
    }

    fn send(
        &self,
        to: &str,
        subject: &str,
        template: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let message = EmailMessage {
            to: to.to_string(),
            subject: subject.to_string(),
            template: template.to_string(),
            payload_json: serde_json::to_string(&payload)
                .context("failed to serialize email payload")?,
        };
        self.sender.send(&message)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sender that records messages for assertions.
    #[derive(Default)]
    pub struct RecordingSender {
        messages: Mutex<Vec<EmailMessage>>,
    }

    impl RecordingSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn messages(&self) -> Vec<EmailMessage> {
            self.messages.lock().expect("sender lock").clone()
        }
    }

    impl EmailSender for RecordingSender {
        fn send(&self, message: &EmailMessage) -> Result<()> {
            self.messages.lock().expect("sender lock").push(message.clone());
            Ok(())
        }
    }
}
