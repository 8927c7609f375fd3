//! Console configuration and shared handler state.

use std::sync::Arc;
use std::time::Duration;

use crate::api::email::Mailer;
use crate::db::AccountDb;
use crate::disclosure::DisclosureEngine;
use crate::sessions::SessionStore;

const DEFAULT_SESSION_LIFETIME_SECONDS: u64 = 15 * 60;
const DEFAULT_DELETION_GRACE_DAYS: i64 = 30;
const DEFAULT_LANGUAGE: &str = "en";

#[derive(Clone, Debug)]
pub struct ConsoleConfig {
    session_lifetime_seconds: u64,
    deletion_grace_days: i64,
    production: bool,
    default_language: String,
    keyshare_attributes: Vec<String>,
    email_attributes: Vec<String>,
}

impl ConsoleConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            session_lifetime_seconds: DEFAULT_SESSION_LIFETIME_SECONDS,
            deletion_grace_days: DEFAULT_DELETION_GRACE_DAYS,
            production: false,
            default_language: DEFAULT_LANGUAGE.to_string(),
            keyshare_attributes: Vec::new(),
            email_attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_session_lifetime_seconds(mut self, seconds: u64) -> Self {
        self.session_lifetime_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_deletion_grace_days(mut self, days: i64) -> Self {
        self.deletion_grace_days = days;
        self
    }

    #[must_use]
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    #[must_use]
    pub fn with_default_language(mut self, language: String) -> Self {
        self.default_language = language;
        self
    }

    #[must_use]
    pub fn with_keyshare_attributes(mut self, attributes: Vec<String>) -> Self {
        self.keyshare_attributes = attributes;
        self
    }

    #[must_use]
    pub fn with_email_attributes(mut self, attributes: Vec<String>) -> Self {
        self.email_attributes = attributes;
        self
    }

    #[must_use]
    pub fn session_lifetime_seconds(&self) -> u64 {
        self.session_lifetime_seconds
    }

    #[must_use]
    pub fn session_lifetime(&self) -> Duration {
        Duration::from_secs(self.session_lifetime_seconds)
    }

    #[must_use]
    pub fn deletion_grace(&self) -> chrono::Duration {
        chrono::Duration::days(self.deletion_grace_days)
    }

    /// The session cookie is only marked `Secure` in production.
    #[must_use]
    pub fn session_cookie_secure(&self) -> bool {
        self.production
    }

    #[must_use]
    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    #[must_use]
    pub fn keyshare_attributes(&self) -> &[String] {
        &self.keyshare_attributes
    }

    #[must_use]
    pub fn email_attributes(&self) -> &[String] {
        &self.email_attributes
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConsoleState {
    pub db: Arc<dyn AccountDb>,
    pub sessions: Arc<SessionStore>,
    pub engine: Arc<dyn DisclosureEngine>,
    /// `None` when no email server is configured; email-dependent endpoints
    /// refuse in that mode.
    pub mailer: Option<Mailer>,
    pub config: ConsoleConfig,
}

impl ConsoleState {
    #[must_use]
    pub fn new(
        db: Arc<dyn AccountDb>,
        engine: Arc<dyn DisclosureEngine>,
        mailer: Option<Mailer>,
        config: ConsoleConfig,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(config.session_lifetime()));
        Self {
            db,
            sessions,
            engine,
            mailer,
            config,
        }
    }
}
