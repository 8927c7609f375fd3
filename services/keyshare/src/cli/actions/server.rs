use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::api::email::{EmailConfig, LogEmailSender, Mailer};
use crate::api::{self, ConsoleConfig, ConsoleState};
use crate::db::{AccountDb, MemoryAccountDb, PostgresAccountDb};
use crate::disclosure::RemoteDisclosureEngine;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub db_type: String,
    pub dsn: Option<String>,
    pub irma_server: String,
    pub session_lifetime_seconds: u64,
    pub deletion_grace_days: i64,
    pub cors_allowed_origins: Vec<String>,
    pub email_server: Option<String>,
    pub default_language: String,
    pub login_email_base_urls: HashMap<String, String>,
    pub login_email_subjects: HashMap<String, String>,
    pub email_removed_subjects: HashMap<String, String>,
    pub account_removed_subjects: HashMap<String, String>,
    pub keyshare_attributes: Vec<String>,
    pub email_attributes: Vec<String>,
    pub static_path: Option<String>,
    pub production: bool,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the store connection or the listener fails.
pub async fn execute(args: Args) -> Result<()> {
    let db: Arc<dyn AccountDb> = match args.db_type.as_str() {
        "memory" => {
            info!("using the in-memory account store; state is lost on shutdown");
            Arc::new(MemoryAccountDb::new())
        }
        _ => {
            let dsn = args
                .dsn
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --dsn"))?;
            Arc::new(PostgresAccountDb::connect(&dsn).await?)
        }
    };

    let engine = Arc::new(RemoteDisclosureEngine::new(args.irma_server));

    let mailer = match args.email_server {
        Some(server) => {
            info!("email notices enabled, delivering through {server}");
            let config = EmailConfig::new(args.default_language.clone())
                .with_login_base_urls(args.login_email_base_urls)
                .with_login_subjects(args.login_email_subjects)
                .with_email_removed_subjects(args.email_removed_subjects)
                .with_account_removed_subjects(args.account_removed_subjects);
            Some(Mailer::new(Arc::new(LogEmailSender), config))
        }
        None => None,
    };

    let config = ConsoleConfig::new()
        .with_session_lifetime_seconds(args.session_lifetime_seconds)
        .with_deletion_grace_days(args.deletion_grace_days)
        .with_production(args.production)
        .with_default_language(args.default_language)
        .with_keyshare_attributes(args.keyshare_attributes)
        .with_email_attributes(args.email_attributes);

    let state = Arc::new(ConsoleState::new(db, engine, mailer, config));
    api::serve(args.port, state, args.cors_allowed_origins, args.static_path).await
}
