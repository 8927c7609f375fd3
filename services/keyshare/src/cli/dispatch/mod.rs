use crate::cli::{
    actions::{server::Args, Action},
    commands,
};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use url::Url;

/// Parse repeated `lang=value` occurrences into a map.
fn parse_translations(matches: &clap::ArgMatches, name: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    if let Some(values) = matches.get_many::<String>(name) {
        for value in values {
            let Some((lang, text)) = value.split_once('=') else {
                bail!("malformed --{name} value {value:?}, expected lang=value");
            };
            if lang.trim().is_empty() || text.trim().is_empty() {
                bail!("malformed --{name} value {value:?}, expected lang=value");
            }
            map.insert(lang.trim().to_string(), text.trim().to_string());
        }
    }
    Ok(map)
}

fn string_list(matches: &clap::ArgMatches, name: &str) -> Vec<String> {
    matches
        .get_many::<String>(name)
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    commands::validate(matches).map_err(anyhow::Error::msg)?;

    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let db_type = matches
        .get_one::<String>(commands::ARG_DB_TYPE)
        .cloned()
        .unwrap_or_else(|| "postgres".to_string());
    let dsn = matches.get_one::<String>(commands::ARG_DSN).cloned();
    let irma_server = matches
        .get_one::<String>(commands::ARG_IRMA_SERVER)
        .cloned()
        .context("missing required argument: --irma-server")?;
    let session_lifetime_seconds = matches
        .get_one::<u64>(commands::ARG_SESSION_LIFETIME)
        .copied()
        .unwrap_or(900);
    let deletion_grace_days = matches
        .get_one::<i64>(commands::ARG_DELETION_GRACE)
        .copied()
        .unwrap_or(30);

    let login_email_base_urls =
        parse_translations(matches, commands::ARG_LOGIN_EMAIL_BASE_URL)?;
    for base_url in login_email_base_urls.values() {
        Url::parse(base_url)
            .with_context(|| format!("Invalid login email base URL: {base_url}"))?;
    }

    Ok(Action::Server(Args {
        port,
        db_type,
        dsn,
        irma_server,
        session_lifetime_seconds,
        deletion_grace_days,
        cors_allowed_origins: string_list(matches, commands::ARG_CORS_ALLOWED_ORIGIN),
        email_server: matches
            .get_one::<String>(commands::ARG_EMAIL_SERVER)
            .cloned()
            .filter(|server| !server.trim().is_empty()),
        default_language: matches
            .get_one::<String>(commands::ARG_DEFAULT_LANGUAGE)
            .cloned()
            .unwrap_or_else(|| "en".to_string()),
        login_email_base_urls,
        login_email_subjects: parse_translations(matches, commands::ARG_LOGIN_EMAIL_SUBJECT)?,
        email_removed_subjects: parse_translations(matches, commands::ARG_EMAIL_REMOVED_SUBJECT)?,
        account_removed_subjects: parse_translations(
            matches,
            commands::ARG_ACCOUNT_REMOVED_SUBJECT,
        )?,
        keyshare_attributes: string_list(matches, commands::ARG_KEYSHARE_ATTRIBUTE),
        email_attributes: string_list(matches, commands::ARG_EMAIL_ATTRIBUTE),
        static_path: matches.get_one::<String>(commands::ARG_STATIC_PATH).cloned(),
        production: matches.get_flag(commands::ARG_PRODUCTION),
    }))
}
