//! # Keyshare account server
//!
//! Server-side half of an attribute-based identity keyshare scheme. Clients
//! hold only part of their secret; completing a cryptographic operation
//! requires this server, which gates every attempt behind a PIN with
//! exponential backoff. Around that sits the account lifecycle (soft
//! deletion with a grace delay, email bindings with restore semantics,
//! single-use email tokens) and a self-service account console.
//!
//! ## PIN gating
//!
//! A PIN attempt must first be *reserved*: one conditional update checks
//! the block deadline, bumps the failure counter, and computes the next
//! deadline. The first `MAX_PIN_TRIES - 1` failures are free; from then on
//! the block starts at thirty seconds and doubles per failure. A successful
//! check clears the counter.
//!
//! ## Account console
//!
//! The console authenticates either through an attribute-disclosure session
//! (the external engine posts its result back while the frontend polls
//! `/checksession`) or through an emailed one-time login link. Sessions are
//! in-memory, cookie-bound, and swept periodically; errors raised by
//! asynchronous disclosure callbacks are parked in the session until the
//! frontend picks them up.

pub mod api;
pub mod cli;
pub mod db;
pub mod disclosure;
pub mod sessions;

pub const GIT_COMMIT_HASH: &str = match option_env!("GIT_COMMIT_HASH") {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in builds without commit metadata
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
