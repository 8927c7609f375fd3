//! Account store capability.
//!
//! The store owns every persistent entity of the keyshare scheme: user
//! accounts with their PIN failure state, email bindings, single-use email
//! tokens, and the per-user log history. Two implementations exist: a
//! Postgres-backed one for production and an in-memory one for tests and
//! local development. Both honour the same atomicity contracts, most
//! importantly the PIN attempt reservation, which must behave as a single
//! conditional update per user row.

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use tracing::warn;
use utoipa::ToSchema;

pub mod memory;
pub mod postgres;

pub use memory::MemoryAccountDb;
pub use postgres::PostgresAccountDb;

/// Number of tries allowed on a PIN before exponential backoff starts.
pub const MAX_PIN_TRIES: i32 = 3;
/// Initial block duration in seconds once backoff kicks in.
pub const BACKOFF_START: i64 = 30;
/// How long an email verification token stays redeemable.
pub const EMAIL_VERIFICATION_VALIDITY_SECS: i64 = 24 * 60 * 60;
/// How long an email login token stays redeemable.
pub const EMAIL_LOGIN_VALIDITY_SECS: i64 = 60 * 60;
/// Expected length of the encrypted keyshare blob. Anything else in the
/// database is corruption.
pub const COREDATA_LENGTH: usize = 112;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user not found")]
    UserNotFound,
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("stored user record is invalid")]
    InvalidRecord,
    #[error("token not found or expired")]
    TokenNotFound,
    #[error("email address not found")]
    EmailNotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Mutable account fields. The persistent row id lives in [`UserAccount`]
/// and never leaves the store layer, so callers cannot re-resolve a user by
/// name and race a concurrent soft-delete.
#[derive(Clone, Debug)]
pub struct UserData {
    pub username: String,
    pub language: String,
    pub coredata: Vec<u8>,
}

/// Handle to a stored account, as returned by [`AccountDb::new_user`] and
/// [`AccountDb::user`].
#[derive(Clone, Debug)]
pub struct UserAccount {
    pub(crate) id: i64,
    pub data: UserData,
}

impl UserAccount {
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }
}

/// Outcome of one PIN attempt reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinAttempt {
    /// Whether the attempt may proceed at all.
    pub allowed: bool,
    /// Attempts left before the account blocks, zero when blocked.
    pub tries_remaining: i32,
    /// Seconds until the current or newly computed block expires.
    pub wait_seconds: i64,
}

/// Account history event kinds, stored as their integer value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    PinCheckSuccess,
    PinCheckFailed,
    PinCheckBlocked,
    IrmaSession,
    EmailAdded,
    EmailRemoved,
    AccountRemoved,
}

impl LogEventKind {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::PinCheckSuccess => 0,
            Self::PinCheckFailed => 1,
            Self::PinCheckBlocked => 2,
            Self::IrmaSession => 3,
            Self::EmailAdded => 4,
            Self::EmailRemoved => 5,
            Self::AccountRemoved => 6,
        }
    }

    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::PinCheckSuccess),
            1 => Some(Self::PinCheckFailed),
            2 => Some(Self::PinCheckBlocked),
            3 => Some(Self::IrmaSession),
            4 => Some(Self::EmailAdded),
            5 => Some(Self::EmailRemoved),
            6 => Some(Self::AccountRemoved),
            _ => None,
        }
    }
}

/// One page entry of a user's log history.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct LogEntry {
    pub timestamp: i64,
    pub event: LogEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

/// A user that could be logged in with a given email login token.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct LoginCandidate {
    pub username: String,
    pub last_seen: i64,
}

/// An email binding as shown in the account console.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct UserEmail {
    pub email: String,
    pub delete_in_progress: bool,
}

/// Account overview for the console `/user` endpoint.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct UserInformation {
    pub username: String,
    pub language: String,
    pub delete_in_progress: bool,
    pub emails: Vec<UserEmail>,
}

#[async_trait]
pub trait AccountDb: Send + Sync {
    /// Insert a fresh account with zeroed PIN state.
    async fn new_user(&self, data: UserData) -> Result<UserAccount, StoreError>;

    /// Look up an account by username. Soft-deleted rows (NULL coredata)
    /// are invisible here.
    async fn user(&self, username: &str) -> Result<UserAccount, StoreError>;

    /// Persist username, language and coredata of an existing account.
    async fn update_user(&self, account: &UserAccount) -> Result<(), StoreError>;

    /// Resolve a username to its id, ignoring soft-deleted rows.
    async fn user_id(&self, username: &str) -> Result<i64, StoreError>;

    /// Atomically reserve one PIN attempt: refuse when blocked or
    /// soft-deleted, otherwise bump the failure counter and move the block
    /// deadline in the same conditional update.
    async fn reserve_pincheck(&self, account: &UserAccount) -> Result<PinAttempt, StoreError>;

    /// Reset PIN failure state after a successful check.
    async fn clear_pincheck(&self, account: &UserAccount) -> Result<(), StoreError>;

    async fn set_seen(&self, user_id: i64) -> Result<(), StoreError>;

    async fn add_log(
        &self,
        user_id: i64,
        event: LogEventKind,
        param: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Issue an email verification token bound to this account.
    async fn add_email_verification(
        &self,
        account: &UserAccount,
        email: &str,
        token: &str,
    ) -> Result<(), StoreError>;

    async fn user_information(&self, user_id: i64) -> Result<UserInformation, StoreError>;

    /// Time-descending window over the user's log history.
    async fn logs(&self, user_id: i64, offset: i64, limit: i64)
        -> Result<Vec<LogEntry>, StoreError>;

    /// Bind an email to a user. Restores a binding scheduled for removal
    /// instead of duplicating it; idempotent for active bindings.
    async fn add_email(&self, user_id: i64, email: &str) -> Result<(), StoreError>;

    /// Schedule removal of an active email binding after `delay`.
    async fn remove_email(
        &self,
        user_id: i64,
        email: &str,
        delay: chrono::Duration,
    ) -> Result<(), StoreError>;

    /// Soft-delete the account: clear coredata and schedule the hard delete
    /// after `delay`. Fails when the account is already soft-deleted.
    async fn remove_user(&self, user_id: i64, delay: chrono::Duration) -> Result<(), StoreError>;

    /// Users owning the email of an unexpired login token.
    async fn login_token_candidates(&self, token: &str)
        -> Result<Vec<LoginCandidate>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Begin a transaction for the token-consumption flows.
    async fn begin(&self) -> Result<Box<dyn AccountTx>, StoreError>;
}

/// Operations that must share one database transaction so that a consumed
/// token and its dependent write land or roll back together.
#[async_trait]
pub trait AccountTx: Send {
    /// Redeem an email verification token: bind the email to its user and
    /// delete the token. A delete count other than one means a concurrent
    /// redemption already covered the primary effect and is only logged.
    async fn verify_email_token(&mut self, token: &str) -> Result<i64, StoreError>;

    /// Issue an email login token after checking the address is active for
    /// at least one user.
    async fn add_email_login_token(&mut self, email: &str, token: &str) -> Result<(), StoreError>;

    /// Redeem an email login token for the named user, deleting it. At most
    /// one caller can ever observe success for a given token.
    async fn try_user_login_token(&mut self, token: &str, username: &str)
        -> Result<i64, StoreError>;

    async fn set_seen(&mut self, user_id: i64) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Run `f` inside one store transaction: commit on success, roll back on
/// error. The closure receives the transaction and hands it back together
/// with the outcome. A failed commit surfaces as an error; no path leaves
/// the transaction open.
pub async fn with_tx<T, E, F, Fut>(db: &dyn AccountDb, f: F) -> Result<T, E>
where
    E: From<StoreError>,
    F: FnOnce(Box<dyn AccountTx>) -> Fut,
    Fut: Future<Output = (Box<dyn AccountTx>, Result<T, E>)>,
{
    let tx = db.begin().await.map_err(E::from)?;
    let (tx, result) = f(tx).await;
    match result {
        Ok(value) => {
            tx.commit().await.map_err(E::from)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("failed to roll back transaction: {rollback_err}");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_event_kind_values_round_trip() {
        for kind in [
            LogEventKind::PinCheckSuccess,
            LogEventKind::PinCheckFailed,
            LogEventKind::PinCheckBlocked,
            LogEventKind::IrmaSession,
            LogEventKind::EmailAdded,
            LogEventKind::EmailRemoved,
            LogEventKind::AccountRemoved,
        ] {
            assert_eq!(LogEventKind::from_i32(kind.as_i32()), Some(kind));
        }
        assert_eq!(LogEventKind::from_i32(99), None);
    }

    #[test]
    fn log_entry_serializes_event_as_snake_case() {
        let entry = LogEntry {
            timestamp: 1000,
            event: LogEventKind::IrmaSession,
            param: None,
        };
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["event"], "irma_session");
        assert!(value.get("param").is_none());
    }
}
