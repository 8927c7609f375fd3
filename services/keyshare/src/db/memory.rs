//! In-memory account store.
//!
//! Used by the test suite and selectable at startup for local development.
//! One async mutex guards the whole state, which makes every operation
//! trivially serialisable and therefore at least as strict as the Postgres
//! contracts. Transactions take the lock for their whole lifetime and keep
//! a snapshot for rollback.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    AccountDb, AccountTx, LogEntry, LogEventKind, LoginCandidate, PinAttempt, StoreError,
    UserAccount, UserData, UserEmail, UserInformation, BACKOFF_START, COREDATA_LENGTH,
    EMAIL_LOGIN_VALIDITY_SECS, EMAIL_VERIFICATION_VALIDITY_SECS, MAX_PIN_TRIES,
};

#[derive(Clone, Debug)]
struct MemoryUser {
    id: i64,
    username: String,
    language: String,
    coredata: Option<Vec<u8>>,
    last_seen: i64,
    pin_counter: i32,
    pin_block_date: i64,
    delete_on: Option<i64>,
}

#[derive(Clone, Debug)]
struct MemoryEmail {
    user_id: i64,
    email: String,
    delete_on: Option<i64>,
}

impl MemoryEmail {
    fn active(&self, now: i64) -> bool {
        self.delete_on.is_none_or(|delete_on| delete_on >= now)
    }
}

#[derive(Clone, Debug)]
struct VerificationToken {
    email: String,
    user_id: i64,
    expiry: i64,
}

#[derive(Clone, Debug)]
struct LoginToken {
    email: String,
    expiry: i64,
}

#[derive(Clone, Debug)]
struct MemoryLog {
    seq: i64,
    user_id: i64,
    time: i64,
    event: LogEventKind,
    param: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    next_user_id: i64,
    next_log_seq: i64,
    users: HashMap<i64, MemoryUser>,
    emails: Vec<MemoryEmail>,
    verification_tokens: HashMap<String, VerificationToken>,
    login_tokens: HashMap<String, LoginToken>,
    logs: Vec<MemoryLog>,
}

impl MemoryState {
    fn set_seen(&mut self, user_id: i64) -> Result<(), StoreError> {
        let user = self.users.get_mut(&user_id).ok_or(StoreError::UserNotFound)?;
        user.last_seen = Utc::now().timestamp();
        Ok(())
    }

    fn add_email(&mut self, user_id: i64, email: &str) {
        if let Some(existing) = self
            .emails
            .iter_mut()
            .find(|e| e.user_id == user_id && e.email == email)
        {
            existing.delete_on = None;
            return;
        }
        self.emails.push(MemoryEmail {
            user_id,
            email: email.to_string(),
            delete_on: None,
        });
    }

    fn verify_email_token(&mut self, token: &str) -> Result<i64, StoreError> {
        let now = Utc::now().timestamp();
        let (user_id, email) = match self.verification_tokens.get(token) {
            Some(entry) if entry.expiry >= now => (entry.user_id, entry.email.clone()),
            _ => return Err(StoreError::TokenNotFound),
        };
        self.add_email(user_id, &email);
        self.verification_tokens.remove(token);
        Ok(user_id)
    }

    fn add_email_login_token(&mut self, email: &str, token: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        if !self.emails.iter().any(|e| e.email == email && e.active(now)) {
            return Err(StoreError::EmailNotFound);
        }
        self.login_tokens.insert(
            token.to_string(),
            LoginToken {
                email: email.to_string(),
                expiry: now + EMAIL_LOGIN_VALIDITY_SECS,
            },
        );
        Ok(())
    }

    fn try_user_login_token(&mut self, token: &str, username: &str) -> Result<i64, StoreError> {
        let now = Utc::now().timestamp();
        let email = match self.login_tokens.get(token) {
            Some(entry) if entry.expiry >= now => entry.email.clone(),
            _ => return Err(StoreError::UserNotFound),
        };
        let user_id = self
            .users
            .values()
            .find(|user| {
                user.username == username
                    && self
                        .emails
                        .iter()
                        .any(|e| e.user_id == user.id && e.email == email && e.active(now))
            })
            .map(|user| user.id)
            .ok_or(StoreError::UserNotFound)?;
        if self.login_tokens.remove(token).is_none() {
            return Err(anyhow!("login token vanished during redemption").into());
        }
        Ok(user_id)
    }
}

#[derive(Default)]
pub struct MemoryAccountDb {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAccountDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountDb for MemoryAccountDb {
    async fn new_user(&self, data: UserData) -> Result<UserAccount, StoreError> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|u| u.username == data.username) {
            return Err(StoreError::UserAlreadyExists);
        }
        state.next_user_id += 1;
        let id = state.next_user_id;
        state.users.insert(
            id,
            MemoryUser {
                id,
                username: data.username.clone(),
                language: data.language.clone(),
                coredata: Some(data.coredata.clone()),
                last_seen: Utc::now().timestamp(),
                pin_counter: 0,
                pin_block_date: 0,
                delete_on: None,
            },
        );
        Ok(UserAccount { id, data })
    }

    async fn user(&self, username: &str) -> Result<UserAccount, StoreError> {
        let state = self.state.lock().await;
        let user = state
            .users
            .values()
            .find(|u| u.username == username && u.coredata.is_some())
            .ok_or(StoreError::UserNotFound)?;
        let coredata = user.coredata.clone().unwrap_or_default();
        if coredata.len() != COREDATA_LENGTH {
            return Err(StoreError::InvalidRecord);
        }
        Ok(UserAccount {
            id: user.id,
            data: UserData {
                username: user.username.clone(),
                language: user.language.clone(),
                coredata,
            },
        })
    }

    async fn update_user(&self, account: &UserAccount) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&account.id)
            .ok_or(StoreError::UserNotFound)?;
        user.username = account.data.username.clone();
        user.language = account.data.language.clone();
        user.coredata = Some(account.data.coredata.clone());
        Ok(())
    }

    async fn user_id(&self, username: &str) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        state
            .users
            .values()
            .find(|u| u.username == username && u.coredata.is_some())
            .map(|u| u.id)
            .ok_or(StoreError::UserNotFound)
    }

    async fn reserve_pincheck(&self, account: &UserAccount) -> Result<PinAttempt, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now().timestamp();
        let user = state
            .users
            .get_mut(&account.id)
            .filter(|u| u.coredata.is_some())
            .ok_or(StoreError::UserNotFound)?;

        if user.pin_block_date > now {
            return Ok(PinAttempt {
                allowed: false,
                tries_remaining: 0,
                wait_seconds: (user.pin_block_date - now).max(0),
            });
        }

        // Mirrors the conditional update: the exponent uses the counter
        // before the increment, and the constant offset keeps a one second
        // grace window once a block elapses.
        let exponent = u32::try_from((user.pin_counter - (MAX_PIN_TRIES - 2)).max(0))
            .unwrap_or(u32::MAX)
            .min(40);
        user.pin_counter += 1;
        user.pin_block_date = (now - 1 - BACKOFF_START) + BACKOFF_START * (1_i64 << exponent);

        Ok(PinAttempt {
            allowed: true,
            tries_remaining: (MAX_PIN_TRIES - user.pin_counter).max(0),
            wait_seconds: (user.pin_block_date - now).max(0),
        })
    }

    async fn clear_pincheck(&self, account: &UserAccount) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&account.id)
            .ok_or(StoreError::UserNotFound)?;
        user.pin_counter = 0;
        user.pin_block_date = 0;
        Ok(())
    }

    async fn set_seen(&self, user_id: i64) -> Result<(), StoreError> {
        self.state.lock().await.set_seen(user_id)
    }

    async fn add_log(
        &self,
        user_id: i64,
        event: LogEventKind,
        param: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let encoded = match param {
            Some(value) => Some(
                serde_json::to_string(&value)
                    .map_err(|err| anyhow!("failed to encode log parameter: {err}"))?,
            ),
            None => None,
        };
        let mut state = self.state.lock().await;
        state.next_log_seq += 1;
        let seq = state.next_log_seq;
        state.logs.push(MemoryLog {
            seq,
            user_id,
            time: Utc::now().timestamp(),
            event,
            param: encoded,
        });
        Ok(())
    }

    async fn add_email_verification(
        &self,
        account: &UserAccount,
        email: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.verification_tokens.insert(
            token.to_string(),
            VerificationToken {
                email: email.to_string(),
                user_id: account.id,
                expiry: Utc::now().timestamp() + EMAIL_VERIFICATION_VALIDITY_SECS,
            },
        );
        Ok(())
    }

    async fn user_information(&self, user_id: i64) -> Result<UserInformation, StoreError> {
        let state = self.state.lock().await;
        let now = Utc::now().timestamp();
        let user = state.users.get(&user_id).ok_or(StoreError::UserNotFound)?;
        let emails = state
            .emails
            .iter()
            .filter(|e| e.user_id == user_id && e.active(now))
            .map(|e| UserEmail {
                email: e.email.clone(),
                delete_in_progress: e.delete_on.is_some(),
            })
            .collect();
        Ok(UserInformation {
            username: user.username.clone(),
            language: user.language.clone(),
            delete_in_progress: user.coredata.is_none(),
            emails,
        })
    }

    async fn logs(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut entries: Vec<&MemoryLog> = state
            .logs
            .iter()
            .filter(|log| log.user_id == user_id)
            .collect();
        entries.sort_by(|a, b| b.time.cmp(&a.time).then(b.seq.cmp(&a.seq)));
        Ok(entries
            .into_iter()
            .skip(usize::try_from(offset.max(0)).unwrap_or(0))
            .take(usize::try_from(limit.max(0)).unwrap_or(0))
            .map(|log| LogEntry {
                timestamp: log.time,
                event: log.event,
                param: log.param.clone(),
            })
            .collect())
    }

    async fn add_email(&self, user_id: i64, email: &str) -> Result<(), StoreError> {
        self.state.lock().await.add_email(user_id, email);
        Ok(())
    }

    async fn remove_email(
        &self,
        user_id: i64,
        email: &str,
        delay: chrono::Duration,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let entry = state
            .emails
            .iter_mut()
            .find(|e| e.user_id == user_id && e.email == email && e.delete_on.is_none())
            .ok_or_else(|| anyhow!("no active email binding to remove"))?;
        entry.delete_on = Some((Utc::now() + delay).timestamp());
        Ok(())
    }

    async fn remove_user(&self, user_id: i64, delay: chrono::Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let user = state
            .users
            .get_mut(&user_id)
            .filter(|u| u.coredata.is_some())
            .ok_or(StoreError::UserNotFound)?;
        user.coredata = None;
        user.delete_on = Some((Utc::now() + delay).timestamp());
        Ok(())
    }

    async fn login_token_candidates(
        &self,
        token: &str,
    ) -> Result<Vec<LoginCandidate>, StoreError> {
        let state = self.state.lock().await;
        let now = Utc::now().timestamp();
        let email = match state.login_tokens.get(token) {
            Some(entry) if entry.expiry >= now => entry.email.clone(),
            _ => return Err(StoreError::UserNotFound),
        };
        let candidates: Vec<LoginCandidate> = state
            .users
            .values()
            .filter(|user| {
                state
                    .emails
                    .iter()
                    .any(|e| e.user_id == user.id && e.email == email && e.active(now))
            })
            .map(|user| LoginCandidate {
                username: user.username.clone(),
                last_seen: user.last_seen,
            })
            .collect();
        if candidates.is_empty() {
            return Err(StoreError::UserNotFound);
        }
        Ok(candidates)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn AccountTx>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryAccountTx { guard, snapshot }))
    }
}

pub struct MemoryAccountTx {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: MemoryState,
}

#[async_trait]
impl AccountTx for MemoryAccountTx {
    async fn verify_email_token(&mut self, token: &str) -> Result<i64, StoreError> {
        self.guard.verify_email_token(token)
    }

    async fn add_email_login_token(&mut self, email: &str, token: &str) -> Result<(), StoreError> {
        self.guard.add_email_login_token(email, token)
    }

    async fn try_user_login_token(
        &mut self,
        token: &str,
        username: &str,
    ) -> Result<i64, StoreError> {
        self.guard.try_user_login_token(token, username)
    }

    async fn set_seen(&mut self, user_id: i64) -> Result<(), StoreError> {
        self.guard.set_seen(user_id)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        *self.guard = self.snapshot;
        Ok(())
    }
}
