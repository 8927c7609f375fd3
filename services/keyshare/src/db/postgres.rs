//! Postgres-backed account store.
//!
//! Queries are raw SQL with bound parameters and a tracing span per
//! statement. The PIN attempt reservation is a single conditional
//! `UPDATE ... RETURNING`, so two concurrent attempts for the same user can
//! never both observe an unblocked row without one seeing the other's
//! counter increment.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{info_span, warn, Instrument, Span};

use super::{
    AccountDb, AccountTx, LogEntry, LogEventKind, LoginCandidate, PinAttempt, StoreError,
    UserAccount, UserData, UserEmail, UserInformation, BACKOFF_START, COREDATA_LENGTH,
    EMAIL_LOGIN_VALIDITY_SECS, EMAIL_VERIFICATION_VALIDITY_SECS, MAX_PIN_TRIES,
};

pub struct PostgresAccountDb {
    pool: PgPool,
}

impl PostgresAccountDb {
    /// Connect to the database behind `dsn`.
    ///
    /// # Errors
    /// Returns an error when the pool cannot be established.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_span(operation: &str, statement: &str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[async_trait]
impl AccountDb for PostgresAccountDb {
    async fn new_user(&self, data: UserData) -> Result<UserAccount, StoreError> {
        let query = r"
            INSERT INTO users (username, language, coredata, last_seen, pin_counter, pin_block_date)
            VALUES ($1, $2, $3, $4, 0, 0)
            RETURNING id
        ";
        let row = sqlx::query(query)
            .bind(&data.username)
            .bind(&data.language)
            .bind(&data.coredata)
            .bind(Utc::now().timestamp())
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        match row {
            Ok(row) => Ok(UserAccount {
                id: row.get("id"),
                data,
            }),
            Err(err) if is_unique_violation(&err) => Err(StoreError::UserAlreadyExists),
            Err(err) => Err(anyhow!(err).context("failed to insert user").into()),
        }
    }

    async fn user(&self, username: &str) -> Result<UserAccount, StoreError> {
        let query = r"
            SELECT id, username, language, coredata
            FROM users
            WHERE username = $1 AND coredata IS NOT NULL
        ";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to look up user")?
            .ok_or(StoreError::UserNotFound)?;

        let coredata: Vec<u8> = row.get("coredata");
        if coredata.len() != COREDATA_LENGTH {
            return Err(StoreError::InvalidRecord);
        }
        Ok(UserAccount {
            id: row.get("id"),
            data: UserData {
                username: row.get("username"),
                language: row.get("language"),
                coredata,
            },
        })
    }

    async fn update_user(&self, account: &UserAccount) -> Result<(), StoreError> {
        let query = "UPDATE users SET username = $1, language = $2, coredata = $3 WHERE id = $4";
        let result = sqlx::query(query)
            .bind(&account.data.username)
            .bind(&account.data.language)
            .bind(&account.data.coredata)
            .bind(account.id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to update user")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    async fn user_id(&self, username: &str) -> Result<i64, StoreError> {
        let query = "SELECT id FROM users WHERE username = $1 AND coredata IS NOT NULL";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to resolve username")?
            .ok_or(StoreError::UserNotFound)?;
        Ok(row.get("id"))
    }

    async fn reserve_pincheck(&self, account: &UserAccount) -> Result<PinAttempt, StoreError> {
        // The block check and the counter increment are one statement. The
        // block date expression sees the pre-increment counter, and the
        // constant offset keeps a one second grace window once a block
        // elapses.
        let now = Utc::now().timestamp();
        let query = r"
            UPDATE users
            SET pin_counter = pin_counter + 1,
                pin_block_date = $1 + $2 * 2 ^ GREATEST(0, pin_counter - $3)
            WHERE id = $4 AND pin_block_date <= $5 AND coredata IS NOT NULL
            RETURNING pin_counter, pin_block_date
        ";
        let row = sqlx::query(query)
            .bind(now - 1 - BACKOFF_START)
            .bind(BACKOFF_START)
            .bind(MAX_PIN_TRIES - 2)
            .bind(account.id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to reserve pin attempt")?;

        if let Some(row) = row {
            let counter: i32 = row.get("pin_counter");
            let block_date: i64 = row.get("pin_block_date");
            return Ok(PinAttempt {
                allowed: true,
                tries_remaining: (MAX_PIN_TRIES - counter).max(0),
                wait_seconds: (block_date - Utc::now().timestamp()).max(0),
            });
        }

        // No row updated: the account is either gone or currently blocked.
        let query = "SELECT pin_block_date FROM users WHERE id = $1 AND coredata IS NOT NULL";
        let row = sqlx::query(query)
            .bind(account.id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to read pin block date")?
            .ok_or(StoreError::UserNotFound)?;
        let block_date: i64 = row.get("pin_block_date");
        Ok(PinAttempt {
            allowed: false,
            tries_remaining: 0,
            wait_seconds: (block_date - Utc::now().timestamp()).max(0),
        })
    }

    async fn clear_pincheck(&self, account: &UserAccount) -> Result<(), StoreError> {
        let query = "UPDATE users SET pin_counter = 0, pin_block_date = 0 WHERE id = $1";
        let result = sqlx::query(query)
            .bind(account.id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to clear pin state")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    async fn set_seen(&self, user_id: i64) -> Result<(), StoreError> {
        let query = "UPDATE users SET last_seen = $1 WHERE id = $2";
        let result = sqlx::query(query)
            .bind(Utc::now().timestamp())
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to update last seen")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    async fn add_log(
        &self,
        user_id: i64,
        event: LogEventKind,
        param: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let encoded = match param {
            Some(value) => {
                Some(serde_json::to_string(&value).context("failed to encode log parameter")?)
            }
            None => None,
        };
        let query = r"
            INSERT INTO log_entry_records (time, event, param, user_id)
            VALUES ($1, $2, $3, $4)
        ";
        sqlx::query(query)
            .bind(Utc::now().timestamp())
            .bind(event.as_i32())
            .bind(encoded)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to append log entry")?;
        Ok(())
    }

    async fn add_email_verification(
        &self,
        account: &UserAccount,
        email: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO email_verification_tokens (token, email, user_id, expiry)
            VALUES ($1, $2, $3, $4)
        ";
        sqlx::query(query)
            .bind(token)
            .bind(email)
            .bind(account.id)
            .bind(Utc::now().timestamp() + EMAIL_VERIFICATION_VALIDITY_SECS)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert verification token")?;
        Ok(())
    }

    async fn user_information(&self, user_id: i64) -> Result<UserInformation, StoreError> {
        let query = r"
            SELECT username, language, (coredata IS NULL) AS delete_in_progress
            FROM users
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to fetch user information")?
            .ok_or(StoreError::UserNotFound)?;

        let mut info = UserInformation {
            username: row.get("username"),
            language: row.get("language"),
            delete_in_progress: row.get("delete_in_progress"),
            emails: Vec::new(),
        };

        let query = r"
            SELECT email, (delete_on IS NOT NULL) AS delete_in_progress
            FROM emails
            WHERE user_id = $1 AND (delete_on >= $2 OR delete_on IS NULL)
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .bind(Utc::now().timestamp())
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to fetch user emails")?;
        for row in rows {
            info.emails.push(UserEmail {
                email: row.get("email"),
                delete_in_progress: row.get("delete_in_progress"),
            });
        }
        Ok(info)
    }

    async fn logs(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let query = r"
            SELECT time, event, param
            FROM log_entry_records
            WHERE user_id = $1
            ORDER BY time DESC, id DESC
            OFFSET $2 LIMIT $3
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .bind(offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load log entries")?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let event: i32 = row.get("event");
            entries.push(LogEntry {
                timestamp: row.get("time"),
                event: LogEventKind::from_i32(event)
                    .ok_or_else(|| anyhow!("unknown log event value {event}"))?,
                param: row.get("param"),
            });
        }
        Ok(entries)
    }

    async fn add_email(&self, user_id: i64, email: &str) -> Result<(), StoreError> {
        // Restore a binding scheduled for removal before inserting a new row.
        let query = "UPDATE emails SET delete_on = NULL WHERE user_id = $1 AND email = $2";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(email)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to restore email")?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        let query = "INSERT INTO emails (user_id, email) VALUES ($1, $2)";
        sqlx::query(query)
            .bind(user_id)
            .bind(email)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert email")?;
        Ok(())
    }

    async fn remove_email(
        &self,
        user_id: i64,
        email: &str,
        delay: chrono::Duration,
    ) -> Result<(), StoreError> {
        let query = r"
            UPDATE emails
            SET delete_on = $3
            WHERE user_id = $1 AND email = $2 AND delete_on IS NULL
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(email)
            .bind((Utc::now() + delay).timestamp())
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to schedule email removal")?;
        if result.rows_affected() != 1 {
            return Err(anyhow!(
                "unexpected number of affected rows {} for email removal",
                result.rows_affected()
            )
            .into());
        }
        Ok(())
    }

    async fn remove_user(&self, user_id: i64, delay: chrono::Duration) -> Result<(), StoreError> {
        let query = r"
            UPDATE users
            SET coredata = NULL, delete_on = $2
            WHERE id = $1 AND coredata IS NOT NULL
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind((Utc::now() + delay).timestamp())
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to schedule user removal")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    async fn login_token_candidates(
        &self,
        token: &str,
    ) -> Result<Vec<LoginCandidate>, StoreError> {
        let query = r"
            SELECT username, last_seen
            FROM users
            INNER JOIN emails ON users.id = emails.user_id
            WHERE (emails.delete_on >= $2 OR emails.delete_on IS NULL)
              AND emails.email = (SELECT email FROM email_login_tokens WHERE token = $1 AND expiry >= $2)
        ";
        let rows = sqlx::query(query)
            .bind(token)
            .bind(Utc::now().timestamp())
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load login candidates")?;
        if rows.is_empty() {
            return Err(StoreError::UserNotFound);
        }
        Ok(rows
            .into_iter()
            .map(|row| LoginCandidate {
                username: row.get("username"),
                last_seen: row.get("last_seen"),
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .instrument(info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            ))
            .await
            .context("failed to acquire database connection")?;
        conn.ping()
            .instrument(info_span!(
                "db.ping",
                db.system = "postgresql",
                db.operation = "PING"
            ))
            .await
            .context("failed to ping database")?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn AccountTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;
        Ok(Box::new(PostgresAccountTx { tx }))
    }
}

pub struct PostgresAccountTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AccountTx for PostgresAccountTx {
    async fn verify_email_token(&mut self, token: &str) -> Result<i64, StoreError> {
        let query = r"
            SELECT user_id, email
            FROM email_verification_tokens
            WHERE token = $1 AND expiry >= $2
        ";
        let row = sqlx::query(query)
            .bind(token)
            .bind(Utc::now().timestamp())
            .fetch_optional(&mut *self.tx)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to look up verification token")?
            .ok_or(StoreError::TokenNotFound)?;
        let user_id: i64 = row.get("user_id");
        let email: String = row.get("email");

        let query = "UPDATE emails SET delete_on = NULL WHERE user_id = $1 AND email = $2";
        let restored = sqlx::query(query)
            .bind(user_id)
            .bind(&email)
            .execute(&mut *self.tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to restore email")?;
        if restored.rows_affected() != 1 {
            let query = "INSERT INTO emails (user_id, email) VALUES ($1, $2)";
            sqlx::query(query)
                .bind(user_id)
                .bind(&email)
                .execute(&mut *self.tx)
                .instrument(query_span("INSERT", query))
                .await
                .context("failed to insert email")?;
        }

        // The user-visible effect is complete; a surprising delete count
        // only means someone else redeemed concurrently.
        let query = "DELETE FROM email_verification_tokens WHERE token = $1";
        match sqlx::query(query)
            .bind(token)
            .execute(&mut *self.tx)
            .instrument(query_span("DELETE", query))
            .await
        {
            Ok(result) if result.rows_affected() != 1 => {
                warn!(
                    "unexpected number of deleted verification tokens: {}",
                    result.rows_affected()
                );
            }
            Ok(_) => {}
            Err(err) => warn!("failed to delete consumed verification token: {err}"),
        }
        Ok(user_id)
    }

    async fn add_email_login_token(&mut self, email: &str, token: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp();
        let query = r"
            SELECT 1 FROM emails
            WHERE email = $1 AND (delete_on >= $2 OR delete_on IS NULL)
            LIMIT 1
        ";
        let known = sqlx::query(query)
            .bind(email)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to check email address")?;
        if known.is_none() {
            return Err(StoreError::EmailNotFound);
        }

        let query = "INSERT INTO email_login_tokens (token, email, expiry) VALUES ($1, $2, $3)";
        let result = sqlx::query(query)
            .bind(token)
            .bind(email)
            .bind(now + EMAIL_LOGIN_VALIDITY_SECS)
            .execute(&mut *self.tx)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert login token")?;
        if result.rows_affected() != 1 {
            return Err(anyhow!(
                "unexpected number of affected rows {} on token insert",
                result.rows_affected()
            )
            .into());
        }
        Ok(())
    }

    async fn try_user_login_token(
        &mut self,
        token: &str,
        username: &str,
    ) -> Result<i64, StoreError> {
        let query = r"
            SELECT users.id
            FROM users
            INNER JOIN emails ON users.id = emails.user_id
            WHERE username = $1 AND (emails.delete_on >= $3 OR emails.delete_on IS NULL)
              AND email = (SELECT email FROM email_login_tokens WHERE token = $2 AND expiry >= $3)
        ";
        let row = sqlx::query(query)
            .bind(username)
            .bind(token)
            .bind(Utc::now().timestamp())
            .fetch_optional(&mut *self.tx)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to match login token")?
            .ok_or(StoreError::UserNotFound)?;
        let user_id: i64 = row.get("id");

        let query = "DELETE FROM email_login_tokens WHERE token = $1";
        let result = sqlx::query(query)
            .bind(token)
            .execute(&mut *self.tx)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete login token")?;
        if result.rows_affected() != 1 {
            return Err(anyhow!(
                "unexpected number of affected rows {} for token removal",
                result.rows_affected()
            )
            .into());
        }
        Ok(user_id)
    }

    async fn set_seen(&mut self, user_id: i64) -> Result<(), StoreError> {
        let query = "UPDATE users SET last_seen = $1 WHERE id = $2";
        let result = sqlx::query(query)
            .bind(Utc::now().timestamp())
            .bind(user_id)
            .execute(&mut *self.tx)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to update last seen")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .context("failed to commit transaction")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .context("failed to roll back transaction")?;
        Ok(())
    }
}
