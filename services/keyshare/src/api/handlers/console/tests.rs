//! Console flow tests against the in-memory store and a stubbed
//! disclosure engine.

use axum::extract::{Extension, Path};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::email::{add_email, remove_email};
use super::login::{login_email, login_irma, login_token, login_token_candidates, verify_email};
use super::session::{check_session, logout};
use super::state::{ConsoleConfig, ConsoleState};
use super::types::{EmailLoginRequest, TokenLoginRequest};
use super::user::{delete_user, user_info, user_logs};
use crate::api::email::testing::RecordingSender;
use crate::api::email::{EmailConfig, EmailSender, Mailer};
use crate::db::{AccountDb, LogEventKind, MemoryAccountDb, StoreError, UserAccount, UserData};
use crate::disclosure::testing::{valid_disclosure, StubEngine};
use crate::disclosure::{ProofStatus, SessionResult, SessionStatus};
use crate::sessions::SessionStore;

const LOGIN_BASE_URL: &str = "https://account.example/login/";
const KEYSHARE_ATTRIBUTE: &str = "scheme.keyshare.user";
const EMAIL_ATTRIBUTE: &str = "scheme.email.email";

struct TestConsole {
    state: Arc<ConsoleState>,
    db: Arc<MemoryAccountDb>,
    engine: Arc<StubEngine>,
    sender: Arc<RecordingSender>,
}

fn console() -> TestConsole {
    console_with_lifetime(Duration::from_secs(60))
}

fn console_with_lifetime(lifetime: Duration) -> TestConsole {
    let db = Arc::new(MemoryAccountDb::new());
    let engine = Arc::new(StubEngine::new());
    let sender = Arc::new(RecordingSender::new());

    let mut base_urls = HashMap::new();
    base_urls.insert("en".to_string(), LOGIN_BASE_URL.to_string());
    let mailer = Mailer::new(
        Arc::clone(&sender) as Arc<dyn EmailSender>,
        EmailConfig::new("en".to_string()).with_login_base_urls(base_urls),
    );

    let config = ConsoleConfig::new()
        .with_session_lifetime_seconds(lifetime.as_secs().max(1))
        .with_keyshare_attributes(vec![KEYSHARE_ATTRIBUTE.to_string()])
        .with_email_attributes(vec![EMAIL_ATTRIBUTE.to_string()]);
    let mut state = ConsoleState::new(
        Arc::clone(&db) as Arc<dyn AccountDb>,
        Arc::clone(&engine) as Arc<dyn crate::disclosure::DisclosureEngine>,
        Some(mailer),
        config,
    );
    // Sub-second lifetimes for expiry tests.
    state.sessions = Arc::new(SessionStore::new(lifetime));

    TestConsole {
        state: Arc::new(state),
        db,
        engine,
        sender,
    }
}

async fn register(db: &MemoryAccountDb, username: &str) -> UserAccount {
    db.new_user(UserData {
        username: username.to_string(),
        language: "en".to_string(),
        coredata: vec![7; crate::db::COREDATA_LENGTH],
    })
    .await
    .expect("register user")
}

/// Mint an authenticated session directly, as the login flows would.
async fn authenticated_token(state: &ConsoleState, user_id: i64) -> String {
    let session = state.sessions.create().await;
    session.lock().await.user_id = Some(user_id);
    session.token().to_string()
}

fn cookie_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        COOKIE,
        format!("session={token}").parse().expect("cookie header"),
    );
    headers
}

fn set_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

fn session_token_from(response: &Response) -> String {
    let cookie = set_cookie(response).expect("session cookie is set");
    cookie
        .strip_prefix("session=")
        .and_then(|rest| rest.split(';').next())
        .expect("cookie value")
        .to_string()
}

async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn failed_disclosure(proof_status: ProofStatus) -> SessionResult {
    SessionResult {
        status: SessionStatus::Done,
        proof_status,
        disclosed: Vec::new(),
    }
}

#[tokio::test]
async fn irma_login_logs_the_user_in() {
    let console = console();
    let account = register(&console.db, "alice").await;

    let response = login_irma(Extension(Arc::clone(&console.state)))
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        console.engine.last_request_attributes(),
        vec![KEYSHARE_ATTRIBUTE.to_string()]
    );
    let token = session_token_from(&response);
    let qr = body_json(response).await;
    assert_eq!(qr["irmaqr"], "disclosing");

    console
        .engine
        .fire(valid_disclosure("alice", KEYSHARE_ATTRIBUTE))
        .await;

    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert_eq!(body_json(response).await, serde_json::json!("ok"));

    // The login shows up in the account history.
    let logs = console.db.logs(account.id, 0, 11).await.expect("logs");
    assert!(logs
        .iter()
        .any(|entry| entry.event == LogEventKind::IrmaSession));
}

#[tokio::test]
async fn invalid_proofs_are_parked_until_checksession() {
    let console = console();

    let response = login_irma(Extension(Arc::clone(&console.state)))
        .await
        .into_response();
    let token = session_token_from(&response);

    console
        .engine
        .fire(failed_disclosure(ProofStatus::Invalid))
        .await;

    // First call surfaces the parked error even though the session never
    // authenticated; the second reports the anonymous session as expired.
    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "INVALID_PROOFS");

    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert_eq!(body_json(response).await, serde_json::json!("expired"));
}

#[tokio::test]
async fn unknown_disclosed_user_is_reported_as_unregistered() {
    let console = console();

    let response = login_irma(Extension(Arc::clone(&console.state)))
        .await
        .into_response();
    let token = session_token_from(&response);

    console
        .engine
        .fire(valid_disclosure("nobody", KEYSHARE_ATTRIBUTE))
        .await;

    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "USER_NOT_REGISTERED");
}

#[tokio::test]
async fn disclosure_after_session_expiry_is_dropped() {
    let console = console_with_lifetime(Duration::from_millis(50));
    register(&console.db, "late").await;

    let response = login_irma(Extension(Arc::clone(&console.state)))
        .await
        .into_response();
    let token = session_token_from(&response);

    tokio::time::sleep(Duration::from_millis(80)).await;
    console
        .engine
        .fire(valid_disclosure("late", KEYSHARE_ATTRIBUTE))
        .await;

    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert_eq!(body_json(response).await, serde_json::json!("expired"));
}

#[tokio::test]
async fn email_login_round_trip_with_two_candidates() {
    let console = console();
    let bob = register(&console.db, "bob").await;
    register(&console.db, "carol").await;
    console.db.add_email(bob.id, "shared@x").await.expect("bind");
    let carol_id = console.db.user_id("carol").await.expect("carol id");
    console
        .db
        .add_email(carol_id, "shared@x")
        .await
        .expect("bind");

    let status = login_email(
        Extension(Arc::clone(&console.state)),
        Some(Json(EmailLoginRequest {
            email: "shared@x".to_string(),
            language: "en".to_string(),
        })),
    )
    .await
    .expect("send login email");
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Pull the token out of the recorded login link.
    let messages = console.sender.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].template, "login_link");
    let payload: serde_json::Value =
        serde_json::from_str(&messages[0].payload_json).expect("payload");
    let token = payload["token_url"]
        .as_str()
        .and_then(|url| url.strip_prefix(LOGIN_BASE_URL))
        .expect("token in login url")
        .to_string();

    let Json(mut candidates) = login_token_candidates(
        Extension(Arc::clone(&console.state)),
        Some(Json(token.clone())),
    )
    .await
    .expect("candidates");
    candidates.sort_by(|a, b| a.username.cmp(&b.username));
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0].username, "bob");
    assert_eq!(candidates[1].username, "carol");

    let response = login_token(
        Extension(Arc::clone(&console.state)),
        Some(Json(TokenLoginRequest {
            token: token.clone(),
            username: "bob".to_string(),
        })),
    )
    .await
    .expect("token login")
    .into_response();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let session_token = session_token_from(&response);

    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&session_token),
    )
    .await;
    assert_eq!(body_json(response).await, serde_json::json!("ok"));

    // The token was consumed by the successful login.
    let reuse = login_token(
        Extension(Arc::clone(&console.state)),
        Some(Json(TokenLoginRequest {
            token,
            username: "bob".to_string(),
        })),
    )
    .await;
    assert!(matches!(reuse, Err(crate::api::error::ApiError::UserNotFound)));
}

#[tokio::test]
async fn email_login_refuses_unknown_addresses() {
    let console = console();
    register(&console.db, "dave").await;

    let result = login_email(
        Extension(Arc::clone(&console.state)),
        Some(Json(EmailLoginRequest {
            email: "unknown@x".to_string(),
            language: "en".to_string(),
        })),
    )
    .await;
    assert!(matches!(result, Err(crate::api::error::ApiError::EmailNotFound)));
    assert!(console.sender.messages().is_empty());
}

#[tokio::test]
async fn email_login_is_disabled_without_mailer() {
    let mut console = console();
    let state = Arc::get_mut(&mut console.state).expect("sole reference");
    state.mailer = None;

    let result = login_email(
        Extension(Arc::clone(&console.state)),
        Some(Json(EmailLoginRequest {
            email: "a@x".to_string(),
            language: "en".to_string(),
        })),
    )
    .await;
    assert!(matches!(
        result,
        Err(crate::api::error::ApiError::Internal(_))
    ));
}

#[tokio::test]
async fn verification_token_binds_email_and_logs_in() {
    let console = console();
    let account = register(&console.db, "alice").await;
    console
        .db
        .add_email_verification(&account, "a@x", "tok1")
        .await
        .expect("issue token");

    let response = verify_email(
        Extension(Arc::clone(&console.state)),
        Some(Json("tok1".to_string())),
    )
    .await
    .expect("verify")
    .into_response();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let token = session_token_from(&response);

    let response = user_info(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await
    .expect("user info")
    .into_response();
    let info = body_json(response).await;
    assert_eq!(info["username"], "alice");
    assert_eq!(info["emails"][0]["email"], "a@x");
    assert_eq!(info["emails"][0]["delete_in_progress"], false);

    let second = verify_email(
        Extension(Arc::clone(&console.state)),
        Some(Json("tok1".to_string())),
    )
    .await;
    assert!(matches!(
        second,
        Err(crate::api::error::ApiError::TokenNotFound)
    ));
}

#[tokio::test]
async fn authenticated_endpoints_require_a_session() {
    let console = console();
    let result = user_info(Extension(Arc::clone(&console.state)), HeaderMap::new()).await;
    assert!(matches!(
        result,
        Err(crate::api::error::ApiError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn authenticated_success_refreshes_the_cookie() {
    let console = console();
    let account = register(&console.db, "fresh").await;
    let token = authenticated_token(&console.state, account.id).await;

    let response = user_info(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await
    .expect("user info")
    .into_response();
    let cookie = set_cookie(&response).expect("refreshed cookie");
    assert!(cookie.starts_with(&format!("session={token}")));
    assert!(cookie.contains("Max-Age=60"));
    assert!(cookie.contains("HttpOnly"));
    assert!(!cookie.contains("Secure"));
}

#[tokio::test]
async fn log_pages_hold_eleven_entries() {
    let console = console();
    let account = register(&console.db, "logged").await;
    for _ in 0..13 {
        console
            .db
            .add_log(account.id, LogEventKind::IrmaSession, None)
            .await
            .expect("log");
    }
    let token = authenticated_token(&console.state, account.id).await;

    let response = user_logs(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
        Path(0),
    )
    .await
    .expect("logs")
    .into_response();
    let page = body_json(response).await;
    assert_eq!(page.as_array().map(Vec::len), Some(11));

    let result = user_logs(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
        Path(-1),
    )
    .await;
    assert!(matches!(
        result,
        Err(crate::api::error::ApiError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn account_deletion_notifies_and_logs_out() {
    let console = console();
    let account = register(&console.db, "doomed").await;
    console.db.add_email(account.id, "a@x").await.expect("bind");
    console.db.add_email(account.id, "b@x").await.expect("bind");
    let token = authenticated_token(&console.state, account.id).await;

    let response = delete_user(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await
    .expect("delete")
    .into_response();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let cookie = set_cookie(&response).expect("cleared cookie");
    assert!(cookie.starts_with("session=;"));
    assert!(cookie.contains("Max-Age=-1"));

    // Both bound addresses got the notice.
    let recipients: Vec<String> = console
        .sender
        .messages()
        .into_iter()
        .map(|message| message.to)
        .collect();
    assert_eq!(recipients, vec!["a@x".to_string(), "b@x".to_string()]);

    // The account is soft-deleted and the session logged out.
    assert!(matches!(
        console.db.user("doomed").await,
        Err(StoreError::UserNotFound)
    ));
    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert_eq!(body_json(response).await, serde_json::json!("expired"));

    // A second deletion attempt fails: the coredata is already gone.
    let token = authenticated_token(&console.state, account.id).await;
    let result = delete_user(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert!(matches!(
        result,
        Err(crate::api::error::ApiError::UserNotFound)
    ));
}

#[tokio::test]
async fn disclosed_email_is_added_to_the_account() {
    let console = console();
    let account = register(&console.db, "grow").await;
    let token = authenticated_token(&console.state, account.id).await;

    let response = add_email(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await
    .expect("start disclosure")
    .into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        console.engine.last_request_attributes(),
        vec![EMAIL_ATTRIBUTE.to_string()]
    );

    console
        .engine
        .fire(valid_disclosure("new@x", EMAIL_ATTRIBUTE))
        .await;

    let info = console
        .db
        .user_information(account.id)
        .await
        .expect("info");
    assert_eq!(info.emails.len(), 1);
    assert_eq!(info.emails[0].email, "new@x");
    let logs = console.db.logs(account.id, 0, 11).await.expect("logs");
    assert!(logs
        .iter()
        .any(|entry| entry.event == LogEventKind::EmailAdded));
}

#[tokio::test]
async fn failed_email_disclosure_parks_invalid_proofs() {
    let console = console();
    let account = register(&console.db, "still-here").await;
    let token = authenticated_token(&console.state, account.id).await;

    add_email(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await
    .expect("start disclosure");
    console
        .engine
        .fire(failed_disclosure(ProofStatus::Invalid))
        .await;

    // The parked error wins over "ok", then the session reads ok again.
    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    let body = body_json(response).await;
    assert_eq!(body["error"], "INVALID_PROOFS");
    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert_eq!(body_json(response).await, serde_json::json!("ok"));
}

#[tokio::test]
async fn email_removal_requires_an_active_binding() {
    let console = console();
    let account = register(&console.db, "trim").await;
    console.db.add_email(account.id, "keep@x").await.expect("bind");
    let token = authenticated_token(&console.state, account.id).await;

    let result = remove_email(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
        Some(Json("other@x".to_string())),
    )
    .await;
    assert!(matches!(
        result,
        Err(crate::api::error::ApiError::InvalidEmail)
    ));

    let response = remove_email(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
        Some(Json("keep@x".to_string())),
    )
    .await
    .expect("remove")
    .into_response();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let info = console
        .db
        .user_information(account.id)
        .await
        .expect("info");
    assert_eq!(info.emails[0].delete_in_progress, true);
    let notices: Vec<String> = console
        .sender
        .messages()
        .into_iter()
        .map(|message| message.to)
        .collect();
    assert_eq!(notices, vec!["keep@x".to_string()]);
}

#[tokio::test]
async fn logout_invalidates_and_clears_the_cookie() {
    let console = console();
    let account = register(&console.db, "leaving").await;
    let token = authenticated_token(&console.state, account.id).await;

    let response = logout(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await
    .into_response();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let cookie = set_cookie(&response).expect("cleared cookie");
    assert!(cookie.contains("Max-Age=-1"));

    let response = check_session(
        Extension(Arc::clone(&console.state)),
        cookie_headers(&token),
    )
    .await;
    assert_eq!(body_json(response).await, serde_json::json!("expired"));
}
