use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::client::extract_error_detail;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials available")]
    MissingCredentials,
    #[error("login rejected: {0}")]
    Rejected(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

/// An authenticated server session as returned by the login endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    pub token: String,
    pub expire: Option<OffsetDateTime>,
    pub user_id: i64,
    pub username: String,
    pub disk_usage: u64,
    pub storage_limit: u64,
}

impl UserSession {
    fn is_expired(&self) -> bool {
        match self.expire {
            Some(expire) => expire <= OffsetDateTime::now_utc(),
            None => false,
        }
    }
}

/// Guards every API call with a valid bearer token. A request made with a
/// missing or expired token waits for one login round-trip; concurrent
/// callers queue on the state lock, so only one login is in flight at a
/// time and the rest reuse its result.
pub struct AuthGate {
    http: Client,
    base_url: Url,
    state: Mutex<AuthState>,
}

#[derive(Default)]
struct AuthState {
    credentials: Option<Credentials>,
    session: Option<UserSession>,
}

impl AuthGate {
    pub fn new(base_url: &str) -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            state: Mutex::new(AuthState::default()),
        })
    }

    pub async fn set_credentials(&self, credentials: Credentials) {
        self.state.lock().await.credentials = Some(credentials);
    }

    /// Restores a previously persisted session, e.g. from the settings file.
    pub async fn restore_session(&self, session: UserSession) {
        self.state.lock().await.session = Some(session);
    }

    pub async fn session(&self) -> Option<UserSession> {
        self.state.lock().await.session.clone()
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.state.lock().await.credentials.clone()
    }

    pub async fn has_credentials(&self) -> bool {
        self.state.lock().await.credentials.is_some()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.credentials = None;
        state.session = None;
    }

    /// Returns a token valid at the time of the call, logging in first when
    /// the stored one is missing or expired.
    pub async fn valid_token(&self) -> Result<String, AuthError> {
        let mut state = self.state.lock().await;
        if let Some(session) = &state.session
            && !session.token.is_empty()
            && !session.is_expired()
        {
            return Ok(session.token.clone());
        }

        let credentials = state
            .credentials
            .clone()
            .ok_or(AuthError::MissingCredentials)?;
        match self.request_login(&credentials).await {
            Ok(session) => {
                let token = session.token.clone();
                state.session = Some(session);
                Ok(token)
            }
            Err(err) => {
                // a rejected login means the stored credentials are stale
                if matches!(err, AuthError::Rejected(_)) {
                    state.credentials = None;
                    state.session = None;
                }
                Err(err)
            }
        }
    }

    /// Explicit login with fresh credentials; stores them for later refresh.
    pub async fn login(&self, login: &str, password: &str) -> Result<UserSession, AuthError> {
        let credentials = Credentials {
            login: login.to_string(),
            password: password.to_string(),
        };
        let mut state = self.state.lock().await;
        let session = self.request_login(&credentials).await?;
        state.credentials = Some(credentials);
        state.session = Some(session.clone());
        Ok(session)
    }

    async fn request_login(&self, credentials: &Credentials) -> Result<UserSession, AuthError> {
        let url = self.base_url.join("/v1/auth/login")?;
        debug!(url = %url, login = %credentials.login, "logging in");
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "login": credentials.login,
                "password": credentials.password,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = extract_error_detail(&body);
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
                return Err(AuthError::Rejected(detail));
            }
            return Err(AuthError::Rejected(format!("{status}: {detail}")));
        }

        let payload: LoginResponse = response.json().await?;
        let expire = payload.session.expire.as_deref().and_then(|value| {
            let parsed = OffsetDateTime::parse(value, &Rfc3339).ok();
            if parsed.is_none() {
                warn!(value, "unparsable token expiry, treating as non-expiring");
            }
            parsed
        });
        Ok(UserSession {
            token: payload.session.token,
            expire,
            user_id: payload.id,
            username: payload.username,
            disk_usage: payload.disk_usage,
            storage_limit: payload.storage_limit,
        })
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    session: LoginSession,
    #[serde(default)]
    id: i64,
    #[serde(default)]
    username: String,
    #[serde(default)]
    disk_usage: u64,
    #[serde(default)]
    storage_limit: u64,
}

#[derive(Debug, Deserialize)]
struct LoginSession {
    token: String,
    #[serde(default)]
    expire: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(token: &str, expire: Option<OffsetDateTime>) -> UserSession {
        UserSession {
            token: token.to_string(),
            expire,
            user_id: 7,
            username: "tester".to_string(),
            disk_usage: 0,
            storage_limit: 1024,
        }
    }

    #[tokio::test]
    async fn returns_restored_token_while_valid() {
        let gate = AuthGate::new("http://localhost").unwrap();
        gate.restore_session(session(
            "token-1",
            Some(OffsetDateTime::now_utc() + time::Duration::hours(1)),
        ))
        .await;

        assert_eq!(gate.valid_token().await.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn logs_in_when_token_is_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .and(body_string_contains("\"login\":\"tester\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "session": {
                    "token": "token-2",
                    "expire": "2099-01-01T00:00:00.000Z"
                },
                "id": 7,
                "username": "tester",
                "disk_usage": 10,
                "storage_limit": 104857600
            })))
            .mount(&server)
            .await;

        let gate = AuthGate::new(&server.uri()).unwrap();
        gate.set_credentials(Credentials {
            login: "tester".to_string(),
            password: "secret".to_string(),
        })
        .await;
        gate.restore_session(session(
            "stale",
            Some(OffsetDateTime::now_utc() - time::Duration::minutes(1)),
        ))
        .await;

        assert_eq!(gate.valid_token().await.unwrap(), "token-2");
        let refreshed = gate.session().await.unwrap();
        assert_eq!(refreshed.user_id, 7);
        assert_eq!(refreshed.storage_limit, 104857600);
    }

    #[tokio::test]
    async fn missing_credentials_block_token_issuance() {
        let gate = AuthGate::new("http://localhost").unwrap();
        let err = gate.valid_token().await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials));
    }

    #[tokio::test]
    async fn rejected_login_clears_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"detail": "Invalid username or password"})),
            )
            .mount(&server)
            .await;

        let gate = AuthGate::new(&server.uri()).unwrap();
        gate.set_credentials(Credentials {
            login: "tester".to_string(),
            password: "wrong".to_string(),
        })
        .await;

        let err = gate.valid_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(message) if message.contains("Invalid")));
        assert!(!gate.has_credentials().await);
    }
}
