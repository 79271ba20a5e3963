//! Phone-OTP auth client for the Supabase auth service (GoTrue).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, trace, warn};

use crate::{AuthEvent, Session, SupabaseError, User};

/// Capacity of the auth state change channel.
const AUTH_EVENT_CAPACITY: usize = 16;

/// Token payload returned by `/verify` and `/token`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    user: User,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| Utc::now().timestamp() + self.expires_in.unwrap_or(3600));
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            token_type: self.token_type,
            user: self.user,
        }
    }
}

/// Client for the auth service.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: String,
    anon_key: String,
    session: Arc<RwLock<Option<Session>>>,
    events_tx: broadcast::Sender<AuthEvent>,
}

impl AuthClient {
    /// Create a new auth client for the given project URL.
    pub fn new(
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
    ) -> Result<Self, SupabaseError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_http(http, base_url, anon_key))
    }

    pub(crate) fn with_http(
        http: Client,
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            session: Arc::new(RwLock::new(None)),
            events_tx,
        }
    }

    /// The anon (public) API key.
    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    /// Subscribe to sign-in, refresh and sign-out transitions.
    pub fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: AuthEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("no subscribers for auth state change");
        }
    }

    /// Ask the auth service to text a one-time code to `phone`.
    pub async fn sign_in_with_otp(&self, phone: &str) -> Result<(), SupabaseError> {
        #[derive(Serialize)]
        struct OtpRequest<'a> {
            phone: &'a str,
            create_user: bool,
        }

        let response = self
            .http
            .post(self.url("otp"))
            .header("apikey", &self.anon_key)
            .json(&OtpRequest {
                phone,
                create_user: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(auth_failure("otp request", response).await);
        }

        debug!("one-time code requested");
        Ok(())
    }

    /// Exchange a one-time code for a session.
    pub async fn verify_otp(&self, phone: &str, token: &str) -> Result<Session, SupabaseError> {
        #[derive(Serialize)]
        struct VerifyRequest<'a> {
            phone: &'a str,
            token: &'a str,
            #[serde(rename = "type")]
            kind: &'a str,
        }

        let response = self
            .http
            .post(self.url("verify"))
            .header("apikey", &self.anon_key)
            .json(&VerifyRequest {
                phone,
                token,
                kind: "sms",
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(auth_failure("verify", response).await);
        }

        let session = response.json::<TokenResponse>().await?.into_session();
        debug!(user = %session.user.id, "verified one-time code");

        *self.session.write().await = Some(session.clone());
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// Refresh the current session tokens.
    pub async fn refresh_session(&self) -> Result<Session, SupabaseError> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            refresh_token: &'a str,
        }

        let refresh_token = {
            let session = self.session.read().await;
            session
                .as_ref()
                .map(|s| s.refresh_token.clone())
                .ok_or_else(|| SupabaseError::Auth("no session to refresh".to_string()))?
        };

        let response = self
            .http
            .post(self.url("token"))
            .query(&[("grant_type", "refresh_token")])
            .header("apikey", &self.anon_key)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(auth_failure("refresh", response).await);
        }

        let session = response.json::<TokenResponse>().await?.into_session();
        debug!(user = %session.user.id, "refreshed session");

        *self.session.write().await = Some(session.clone());
        self.emit(AuthEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    /// Current session, if signed in. Expired sessions are still returned;
    /// use [`AuthClient::access_token`] for a token that is refreshed on demand.
    pub async fn get_session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Install a previously persisted session.
    pub async fn set_session(&self, session: Session) {
        *self.session.write().await = Some(session.clone());
        self.emit(AuthEvent::SignedIn(session));
    }

    /// Id of the signed-in user.
    pub async fn user_id(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.user.id.clone())
    }

    /// Fetch the signed-in user from the auth service.
    pub async fn get_user(&self) -> Result<User, SupabaseError> {
        let token = self.access_token().await?;

        let response = self
            .http
            .get(self.url("user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(auth_failure("get user", response).await);
        }

        Ok(response.json().await?)
    }

    /// Sign out locally and revoke the session on the server.
    ///
    /// The local session is cleared even if revocation fails.
    pub async fn sign_out(&self) -> Result<(), SupabaseError> {
        let previous = self.session.write().await.take();
        self.emit(AuthEvent::SignedOut);

        let Some(session) = previous else {
            return Ok(());
        };

        let response = self
            .http
            .post(self.url("logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let err = auth_failure("logout", response).await;
            warn!(error = %err, "server-side sign out failed");
            return Err(err);
        }
        Ok(())
    }

    /// A valid access token, refreshing the session first if it has expired.
    pub async fn access_token(&self) -> Result<String, SupabaseError> {
        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| SupabaseError::Auth("not authenticated".to_string()))?;

        if session.is_expired() {
            debug!("access token expired, refreshing");
            return Ok(self.refresh_session().await?.access_token);
        }
        Ok(session.access_token)
    }

    /// Bearer token for data requests: the user's access token when signed
    /// in, the anon key otherwise.
    pub async fn bearer(&self) -> Result<String, SupabaseError> {
        if self.session.read().await.is_none() {
            return Ok(self.anon_key.clone());
        }
        self.access_token().await
    }

    /// Try to refresh the session.
    /// Returns true if refresh succeeded.
    pub(crate) async fn try_refresh(&self) -> bool {
        match self.refresh_session().await {
            Ok(_) => {
                debug!("automatically refreshed expired session");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to auto-refresh session");
                false
            }
        }
    }
}

async fn auth_failure(action: &str, response: reqwest::Response) -> SupabaseError {
    let status = response.status();
    match response.text().await {
        Ok(text) => SupabaseError::Auth(format!("{} failed ({}): {}", action, status, text)),
        Err(e) => SupabaseError::Auth(format!(
            "{} failed ({}): failed to read response: {}",
            action, status, e
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token_body(access: &str, expires_at: i64) -> serde_json::Value {
        serde_json::json!({
            "access_token": access,
            "refresh_token": "refresh-1",
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": expires_at,
            "user": {"id": "user-1", "phone": "15555550100"}
        })
    }

    #[tokio::test]
    async fn test_sign_in_with_otp() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/otp"))
            .and(header("apikey", "anon"))
            .and(body_json(serde_json::json!({"phone": "15555550100", "create_user": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(mock_server.uri(), "anon").unwrap();
        auth.sign_in_with_otp("15555550100").await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_otp_stores_session_and_emits() {
        let mock_server = MockServer::start().await;
        let expires_at = Utc::now().timestamp() + 3600;

        Mock::given(method("POST"))
            .and(path("/auth/v1/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1", expires_at)))
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(mock_server.uri(), "anon").unwrap();
        let mut events = auth.on_auth_state_change();

        let session = auth.verify_otp("15555550100", "123456").await.unwrap();
        assert_eq!(session.access_token, "access-1");
        assert_eq!(session.expires_at, expires_at);
        assert_eq!(auth.user_id().await, Some("user-1".to_string()));
        assert!(matches!(events.recv().await.unwrap(), AuthEvent::SignedIn(_)));
    }

    #[tokio::test]
    async fn test_verify_otp_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/verify"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "code": 403,
                "msg": "Token has expired or is invalid"
            })))
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(mock_server.uri(), "anon").unwrap();
        let result = auth.verify_otp("15555550100", "000000").await;

        assert!(matches!(result, Err(SupabaseError::Auth(_))));
        assert!(auth.get_session().await.is_none());
    }

    #[tokio::test]
    async fn test_access_token_refreshes_expired_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("access-2", Utc::now().timestamp() + 3600)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(mock_server.uri(), "anon").unwrap();
        auth.set_session(Session {
            access_token: "stale".into(),
            refresh_token: "refresh-1".into(),
            expires_at: Utc::now().timestamp() - 1,
            token_type: None,
            user: User {
                id: "user-1".into(),
                phone: None,
                email: None,
                created_at: None,
            },
        })
        .await;

        assert_eq!(auth.access_token().await.unwrap(), "access-2");
    }

    #[tokio::test]
    async fn test_access_token_without_session() {
        let auth = AuthClient::new("https://example.supabase.co", "anon").unwrap();
        assert!(matches!(auth.access_token().await, Err(SupabaseError::Auth(_))));
        assert_eq!(auth.bearer().await.unwrap(), "anon");
    }

    #[tokio::test]
    async fn test_sign_out_clears_session_without_server_call() {
        let auth = AuthClient::new("https://example.supabase.co", "anon").unwrap();
        let mut events = auth.on_auth_state_change();
        auth.sign_out().await.unwrap();
        assert!(auth.get_session().await.is_none());
        assert_eq!(events.recv().await.unwrap(), AuthEvent::SignedOut);
    }
}
