//! Supabase auth and REST client.
//!
//! Talks to the GoTrue auth endpoints under `/auth/v1` and the PostgREST
//! endpoints under `/rest/v1`. Every request carries the project's anon key
//! in the `apikey` header; authenticated requests add the session's access
//! token as a bearer token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{AuthBackend, MemberStore};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::roster::{parse_members, LocationUpdate, Member};
use crate::session::{Credentials, Session, SignUpOutcome, User};

/// Columns selected for the roster.
const MEMBER_COLUMNS: &str = "id,name,lat,lng,updated_at";

/// Token lifetime assumed when the auth service omits it.
const DEFAULT_EXPIRES_IN: i64 = 3600;

/// Keys that may carry an error message, in order of preference.
const ERROR_KEYS: [&str; 4] = ["error_description", "msg", "message", "error"];

/// Session payload returned by the token and sign-up endpoints.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: User,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| {
                Utc::now()
                    + chrono::Duration::seconds(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN))
            });
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Pull a human-readable message out of an error body.
fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        ERROR_KEYS
            .iter()
            .find_map(|key| value.get(key).and_then(Value::as_str).map(str::to_string))
    });
    from_json
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

/// Read a failed response into `(status, message)`.
async fn failure(response: Response) -> (u16, String) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    (status.as_u16(), error_message(status, &body))
}

/// Map a failed auth call. Client errors are the user's to fix.
async fn auth_failure(response: Response) -> Error {
    let (status, message) = failure(response).await;
    if (400..500).contains(&status) {
        Error::auth(message)
    } else {
        Error::backend(status, message)
    }
}

/// HTTP client for one Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    http: reqwest::Client,
    url: String,
    anon_key: String,
    table: String,
    schema: String,
}

impl SupabaseClient {
    /// Create a client for the project in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("familymap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            url: config.url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            table: config.table.clone(),
            schema: config.schema.clone(),
        })
    }

    fn auth_endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.url)
    }

    fn table_endpoint(&self) -> String {
        format!("{}/rest/v1/{}", self.url, self.table)
    }

    fn anon(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .header("Accept", "application/json")
    }

    fn authed(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder {
        self.anon(request).bearer_auth(access_token)
    }

    async fn token(&self, grant_type: &str, body: Value) -> Result<Session> {
        let response = self
            .anon(self.http.post(self.auth_endpoint("token")))
            .query(&[("grant_type", grant_type)])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(auth_failure(response).await);
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.into_session())
    }
}

#[async_trait]
impl AuthBackend for SupabaseClient {
    async fn sign_up(&self, credentials: &Credentials) -> Result<SignUpOutcome> {
        let response = self
            .anon(self.http.post(self.auth_endpoint("signup")))
            .json(&json!({
                "email": credentials.email,
                "password": credentials.password,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(auth_failure(response).await);
        }

        // Without autoconfirm the body is the pending user, not a session
        let body: Value = response.json().await?;
        if body.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(body)?;
            Ok(SignUpOutcome::SignedIn(token.into_session()))
        } else {
            debug!("Sign-up pending email confirmation");
            Ok(SignUpOutcome::ConfirmationRequired {
                email: credentials.email.clone(),
            })
        }
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
        self.token(
            "password",
            json!({
                "email": credentials.email,
                "password": credentials.password,
            }),
        )
        .await
    }

    async fn sign_out(&self, session: &Session) -> Result<()> {
        let response = self
            .authed(
                self.http.post(self.auth_endpoint("logout")),
                &session.access_token,
            )
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(auth_failure(response).await)
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        self.token("refresh_token", json!({ "refresh_token": refresh_token }))
            .await
    }
}

#[async_trait]
impl MemberStore for SupabaseClient {
    async fn fetch_members(&self, session: &Session) -> Result<Vec<Member>> {
        let response = self
            .authed(self.http.get(self.table_endpoint()), &session.access_token)
            .header("Accept-Profile", &self.schema)
            .query(&[("select", MEMBER_COLUMNS)])
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, message) = failure(response).await;
            return Err(Error::backend(status, message));
        }
        let rows: Vec<Value> = response.json().await?;
        Ok(parse_members(rows))
    }

    async fn upsert_location(&self, session: &Session, update: &LocationUpdate) -> Result<()> {
        let response = self
            .authed(self.http.post(self.table_endpoint()), &session.access_token)
            .header("Content-Profile", &self.schema)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .query(&[("on_conflict", "id")])
            .json(update)
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, message) = failure(response).await;
            return Err(Error::backend(status, message));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    use super::*;
    use crate::device::Position;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, server)
    }

    fn client(url: &str) -> SupabaseClient {
        SupabaseClient::new(&BackendConfig {
            url: format!("{url}/"),
            anon_key: "anon-key".to_string(),
            ..BackendConfig::default()
        })
        .unwrap()
    }

    fn session() -> Session {
        Session {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            user: User {
                id: Uuid::new_v4(),
                email: None,
            },
        }
    }

    const TOKEN_BODY: &str = r#"{"access_token":"at","token_type":"bearer","expires_in":3600,"expires_at":4102444800,"refresh_token":"rt","user":{"id":"7c9e6679-7425-40de-944b-e07fc1f90ae7","email":"mom@example.com","role":"authenticated"}}"#;

    #[test]
    fn test_error_message_preference() {
        let status = StatusCode::BAD_REQUEST;
        assert_eq!(
            error_message(status, r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#),
            "Invalid login credentials"
        );
        assert_eq!(
            error_message(status, r#"{"code":400,"msg":"Password should be at least 6 characters"}"#),
            "Password should be at least 6 characters"
        );
        assert_eq!(
            error_message(status, r#"{"message":"permission denied for table profiles"}"#),
            "permission denied for table profiles"
        );
        assert_eq!(error_message(status, "plain text"), "plain text");
        assert_eq!(error_message(status, ""), "Bad Request");
    }

    #[test]
    fn test_token_response_into_session() {
        let token: TokenResponse = serde_json::from_str(TOKEN_BODY).unwrap();
        let session = token.into_session();
        assert_eq!(session.access_token, "at");
        assert_eq!(session.refresh_token, "rt");
        assert_eq!(session.expires_at.timestamp(), 4_102_444_800);
        assert_eq!(session.user.email.as_deref(), Some("mom@example.com"));
    }

    #[test]
    fn test_token_response_without_expires_at() {
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "at",
            "refresh_token": "rt",
            "expires_in": 60,
            "user": { "id": Uuid::new_v4() }
        }))
        .unwrap();
        let session = token.into_session();
        assert!(session.expires_within(std::time::Duration::from_secs(120)));
        assert!(!session.is_expired());
    }

    #[tokio::test]
    async fn test_sign_in_posts_password_grant() {
        let (url, server) = serve_once("200 OK", TOKEN_BODY).await;
        let session = client(&url)
            .sign_in(&Credentials::new("mom@example.com", "hunter22"))
            .await
            .unwrap();
        assert_eq!(session.access_token, "at");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /auth/v1/token?grant_type=password "));
        assert!(request.to_lowercase().contains("apikey: anon-key"));
        assert!(request.contains("\"password\":\"hunter22\""));
    }

    #[tokio::test]
    async fn test_sign_in_rejected_is_auth_error() {
        let (url, _server) = serve_once(
            "400 Bad Request",
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        )
        .await;
        let err = client(&url)
            .sign_in(&Credentials::new("mom@example.com", "wrong12"))
            .await
            .unwrap_err();
        assert!(err.is_auth_error());
        assert_eq!(err.to_string(), "Invalid login credentials");
    }

    #[tokio::test]
    async fn test_sign_up_requiring_confirmation() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"id":"7c9e6679-7425-40de-944b-e07fc1f90ae7","email":"kid@example.com","confirmation_sent_at":"2024-05-01T12:00:00Z"}"#,
        )
        .await;
        let outcome = client(&url)
            .sign_up(&Credentials::new("kid@example.com", "secret1"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SignUpOutcome::ConfirmationRequired {
                email: "kid@example.com".to_string()
            }
        );
        assert!(server.await.unwrap().starts_with("POST /auth/v1/signup "));
    }

    #[tokio::test]
    async fn test_sign_up_with_session() {
        let (url, _server) = serve_once("200 OK", TOKEN_BODY).await;
        let outcome = client(&url)
            .sign_up(&Credentials::new("mom@example.com", "hunter22"))
            .await
            .unwrap();
        assert!(matches!(outcome, SignUpOutcome::SignedIn(_)));
    }

    #[tokio::test]
    async fn test_fetch_members_selects_columns() {
        let (url, server) = serve_once(
            "200 OK",
            r#"[{"id":"7c9e6679-7425-40de-944b-e07fc1f90ae7","name":"Mom","lat":37.5,"lng":127.0,"updated_at":"2024-05-01T12:00:00+00:00"},{"id":"bad"}]"#,
        )
        .await;
        let members = client(&url).fetch_members(&session()).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].display_name(), "Mom");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /rest/v1/profiles?select=id%2Cname%2Clat%2Clng%2Cupdated_at "));
        assert!(request.to_lowercase().contains("authorization: bearer access"));
        assert!(request.to_lowercase().contains("accept-profile: public"));
    }

    #[tokio::test]
    async fn test_fetch_members_failure() {
        let (url, _server) = serve_once(
            "401 Unauthorized",
            r#"{"code":"PGRST301","message":"JWT expired"}"#,
        )
        .await;
        let err = client(&url).fetch_members(&session()).await.unwrap_err();
        assert!(matches!(err, Error::Backend { status: 401, ref message } if message == "JWT expired"));
    }

    #[tokio::test]
    async fn test_upsert_merges_duplicates() {
        let (url, server) = serve_once("201 Created", "").await;
        let session = session();
        let update = LocationUpdate::new(session.user_id(), Position::new(1.0, 2.0).unwrap());
        client(&url).upsert_location(&session, &update).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /rest/v1/profiles?on_conflict=id "));
        assert!(request
            .to_lowercase()
            .contains("prefer: resolution=merge-duplicates,return=minimal"));
        assert!(request.contains(&session.user_id().to_string()));
    }
}
