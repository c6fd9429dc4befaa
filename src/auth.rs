use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::client::{ClientConfig, default_http_client, error_for_status, join_endpoint};
use crate::{AiopError, Result};

const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// A remote session token pair plus the identity it belongs to. Persisted in
/// the device-local state file so restarts keep the user signed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: AuthUser,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc() >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let lifetime = self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: OffsetDateTime::now_utc() + time::Duration::seconds(lifetime),
            user: self.user,
        }
    }
}

/// Sign-up that requires email confirmation comes back without a session.
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user: AuthUser,
    pub session: Option<Session>,
}

/// Client for the identity provider under `auth/v1`: sign-up, password
/// sign-in, token refresh, sign-out and user lookup.
#[derive(Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl AuthClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: default_http_client(),
            base_url: config.base_url.clone(),
            anon_key: config.anon_key.clone(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        join_endpoint(&self.base_url, &format!("auth/v1/{path}"))
    }

    fn apply_key(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.anon_key)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<SignUpOutcome> {
        let req = self
            .http
            .post(self.endpoint("signup"))
            .json(&json!({ "email": email, "password": password }));
        let response = error_for_status(self.apply_key(req).send().await?).await?;
        let value = response.json::<Value>().await?;

        // With auto-confirm enabled the response is a full token grant;
        // otherwise it is the bare user row awaiting confirmation.
        if value.get("access_token").is_some() {
            let token: TokenResponse = serde_json::from_value(value)?;
            let session = token.into_session();
            Ok(SignUpOutcome {
                user: session.user.clone(),
                session: Some(session),
            })
        } else {
            let user: AuthUser = serde_json::from_value(value)?;
            Ok(SignUpOutcome {
                user,
                session: None,
            })
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        self.token_grant(
            "password",
            json!({ "email": email, "password": password }),
        )
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        self.token_grant(
            "refresh_token",
            json!({ "refresh_token": refresh_token }),
        )
        .await
    }

    async fn token_grant(&self, grant_type: &str, body: Value) -> Result<Session> {
        let req = self
            .http
            .post(self.endpoint("token"))
            .query(&[("grant_type", grant_type)])
            .json(&body);
        let response = error_for_status(self.apply_key(req).send().await?).await?;
        let token = response.json::<TokenResponse>().await?;
        Ok(token.into_session())
    }

    pub async fn sign_out(&self, access_token: &str) -> Result<()> {
        let req = self
            .http
            .post(self.endpoint("logout"))
            .bearer_auth(access_token);
        error_for_status(self.apply_key(req).send().await?).await?;
        Ok(())
    }

    pub async fn user(&self, access_token: &str) -> Result<AuthUser> {
        let req = self
            .http
            .get(self.endpoint("user"))
            .bearer_auth(access_token);
        let response = error_for_status(self.apply_key(req).send().await?).await?;
        response
            .json::<AuthUser>()
            .await
            .map_err(AiopError::from)
    }
}
