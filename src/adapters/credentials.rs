use std::path::Path;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use color_eyre::eyre::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{AdapterError, CredentialProvider};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Refresh this long before the provider says the token expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// The `authorized_user` JSON written by `gcloud auth application-default login`.
#[derive(Debug, Clone, Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_after: Instant,
}

/// OAuth refresh-token credentials read from a token file.
pub struct TokenFileCredentials {
    client: reqwest::Client,
    user: AuthorizedUser,
    token_uri: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenFileCredentials {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read token file: {}", path.display()))?;
        Self::from_json(&contents)
            .wrap_err_with(|| format!("Failed to parse token file: {}", path.display()))
    }

    fn from_json(contents: &str) -> Result<Self> {
        let user: AuthorizedUser = serde_json::from_str(contents)?;
        let token_uri = user
            .token_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());
        Ok(Self {
            client: reqwest::Client::new(),
            user,
            token_uri,
            cached: Mutex::new(None),
        })
    }

    async fn refresh(&self) -> Result<TokenResponse, AdapterError> {
        let form = [
            ("client_id", self.user.client_id.as_str()),
            ("client_secret", self.user.client_secret.as_str()),
            ("refresh_token", self.user.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = self.client.post(&self.token_uri).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            // A revoked refresh token comes back as 400 invalid_grant.
            return Err(AdapterError::from_status(status, "Token refresh failed"));
        }
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for TokenFileCredentials {
    async fn access_token(&self) -> Result<String, AdapterError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_after
        {
            return Ok(token.value.clone());
        }

        let response = (|| self.refresh())
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_times(3),
            )
            .when(AdapterError::is_transient)
            .notify(|error, delay| {
                tracing::warn!(%error, ?delay, "Retrying token refresh");
            })
            .await
            // Auth trouble never fails an item for good, whatever the token
            // endpoint answered.
            .map_err(|error| match error {
                AdapterError::Permanent(message) => AdapterError::Transient(message),
                transient => transient,
            })?;

        let lifetime = Duration::from_secs(response.expires_in.unwrap_or(3600));
        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            refresh_after: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        });
        tracing::debug!(?lifetime, "Refreshed access token");
        Ok(response.access_token)
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, http::StatusCode, routing::post};

    use super::*;

    #[test]
    fn test_parses_authorized_user_file() {
        let credentials = TokenFileCredentials::from_json(
            r#"{
                "client_id": "id.apps.googleusercontent.com",
                "client_secret": "secret",
                "refresh_token": "1//refresh",
                "type": "authorized_user"
            }"#,
        )
        .unwrap();
        assert_eq!(credentials.token_uri, DEFAULT_TOKEN_URI);
        assert_eq!(credentials.user.refresh_token, "1//refresh");
    }

    #[test]
    fn test_rejects_file_without_refresh_token() {
        assert!(TokenFileCredentials::from_json(r#"{"client_id": "x"}"#).is_err());
    }

    async fn token_endpoint(status: StatusCode, body: &'static str) -> String {
        let app = Router::new().route(
            "/token",
            post(move || async move { (status, body) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/token")
    }

    fn credentials_for(token_uri: &str) -> TokenFileCredentials {
        TokenFileCredentials::from_json(&format!(
            r#"{{"client_id": "x", "client_secret": "y", "refresh_token": "z",
                "token_uri": "{token_uri}"}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_refreshes_and_caches_token() {
        let uri = token_endpoint(
            StatusCode::OK,
            r#"{"access_token": "ya29.fresh", "expires_in": 3599}"#,
        )
        .await;
        let credentials = credentials_for(&uri);

        assert_eq!(credentials.access_token().await.unwrap(), "ya29.fresh");
        assert!(credentials.cached.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_rejected_refresh_token_is_transient() {
        let uri = token_endpoint(StatusCode::BAD_REQUEST, r#"{"error": "invalid_grant"}"#).await;
        let credentials = credentials_for(&uri);

        let error = credentials.access_token().await.unwrap_err();

        assert!(error.is_transient(), "{error:?}");
        assert!(error.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let credentials = TokenFileCredentials::from_json(
            r#"{"client_id": "x", "client_secret": "y", "refresh_token": "z",
                "token_uri": "http://127.0.0.1:9/token"}"#,
        )
        .unwrap();
        *credentials.cached.lock().await = Some(CachedToken {
            value: "ya29.cached".into(),
            refresh_after: Instant::now() + Duration::from_secs(600),
        });

        assert_eq!(credentials.access_token().await.unwrap(), "ya29.cached");
    }
}
