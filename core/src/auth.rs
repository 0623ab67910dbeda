//! Per-upstream credential handling.
//!
//! API-key and static-bearer credentials are pure projections to headers.
//! OAuth2 refresh-token credentials are exchanged against the token URL with
//! a per-key single-flight guarantee: at most one refresh is in flight per
//! `{client_id, token_url}` pair and concurrent callers observe its result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::OAuthBodyFormat;
use crate::config::UpstreamCredential;
use crate::error::ConduitErr;
use crate::error::Result;

/// Refresh this much before the provider-reported expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

const REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Providers that expect a JSON token request body rather than the
/// form-encoded default.
const JSON_BODY_TOKEN_HOSTS: &[&str] = &["auth.atlassian.com"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CredentialKey {
    client_id: String,
    token_url: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct AuthBroker {
    client: reqwest::Client,
    tokens: Mutex<HashMap<CredentialKey, CachedToken>>,
    /// Rotated refresh tokens from rotating-refresh providers; preferred
    /// over the configured value on subsequent refreshes.
    rotated: Mutex<HashMap<CredentialKey, String>>,
    refresh_locks: Mutex<HashMap<CredentialKey, Arc<Mutex<()>>>>,
}

impl Default for AuthBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthBroker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            tokens: Mutex::new(HashMap::new()),
            rotated: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Headers to attach to an upstream request for this credential.
    pub async fn headers(&self, credential: &UpstreamCredential) -> Result<Vec<(String, String)>> {
        match credential {
            UpstreamCredential::ApiKeyHeader { header, value } => {
                Ok(vec![(header.clone(), value.clone())])
            }
            UpstreamCredential::StaticBearer { token } => Ok(vec![(
                "Authorization".to_string(),
                format!("Bearer {token}"),
            )]),
            UpstreamCredential::OAuth2RefreshGrant { .. } => {
                let access_token = self.oauth_access_token(credential).await?;
                Ok(vec![(
                    "Authorization".to_string(),
                    format!("Bearer {access_token}"),
                )])
            }
        }
    }

    async fn oauth_access_token(&self, credential: &UpstreamCredential) -> Result<String> {
        let UpstreamCredential::OAuth2RefreshGrant {
            client_id,
            token_url,
            ..
        } = credential
        else {
            return Err(ConduitErr::Internal(
                "oauth_access_token called with a non-OAuth credential".to_string(),
            ));
        };
        let key = CredentialKey {
            client_id: client_id.clone(),
            token_url: token_url.clone(),
        };

        if let Some(token) = self.fresh_cached_token(&key).await {
            return Ok(token);
        }

        // Single-flight: one refresh per key; later callers queue on the
        // per-key lock and then observe the refreshed cache entry.
        let refresh_lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let _guard = refresh_lock.lock().await;

        if let Some(token) = self.fresh_cached_token(&key).await {
            return Ok(token);
        }

        let response = self.perform_refresh(credential, &key).await?;
        let expires_in = Duration::from_secs(response.expires_in.unwrap_or(3600));
        let cached = CachedToken {
            access_token: response.access_token.clone(),
            expires_at: Instant::now() + expires_in,
        };
        self.tokens.lock().await.insert(key.clone(), cached);
        if let Some(rotated) = response.refresh_token {
            debug!("storing rotated refresh token for {}", key.token_url);
            self.rotated.lock().await.insert(key, rotated);
        }
        Ok(response.access_token)
    }

    async fn fresh_cached_token(&self, key: &CredentialKey) -> Option<String> {
        let tokens = self.tokens.lock().await;
        let cached = tokens.get(key)?;
        if cached.expires_at > Instant::now() + EXPIRY_SKEW {
            Some(cached.access_token.clone())
        } else {
            None
        }
    }

    async fn perform_refresh(
        &self,
        credential: &UpstreamCredential,
        key: &CredentialKey,
    ) -> Result<TokenResponse> {
        let UpstreamCredential::OAuth2RefreshGrant {
            client_id,
            client_secret,
            token_url,
            refresh_token,
            scope,
            body_format,
        } = credential
        else {
            return Err(ConduitErr::Internal(
                "perform_refresh called with a non-OAuth credential".to_string(),
            ));
        };

        let effective_refresh_token = {
            let rotated = self.rotated.lock().await;
            rotated
                .get(key)
                .cloned()
                .unwrap_or_else(|| refresh_token.clone())
        };

        let mut body: HashMap<&str, String> = HashMap::from([
            ("grant_type", "refresh_token".to_string()),
            ("client_id", client_id.clone()),
            ("refresh_token", effective_refresh_token),
        ]);
        if let Some(secret) = client_secret {
            body.insert("client_secret", secret.clone());
        }
        if let Some(scope) = scope {
            body.insert("scope", scope.clone());
        }

        let use_json = match body_format {
            Some(OAuthBodyFormat::Json) => true,
            Some(OAuthBodyFormat::Form) => false,
            // Form-encoded by default; a handful of providers only accept
            // JSON and are special-cased by token-URL host.
            None => url::Url::parse(token_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .is_some_and(|host| JSON_BODY_TOKEN_HOSTS.contains(&host.as_str())),
        };

        let request = self.client.post(token_url).timeout(REFRESH_TIMEOUT);
        let request = if use_json {
            request.json(&body)
        } else {
            request.form(&body)
        };

        let response = request
            .send()
            .await
            .map_err(|e| ConduitErr::Internal(format!("OAuth2 refresh failed: {e}")))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConduitErr::Internal(format!("OAuth2 refresh failed: {e}")))?;

        if !status.is_success() {
            let reason = serde_json::from_slice::<TokenErrorResponse>(&bytes)
                .ok()
                .and_then(|e| e.error_description.or(e.error))
                .unwrap_or_else(|| format!("token endpoint returned {status}"));
            return Err(ConduitErr::Internal(format!(
                "OAuth2 refresh failed: {reason}"
            )));
        }

        serde_json::from_slice::<TokenResponse>(&bytes)
            .map_err(|e| ConduitErr::Internal(format!("OAuth2 refresh failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    fn oauth_credential(token_url: String) -> UpstreamCredential {
        UpstreamCredential::OAuth2RefreshGrant {
            client_id: "cid".to_string(),
            client_secret: None,
            token_url,
            refresh_token: "configured-rt".to_string(),
            scope: None,
            body_format: None,
        }
    }

    #[tokio::test]
    async fn static_credentials_are_pure_projections() {
        let broker = AuthBroker::new();
        let headers = broker
            .headers(&UpstreamCredential::ApiKeyHeader {
                header: "X-Api-Key".to_string(),
                value: "v".to_string(),
            })
            .await
            .expect("headers");
        assert_eq!(headers, vec![("X-Api-Key".to_string(), "v".to_string())]);

        let headers = broker
            .headers(&UpstreamCredential::StaticBearer {
                token: "tok".to_string(),
            })
            .await
            .expect("headers");
        assert_eq!(
            headers,
            vec![("Authorization".to_string(), "Bearer tok".to_string())]
        );
    }

    #[tokio::test]
    async fn refresh_is_cached_and_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let broker = Arc::new(AuthBroker::new());
        let credential = oauth_credential(format!("{}/oauth/token", server.uri()));

        // Two concurrent callers, one token-endpoint request.
        let (a, b) = tokio::join!(
            broker.headers(&credential),
            broker.headers(&credential)
        );
        let a = a.expect("headers a");
        let b = b.expect("headers b");
        assert_eq!(a, b);
        assert_eq!(a[0].1, "Bearer fresh");

        // Third call is served from cache (mock expects exactly one hit).
        let c = broker.headers(&credential).await.expect("headers c");
        assert_eq!(c[0].1, "Bearer fresh");
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_used_on_next_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "first",
                // Immediately stale: under the 30 s skew.
                "expires_in": 1,
                "refresh_token": "rotated-rt",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(wiremock::matchers::body_string_contains("rotated-rt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "second",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let broker = AuthBroker::new();
        let credential = oauth_credential(format!("{}/oauth/token", server.uri()));

        let first = broker.headers(&credential).await.expect("first");
        assert_eq!(first[0].1, "Bearer first");
        let second = broker.headers(&credential).await.expect("second");
        assert_eq!(second[0].1, "Bearer second");
    }

    #[tokio::test]
    async fn provider_error_description_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "refresh token revoked",
            })))
            .mount(&server)
            .await;

        let broker = AuthBroker::new();
        let credential = oauth_credential(format!("{}/oauth/token", server.uri()));
        let err = broker.headers(&credential).await.expect_err("must fail");
        let message = err.to_string();
        assert!(message.contains("OAuth2 refresh failed"), "{message}");
        assert!(message.contains("refresh token revoked"), "{message}");
    }
}
