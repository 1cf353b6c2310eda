use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::{
    extract::Query,
    http::{
        header::{COOKIE, HOST, SET_COOKIE},
        HeaderMap, HeaderName,
    },
    response::Redirect,
    routing::get,
    Extension, Json, Router,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::server::app::{AppServer, Stage};
use crate::server::rest::error::{ApiError, ApiResult};
use crate::shared::config::SsoConfig;

const SESSION_ISSUER: &str = "docserve-sso";
const STATE_COOKIE: &str = "docserve_sso_state";
const STATE_TTL_SECS: u32 = 600;

/// Claims the identity provider puts in the callback token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
    pub iat: usize,
    pub iss: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(default)]
    pub redirect_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub redirect_to: Option<String>,
}

pub struct SsoManager {
    config: SsoConfig,
}

impl SsoManager {
    pub fn new(config: SsoConfig) -> Self {
        Self { config }
    }

    /// Provider URL the browser is sent to.
    pub fn authorize_url(&self, callback_url: &str, state: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|e| anyhow!("Invalid SSO authorize_url '{}': {}", self.config.authorize_url, e))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", callback_url)
            .append_pair("state", state);
        Ok(url)
    }

    pub fn verify_provider_token(&self, token: &str) -> Result<ProviderClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::default();
        validation.validate_aud = false;
        let token_data: TokenData<ProviderClaims> = decode(
            token,
            &DecodingKey::from_secret(self.config.shared_secret.as_ref()),
            &validation,
        )?;
        Ok(token_data.claims)
    }

    pub fn issue_session(&self, provider: &ProviderClaims) -> Result<SessionResponse> {
        let now = Utc::now();
        let exp = now
            .checked_add_signed(Duration::hours(self.config.session_hours))
            .ok_or_else(|| anyhow!("Session expiry out of range"))?;

        let claims = SessionClaims {
            sub: provider.sub.clone(),
            email: provider.email.clone(),
            exp: exp.timestamp() as usize,
            iat: now.timestamp() as usize,
            iss: SESSION_ISSUER.to_string(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.session_secret.as_ref()),
        )?;

        Ok(SessionResponse {
            token,
            expires_at: exp.to_rfc3339(),
            subject: claims.sub,
            redirect_to: None,
        })
    }

    #[cfg(test)]
    pub fn decode_session(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::default();
        validation.set_issuer(&[SESSION_ISSUER]);
        let token_data: TokenData<SessionClaims> = decode(
            token,
            &DecodingKey::from_secret(self.config.session_secret.as_ref()),
            &validation,
        )?;
        Ok(token_data.claims)
    }

    fn callback_url(&self, headers: &HeaderMap, redirect_to: Option<&str>) -> String {
        let base = match &self.config.public_url {
            Some(public_url) => format!("{public_url}/sso/callback"),
            None => {
                let host = headers
                    .get(HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or("localhost");
                format!("http://{host}/sso/callback")
            }
        };
        match (redirect_to, Url::parse(&base)) {
            (Some(target), Ok(mut url)) => {
                url.query_pairs_mut().append_pair("redirect_to", target);
                url.to_string()
            }
            _ => base,
        }
    }

    /// `Set-Cookie` value binding `state` to the browser that started the
    /// sign-in. An empty `state` with zero max-age clears it.
    fn state_cookie(&self, state: &str, max_age: u32) -> String {
        let secure = self
            .config
            .public_url
            .as_deref()
            .is_some_and(|url| url.starts_with("https://"));
        format!(
            "{STATE_COOKIE}={state}; Path=/sso; Max-Age={max_age}; HttpOnly; SameSite=Lax{}",
            if secure { "; Secure" } else { "" }
        )
    }

    /// Step e: mount `/sso/login` and `/sso/callback` when SSO is configured.
    pub fn create_route(server: &mut AppServer) -> Result<()> {
        server.expect_next(Stage::SsoRoutes)?;

        match server.state().config.sso.clone() {
            Some(config) => {
                Url::parse(&config.authorize_url)
                    .map_err(|e| anyhow!("Invalid SSO authorize_url '{}': {}", config.authorize_url, e))?;
                let manager = Arc::new(SsoManager::new(config));
                server.merge(
                    Router::new()
                        .route("/sso/login", get(login))
                        .route("/sso/callback", get(callback)),
                );
                server.decorate(move |router| router.layer(Extension(manager)));
                info!("SSO routes mounted at /sso/login and /sso/callback");
            }
            None => info!("SSO not configured, skipping SSO routes"),
        }

        server.advance(Stage::SsoRoutes)?;
        Ok(())
    }
}

async fn login(
    Extension(sso): Extension<Arc<SsoManager>>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
) -> ApiResult<([(HeaderName, String); 1], Redirect)> {
    let state = Uuid::new_v4().simple().to_string();
    let callback_url = sso.callback_url(&headers, query.redirect_to.as_deref());
    let url = sso.authorize_url(&callback_url, &state)?;
    Ok((
        [(SET_COOKIE, sso.state_cookie(&state, STATE_TTL_SECS))],
        Redirect::temporary(url.as_str()),
    ))
}

async fn callback(
    Extension(sso): Extension<Arc<SsoManager>>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> ApiResult<([(HeaderName, String); 1], Json<SessionResponse>)> {
    if let Some(error) = query.error {
        warn!("SSO provider returned an error: {}", error);
        return Err(ApiError::Unauthorized(format!("Sign-in failed: {error}")));
    }

    let expected = cookie_value(&headers, STATE_COOKIE);
    match (query.state.as_deref(), expected) {
        (Some(state), Some(expected)) if !state.is_empty() && state == expected => {}
        _ => {
            warn!("SSO callback rejected: state does not match the login cookie");
            return Err(ApiError::Unauthorized("Invalid SSO state".to_string()));
        }
    }

    let token = query
        .token
        .ok_or_else(|| ApiError::Unauthorized("Missing token".to_string()))?;

    let provider = sso.verify_provider_token(&token)?;
    let mut session = sso.issue_session(&provider)?;
    session.redirect_to = query.redirect_to;
    info!("SSO sign-in for {}", session.subject);
    Ok(([(SET_COOKIE, sso.state_cookie("", 0))], Json(session)))
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SsoManager {
        SsoManager::new(SsoConfig {
            authorize_url: "https://id.example.com/authorize".to_string(),
            client_id: "docserve".to_string(),
            shared_secret: "provider-secret".to_string(),
            session_secret: "session-secret".to_string(),
            session_hours: 2,
            public_url: None,
        })
    }

    fn provider_token(secret: &str) -> String {
        let claims = ProviderClaims {
            sub: "user-1".to_string(),
            email: Some("ada@example.com".to_string()),
            exp: (Utc::now().timestamp() + 600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_ref()),
        )
        .unwrap()
    }

    #[test]
    fn test_authorize_url_carries_client_and_callback() {
        let url = manager()
            .authorize_url("http://localhost:8000/sso/callback", "abc")
            .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("client_id".to_string(), "docserve".to_string()),
                (
                    "redirect_uri".to_string(),
                    "http://localhost:8000/sso/callback".to_string()
                ),
                ("state".to_string(), "abc".to_string()),
            ]
        );
    }

    #[test]
    fn test_provider_token_exchange() {
        let sso = manager();
        let provider = sso.verify_provider_token(&provider_token("provider-secret")).unwrap();
        let session = sso.issue_session(&provider).unwrap();
        assert_eq!(session.subject, "user-1");

        let claims = sso.decode_session(&session.token).unwrap();
        assert_eq!(claims.iss, SESSION_ISSUER);
        assert_eq!(claims.email.as_deref(), Some("ada@example.com"));
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_tokens_signed_with_other_secrets_are_rejected() {
        let sso = manager();
        assert!(sso.verify_provider_token(&provider_token("wrong")).is_err());
        // provider tokens are not sessions
        assert!(sso.decode_session(&provider_token("session-secret")).is_err());
    }

    #[test]
    fn test_callback_url_prefers_public_url() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(
            manager().callback_url(&headers, None),
            "http://127.0.0.1:9000/sso/callback"
        );

        let mut sso = manager();
        sso.config.public_url = Some("https://app.example.com".to_string());
        assert_eq!(
            sso.callback_url(&headers, None),
            "https://app.example.com/sso/callback"
        );
    }

    #[test]
    fn test_state_cookie_round_trip() {
        let sso = manager();
        let cookie = sso.state_cookie("abc123", STATE_TTL_SECS);
        assert!(cookie.starts_with("docserve_sso_state=abc123; Path=/sso; Max-Age=600"));
        assert!(!cookie.contains("Secure"));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "theme=dark; docserve_sso_state=abc123".parse().unwrap());
        assert_eq!(cookie_value(&headers, STATE_COOKIE), Some("abc123"));
        assert_eq!(cookie_value(&headers, "missing"), None);

        let mut secure = manager();
        secure.config.public_url = Some("https://app.example.com".to_string());
        assert!(secure.state_cookie("", 0).ends_with("Max-Age=0; HttpOnly; SameSite=Lax; Secure"));
    }

    #[test]
    fn test_callback_url_forwards_redirect_target() {
        let headers = HeaderMap::new();
        assert_eq!(
            manager().callback_url(&headers, Some("/dashboard?tab=1")),
            "http://localhost/sso/callback?redirect_to=%2Fdashboard%3Ftab%3D1"
        );
    }
}
