//! OAuth token endpoint calls.
//!
//! Both grants POST an `application/x-www-form-urlencoded` body, never JSON.

use crate::credentials::{ResolvedCredential, TokenRecord};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
}

/// Grant being exchanged at the token endpoint
#[derive(Debug, Clone, Copy)]
pub(crate) enum Grant<'a> {
    AuthorizationCode {
        code: &'a str,
        redirect_uri: Option<&'a str>,
    },
    RefreshToken {
        refresh_token: &'a str,
    },
}

impl Grant<'_> {
    /// Form fields for this grant, client credentials included.
    pub(crate) fn form(&self, credential: &ResolvedCredential) -> Vec<(&'static str, String)> {
        let mut form = Vec::with_capacity(5);
        match self {
            Grant::AuthorizationCode { code, redirect_uri } => {
                form.push(("grant_type", "authorization_code".to_string()));
                form.push(("client_id", credential.client_id.clone()));
                form.push(("client_secret", credential.client_secret.clone()));
                form.push(("code", code.to_string()));
                if let Some(redirect_uri) = redirect_uri {
                    form.push(("redirect_uri", redirect_uri.to_string()));
                }
            }
            Grant::RefreshToken { refresh_token } => {
                form.push(("grant_type", "refresh_token".to_string()));
                form.push(("client_id", credential.client_id.clone()));
                form.push(("client_secret", credential.client_secret.clone()));
                form.push(("refresh_token", refresh_token.to_string()));
            }
        }
        form
    }
}

/// Why a token request failed; mapped to the exchange or refresh error kind by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TokenRequestFailure {
    /// HTTP status, absent for transport errors and timeouts
    pub status: Option<u16>,
    /// Raw marketplace response body, or the transport error message
    pub body: String,
}

impl TokenRequestFailure {
    fn transport(e: reqwest::Error) -> Self {
        let body = if e.is_timeout() {
            format!("request timed out: {}", e)
        } else {
            format!("request failed: {}", e)
        };
        Self { status: None, body }
    }
}

/// POST a grant to the token endpoint.
///
/// `expires_at` is computed from the moment the response arrived, not the
/// moment the request was sent.
pub(crate) async fn request_token(
    http: &reqwest::Client,
    token_url: &str,
    credential: &ResolvedCredential,
    grant: Grant<'_>,
) -> Result<TokenRecord, TokenRequestFailure> {
    let form = grant.form(credential);

    let response = http
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .map_err(TokenRequestFailure::transport)?;

    let issued_at = Utc::now();
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(TokenRequestFailure::transport)?;

    if !status.is_success() {
        return Err(TokenRequestFailure {
            status: Some(status.as_u16()),
            body,
        });
    }

    let token_response: TokenResponse = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::debug!(error = %e, "Token endpoint returned an unparseable body");
            return Err(TokenRequestFailure {
                status: Some(status.as_u16()),
                body,
            });
        }
    };

    if token_response.expires_in < 0 || token_response.access_token.is_empty() {
        return Err(TokenRequestFailure {
            status: Some(status.as_u16()),
            body,
        });
    }

    // An out-of-range lifetime is as malformed as a negative one
    let Some(expires_at) = expiry_from(issued_at, token_response.expires_in) else {
        tracing::debug!(
            expires_in = token_response.expires_in,
            "Token endpoint returned an unrepresentable expires_in"
        );
        return Err(TokenRequestFailure {
            status: Some(status.as_u16()),
            body,
        });
    };

    tracing::debug!(
        "Token request successful, has_refresh_token={}, expires_in={}",
        token_response.refresh_token.is_some(),
        token_response.expires_in
    );

    Ok(TokenRecord {
        access_token: token_response.access_token,
        refresh_token: token_response.refresh_token,
        expires_at,
    })
}

fn expiry_from(issued_at: DateTime<Utc>, expires_in: i64) -> Option<DateTime<Utc>> {
    issued_at.checked_add_signed(Duration::try_seconds(expires_in)?)
}
