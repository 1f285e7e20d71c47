//! REST resource layer.
//!
//! Every request carries the identity cell's token as a bearer header.
//! Failures are mapped onto [`FolioError`]: no response is `Network`, a
//! non-2xx status is `Http` with the body parsed as JSON when possible, and a
//! 401 answered to a request that carried a token is `SessionExpired`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use folio_core::{Fingerprint, FolioError, FolioResult, IdentityCell, ValidationError};
use folio_session::{AuthApi, AuthToken};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::FolioConfig;
use crate::error::ClientError;

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    identity: IdentityCell,
}

impl RestClient {
    pub fn new(config: &FolioConfig, identity: IdentityCell) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            identity,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn identity(&self) -> &IdentityCell {
        &self.identity
    }

    pub async fn get_json<T, Q>(&self, path: &str, query: Option<&Q>) -> FolioResult<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let mut request = self.request(Method::GET, path);
        if let Some(query) = query {
            request = request.query(query);
        }
        let value = self.send(path, request).await?;
        decode(path, value)
    }

    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> FolioResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = self.request(Method::POST, path).json(body);
        let value = self.send(path, request).await?;
        decode(path, value)
    }

    pub async fn patch_json<T, B>(&self, path: &str, body: &B) -> FolioResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = self.request(Method::PATCH, path).json(body);
        let value = self.send(path, request).await?;
        decode(path, value)
    }

    /// GET `path` with the fingerprint's parameters as the query string.
    pub async fn get_value(&self, path: &str, fingerprint: Option<&Fingerprint>) -> FolioResult<Value> {
        let pairs = fingerprint.map(query_pairs).unwrap_or_default();
        self.get_json::<Value, _>(path, Some(&pairs)).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client.request(method, url)
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> FolioResult<Value> {
        let token = self.identity.auth_token();
        let token_present = token.is_some();
        let request = match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| FolioError::network(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FolioError::network(e.to_string()))?;

        if status.is_success() {
            tracing::debug!(path, status = status.as_u16(), "request succeeded");
            return parse_success(path, status, &text);
        }

        let err = status_error(status.as_u16(), &text, token_present);
        tracing::debug!(path, status = status.as_u16(), kind = ?err.kind(), "request failed");
        Err(err)
    }
}

fn parse_success(path: &str, status: StatusCode, text: &str) -> FolioResult<Value> {
    if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| {
        FolioError::from(ValidationError::Decode {
            fingerprint: path.to_string(),
            reason: e.to_string(),
        })
    })
}

/// Map a failure status and its body onto a classified error.
pub(crate) fn status_error(status: u16, text: &str, token_present: bool) -> FolioError {
    let body = if text.trim().is_empty() {
        None
    } else {
        Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
    };
    FolioError::http(status, body).classify(token_present)
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> FolioResult<T> {
    serde_json::from_value(value).map_err(|e| {
        FolioError::from(ValidationError::Decode {
            fingerprint: path.to_string(),
            reason: e.to_string(),
        })
    })
}

/// Scalar parameters as query pairs. Null parameters are omitted.
pub(crate) fn query_pairs(fingerprint: &Fingerprint) -> Vec<(String, String)> {
    fingerprint
        .params()
        .iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some((key.clone(), rendered))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    address: &'a str,
    message: &'a str,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    token: String,
    #[serde(default, rename = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl AuthApi for RestClient {
    async fn request_nonce(&self, address: &str) -> FolioResult<String> {
        let path = format!("/auth/nonce/{}", address);
        let response: NonceResponse = self.get_json::<_, ()>(&path, None).await?;
        Ok(response.message)
    }

    async fn verify(&self, address: &str, message: &str, signature: &[u8]) -> FolioResult<AuthToken> {
        let body = VerifyRequest {
            address,
            message,
            signature: BASE64.encode(signature),
        };
        let response: VerifyResponse = self.post_json("/auth/verify", &body).await?;
        let token = AuthToken::new(response.token);
        Ok(match response.expires_at {
            Some(expires_at) => token.with_expiry(expires_at),
            None => token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_error_parses_json_body() {
        let err = status_error(409, r#"{"message":"already approved"}"#, false);
        assert_eq!(
            err,
            FolioError::http(409, Some(json!({ "message": "already approved" })))
        );
        assert_eq!(err.server_message(), Some("already approved"));
    }

    #[test]
    fn test_status_error_keeps_text_body() {
        let err = status_error(502, "Bad Gateway", false);
        assert_eq!(err, FolioError::http(502, Some(json!("Bad Gateway"))));
        assert_eq!(status_error(500, "", false), FolioError::http(500, None));
    }

    #[test]
    fn test_unauthorized_with_token_is_session_expired() {
        assert!(status_error(401, "", true).is_session_expired());
        assert_eq!(status_error(401, "", false).status(), Some(401));
        assert!(!status_error(401, "", false).is_session_expired());
        assert!(!status_error(403, "", true).is_session_expired());
    }

    #[test]
    fn test_empty_success_is_null() {
        assert_eq!(parse_success("/x", StatusCode::NO_CONTENT, "").unwrap(), Value::Null);
        assert_eq!(parse_success("/x", StatusCode::OK, " ").unwrap(), Value::Null);
        let err = parse_success("/x", StatusCode::OK, "<html>").unwrap_err();
        assert!(matches!(
            err,
            FolioError::Validation(ValidationError::Decode { .. })
        ));
    }

    #[test]
    fn test_query_pairs_render_scalars() {
        let fp = Fingerprint::builder("book")
            .param("isApproved", false)
            .param("author", "Le Guin")
            .param("page", 2)
            .param("tag", Value::Null)
            .build()
            .unwrap();
        assert_eq!(
            query_pairs(&fp),
            vec![
                ("author".to_string(), "Le Guin".to_string()),
                ("isApproved".to_string(), "false".to_string()),
                ("page".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_verify_response_expiry_optional() {
        let response: VerifyResponse = serde_json::from_str(r#"{"token":"jwt"}"#).unwrap();
        assert_eq!(response.token, "jwt");
        assert!(response.expires_at.is_none());
    }
}
