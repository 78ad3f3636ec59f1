//! Client authentication for the OpenAI-compatible endpoints.
//!
//! Client keys are accepted from `Authorization: Bearer` or `x-api-key`.
//! With no `client_keys` configured every request is anonymous.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::core::config::ClientKeyConfig;
use crate::core::error::Result;
use crate::core::AppError;

pub const ANONYMOUS: &str = "anonymous";

/// Hash an API key using SHA-256.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Extract Bearer token from Authorization header.
pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// `x-api-key` takes priority over the bearer token.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| extract_bearer(headers))
}

/// Verify the client key and return the matching entry.
///
/// * `Ok(None)` - authentication disabled (no client keys configured)
/// * `Err(AppError::Unauthorized)` - missing, unknown or disabled key
pub fn verify_auth<'a>(
    headers: &HeaderMap,
    clients: &'a [ClientKeyConfig],
) -> Result<Option<&'a ClientKeyConfig>> {
    if clients.is_empty() {
        return Ok(None);
    }

    let provided = extract_api_key(headers).ok_or(AppError::Unauthorized)?;
    let provided_hash = hash_key(provided);

    match clients.iter().find(|c| hash_key(&c.key) == provided_hash) {
        Some(client) if client.enabled => {
            tracing::debug!(client_key = %client.name, "Authentication successful");
            Ok(Some(client))
        }
        Some(client) => {
            tracing::warn!(client_key = %client.name, "Disabled client key rejected");
            Err(AppError::Unauthorized)
        }
        None => {
            tracing::warn!(key_hash = &provided_hash[..8], "Unknown client key rejected");
            Err(AppError::Unauthorized)
        }
    }
}

/// Exact names or `prefix*` wildcards; an empty list allows everything.
pub fn is_model_allowed(allowed: &[String], model: &str) -> bool {
    allowed.is_empty()
        || allowed.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => model.starts_with(prefix),
            None => pattern == model,
        })
}

pub fn check_model_permission(client: Option<&ClientKeyConfig>, model: &str) -> Result<()> {
    match client {
        Some(client) if !is_model_allowed(&client.allowed_models, model) => {
            Err(AppError::Forbidden(format!(
                "model '{}' is not allowed for this key",
                model
            )))
        }
        _ => Ok(()),
    }
}

/// Name used in logs and metric tags.
pub fn client_name(client: Option<&ClientKeyConfig>) -> String {
    client
        .map(|c| c.name.clone())
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn client(name: &str, key: &str, enabled: bool, allowed: &[&str]) -> ClientKeyConfig {
        ClientKeyConfig {
            name: name.into(),
            key: key.into(),
            enabled,
            allowed_models: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_hash_key() {
        let hash = hash_key("sk-test-key-123");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_key("sk-test-key-123"));
        assert_ne!(hash, hash_key("different-key"));
    }

    #[test]
    fn test_extract_bearer_wrong_format() {
        assert_eq!(extract_bearer(&headers("authorization", "Basic dXNlcjpwYXNz")), None);
        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn test_x_api_key_preferred() {
        let mut h = headers("authorization", "Bearer sk-bearer");
        h.insert("x-api-key", "sk-header".parse().unwrap());
        assert_eq!(extract_api_key(&h), Some("sk-header"));
    }

    #[test]
    fn test_no_clients_means_anonymous() {
        assert_matches!(verify_auth(&HeaderMap::new(), &[]), Ok(None));
        assert_eq!(client_name(None), ANONYMOUS);
    }

    #[test]
    fn test_verify_auth() {
        let clients = vec![
            client("team-a", "sk-a", true, &[]),
            client("team-b", "sk-b", false, &[]),
        ];
        let found = verify_auth(&headers("authorization", "Bearer sk-a"), &clients).unwrap();
        assert_eq!(found.map(|c| c.name.as_str()), Some("team-a"));

        assert_matches!(
            verify_auth(&headers("x-api-key", "sk-b"), &clients),
            Err(AppError::Unauthorized)
        );
        assert_matches!(
            verify_auth(&headers("x-api-key", "sk-zzz"), &clients),
            Err(AppError::Unauthorized)
        );
        assert_matches!(verify_auth(&HeaderMap::new(), &clients), Err(AppError::Unauthorized));
    }

    #[test]
    fn test_model_allow_list() {
        let allowed = vec!["gpt-4o".to_string(), "claude-*".to_string()];
        assert!(is_model_allowed(&allowed, "gpt-4o"));
        assert!(is_model_allowed(&allowed, "claude-sonnet"));
        assert!(!is_model_allowed(&allowed, "gpt-4o-mini"));
        assert!(is_model_allowed(&[], "anything"));

        let restricted = client("c", "k", true, &["gpt-*"]);
        assert!(check_model_permission(Some(&restricted), "gpt-4o").is_ok());
        assert_matches!(
            check_model_permission(Some(&restricted), "gemini-pro"),
            Err(AppError::Forbidden(_))
        );
        assert!(check_model_permission(None, "gemini-pro").is_ok());
    }
}
