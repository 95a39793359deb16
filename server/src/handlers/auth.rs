use crate::AppState;
use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use hmac::{Hmac, KeyInit, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The authenticated user id from the `Authorization: Bearer` header.
///
/// Without `AUTH_SECRET` the bearer token is taken as the user id directly
/// (trusted-gateway deployments). With a secret, tokens are
/// `user_id.hmac_hex` and the signature is verified.
pub struct AuthedUser(pub String);

impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;
        if token.is_empty() {
            return Err(ApiError::Unauthorized);
        }

        let Some(secret) = &state.config.auth_secret else {
            return Ok(AuthedUser(token.to_string()));
        };

        let (user_id, signature) = token.rsplit_once('.').ok_or(ApiError::Unauthorized)?;
        let signature = hex::decode(signature).map_err(|_| ApiError::Unauthorized)?;
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ApiError::Unauthorized)?;
        mac.update(user_id.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ApiError::Unauthorized)?;
        Ok(AuthedUser(user_id.to_string()))
    }
}

/// Signs a user id the way the extractor verifies it. Used by tests and by
/// deployments minting their own tokens.
pub fn sign_user_token(secret: &str, user_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(user_id.as_bytes());
    format!("{user_id}.{}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_token_splits_and_verifies() {
        let token = sign_user_token("s3cret", "alice");
        let (user_id, signature) = token.rsplit_once('.').unwrap();
        assert_eq!(user_id, "alice");
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(b"alice");
        mac.verify_slice(&hex::decode(signature).unwrap()).unwrap();
    }
}
