//! JWT signing for backend-bound requests
//!
//! Two tokens are issued with the shared HS256 secret:
//!
//! - `X-Upload-Api-Request` on pre-authorization calls, so the backend knows
//!   the call came from this proxy.
//! - `X-Upload-Multipart-Fields` on forwarded requests, listing every form
//!   field the proxy rewrote. The backend must only trust rewritten fields
//!   named in this manifest.
//!
//! # Example
//!
//! ```
//! use hayate::upload::signer::Signer;
//! use std::collections::BTreeMap;
//!
//! let signer = Signer::new_hs256("shared-secret");
//! let mut fields = BTreeMap::new();
//! fields.insert("file".to_string(), "/tmp/uploads/file123".to_string());
//!
//! let token = signer.sign_rewritten_fields(&fields).unwrap();
//! let claims = signer.verify_rewritten_fields(&token).unwrap();
//! assert_eq!(claims.rewritten_fields, fields);
//! ```

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Header carrying the signed field manifest
pub const REWRITTEN_FIELDS_HEADER: &str = "X-Upload-Multipart-Fields";

/// Header carrying the signed pre-authorization marker
pub const API_REQUEST_HEADER: &str = "X-Upload-Api-Request";

/// Issuer of every token
pub const ISSUER: &str = "hayate";

const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Signing errors
#[derive(Debug, thiserror::Error)]
#[error("JWT error: {0}")]
pub struct SignerError(#[from] jsonwebtoken::errors::Error);

/// Claims of the pre-authorization marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequestClaims {
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
}

/// Claims of the rewritten-field manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewrittenFieldsClaims {
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
    /// Form field name → local path, or remote object id for remote-only saves
    pub rewritten_fields: BTreeMap<String, String>,
}

/// HS256 token signer
pub struct Signer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl Signer {
    /// Create a signer with a shared secret
    pub fn new_hs256(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Sign the `X-Upload-Api-Request` marker
    pub fn sign_api_request(&self) -> Result<String, SignerError> {
        let (iat, exp) = issued_now();
        let claims = ApiRequestClaims {
            iss: ISSUER.to_string(),
            iat,
            exp,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Sign the `X-Upload-Multipart-Fields` manifest
    pub fn sign_rewritten_fields(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, SignerError> {
        let (iat, exp) = issued_now();
        let claims = RewrittenFieldsClaims {
            iss: ISSUER.to_string(),
            iat,
            exp,
            rewritten_fields: fields.clone(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Decode and validate a field manifest
    pub fn verify_rewritten_fields(&self, token: &str) -> Result<RewrittenFieldsClaims, SignerError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_aud = false;

        Ok(decode::<RewrittenFieldsClaims>(token, &self.decoding_key, &validation)?.claims)
    }
}

fn issued_now() -> (u64, u64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs(), (now + TOKEN_LIFETIME).as_secs())
}
