use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hyper::{Body, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{Middleware, Next, RequestContext};
use crate::error::GatewayResult;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthParams {
    pub jwt_secret: Option<String>,
    /// Accepted alias for `jwt_secret`.
    pub secret_key: Option<String>,
    pub jwt_issuer: Option<String>,
    pub token_location: TokenLocation,
    pub token_name: Option<String>,
    /// Path prefixes that bypass authentication.
    pub skip_paths: Vec<String>,
    /// Accepted alias for `skip_paths`.
    pub public_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenLocation {
    #[default]
    Header,
    Cookie,
    Query,
}

impl AuthParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.secret().is_empty() {
            return Err("jwt_secret or secret_key is required for auth middleware".to_string());
        }
        Ok(())
    }

    pub fn secret(&self) -> &str {
        self.jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.secret_key.as_deref())
            .unwrap_or("")
    }

    fn token_name(&self) -> &str {
        self.token_name.as_deref().unwrap_or("Authorization")
    }

    fn skip_prefixes(&self) -> &[String] {
        if !self.skip_paths.is_empty() {
            &self.skip_paths
        } else {
            &self.public_paths
        }
    }
}

/// Claims carried by accepted tokens.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub iss: Option<String>,
}

/// JWT authentication, HS256 only. Any other `alg` — including `none` — is
/// rejected outright.
pub struct AuthMiddleware {
    params: AuthParams,
}

impl AuthMiddleware {
    pub fn new(params: AuthParams) -> GatewayResult<Self> {
        params
            .validate()
            .map_err(crate::error::GatewayError::config_validation)?;
        Ok(Self { params })
    }

    fn extract_token(&self, req: &Request<Body>) -> Result<String, String> {
        let name = self.params.token_name();
        match self.params.token_location {
            TokenLocation::Header => {
                let value = req
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| format!("{} header not found", name))?;
                Ok(value
                    .strip_prefix("Bearer ")
                    .unwrap_or(value)
                    .to_string())
            }
            TokenLocation::Cookie => {
                let cookies = req
                    .headers()
                    .get(hyper::header::COOKIE)
                    .and_then(|v| v.to_str().ok())
                    .ok_or("token cookie not found")?;
                cookies
                    .split(';')
                    .filter_map(|pair| pair.trim().split_once('='))
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| value.to_string())
                    .ok_or_else(|| "token cookie not found".to_string())
            }
            TokenLocation::Query => {
                let query = req.uri().query().unwrap_or("");
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.into_owned())
                    .ok_or_else(|| "token query parameter not found".to_string())
            }
        }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request<Body>,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> GatewayResult<Response<Body>> {
        let path = req.uri().path();
        if self
            .params
            .skip_prefixes()
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return next.run(req, ctx).await;
        }

        let token = match self.extract_token(&req) {
            Ok(token) => token,
            Err(reason) => {
                warn!(error = %reason, "Failed to extract token");
                return unauthorized();
            }
        };

        let claims = match verify_hs256(
            &token,
            self.params.secret(),
            self.params.jwt_issuer.as_deref(),
        ) {
            Ok(claims) => claims,
            Err(reason) => {
                warn!(error = %reason, "Invalid token");
                return unauthorized();
            }
        };

        debug!(user_id = %claims.user_id, email = %claims.email, "Request authenticated");

        let header_or_empty = |value: &str| {
            hyper::header::HeaderValue::from_str(value)
                .unwrap_or_else(|_| hyper::header::HeaderValue::from_static(""))
        };
        let headers = req.headers_mut();
        headers.insert("X-User-ID", header_or_empty(&claims.user_id));
        headers.insert("X-User-Email", header_or_empty(&claims.email));
        headers.insert("X-User-Roles", header_or_empty(&claims.roles.join(",")));

        next.run(req, ctx).await
    }

    fn name(&self) -> &str {
        "auth"
    }
}

fn unauthorized() -> GatewayResult<Response<Body>> {
    Ok(Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .body(Body::from("Unauthorized"))?)
}

/// Verify an HS256 token and return its claims.
pub fn verify_hs256(token: &str, secret: &str, issuer: Option<&str>) -> Result<Claims, String> {
    let mut parts = token.split('.');
    let (header_b64, payload_b64, signature_b64) = match (parts.next(), parts.next(), parts.next())
    {
        (Some(h), Some(p), Some(s)) if parts.next().is_none() => (h, p, s),
        _ => return Err("malformed token".to_string()),
    };

    let header: serde_json::Value = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| "invalid header encoding")?,
    )
    .map_err(|_| "invalid header JSON")?;

    if header.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
        return Err(format!(
            "unexpected signing method: {}",
            header.get("alg").and_then(|v| v.as_str()).unwrap_or("?")
        ));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| "invalid signature encoding")?;
    let signing_input = format!("{}.{}", header_b64, payload_b64);
    if hmac_sha256(secret.as_bytes(), signing_input.as_bytes()) != signature {
        return Err("signature mismatch".to_string());
    }

    let claims: Claims = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| "invalid payload encoding")?,
    )
    .map_err(|_| "invalid claims JSON")?;

    if let Some(exp) = claims.exp {
        if unix_now() > exp {
            return Err("token expired".to_string());
        }
    }

    if let Some(expected) = issuer {
        if claims.iss.as_deref() != Some(expected) {
            return Err("invalid token issuer".to_string());
        }
    }

    Ok(claims)
}

/// Mint an HS256 token. Used by operators issuing service tokens and by
/// tests.
pub fn sign_hs256(payload: &serde_json::Value, secret: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    let signing_input = format!("{}.{}", header, payload);
    let signature = URL_SAFE_NO_PAD.encode(hmac_sha256(secret.as_bytes(), signing_input.as_bytes()));
    format!("{}.{}", signing_input, signature)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> Vec<u8> {
    const BLOCK: usize = 64;
    let mut k = if key.len() > BLOCK {
        Sha256::digest(key).to_vec()
    } else {
        key.to_vec()
    };
    k.resize(BLOCK, 0);

    let mut ipad = vec![0x36u8; BLOCK];
    let mut opad = vec![0x5cu8; BLOCK];
    for i in 0..BLOCK {
        ipad[i] ^= k[i];
        opad[i] ^= k[i];
    }

    let mut inner = Sha256::new();
    inner.update(&ipad);
    inner.update(msg);
    let inner = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(&opad);
    outer.update(inner);
    outer.finalize().to_vec()
}
