//! Authentication gate for session tokens carried in a cookie.
//!
//! # Overview
//!
//! 1. `POST /jwt` turns the request body into [`Claims`] and signs them with
//!    HS256 using the server-held secret. The token is valid for 5 hours.
//! 2. The token is returned in the HTTP-only `token` cookie. In production the
//!    cookie is `Secure; SameSite=None` so the separately hosted web client can
//!    send it cross-site.
//! 3. Protected handlers take a [`Session`] argument. Extraction reads the
//!    cookie and verifies signature and expiry before the handler body runs;
//!    failures reject the request with 401.
//! 4. Handlers that touch an owned resource call [`authorize_owner`], the one
//!    predicate deciding whether the session's email owns it (403 otherwise).
//!
//! There is no server-side session store: a token is valid exactly when its
//! signature checks out and `exp` has not passed.
//!
//! # Example
//!
//! ```rust
//! use merathon_server::auth::TokenSigner;
//! use serde_json::json;
//!
//! let signer = TokenSigner::new("secret");
//! let body = json!({"email": "runner@example.com"});
//! let token = signer.issue(body.as_object().unwrap().clone()).unwrap();
//!
//! let claims = signer.verify(&token).unwrap();
//! assert_eq!(claims.email, "runner@example.com");
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, trace};

use crate::error::ApiError;

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "token";

/// How long an issued token stays valid.
pub const TOKEN_TTL: Duration = Duration::from_secs(5 * 60 * 60);

/// Errors from issuing, verifying or authorizing a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The request carried no session cookie.
    #[error("missing session cookie")]
    MissingToken,

    /// Signature, structure or algorithm check failed.
    #[error("invalid session token")]
    InvalidToken,

    /// The token's `exp` has passed.
    #[error("session token expired")]
    Expired,

    /// The session's email does not own the resource.
    #[error("session does not own this resource")]
    NotOwner,

    /// Claims submitted for signing had no usable `email`.
    #[error("claims must include a non-empty email")]
    MissingEmail,

    /// The token could not be encoded.
    #[error("failed to sign session token: {0}")]
    Signing(String),
}

/// Claims carried in a session token.
///
/// `email` identifies the session holder. Any other claims submitted at
/// login are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub email: String,

    /// Issued-at, seconds since the Unix epoch.
    pub iat: i64,

    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Signs and verifies session tokens with a shared HMAC secret.
#[derive(Clone)]
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenSigner {
    /// Creates a signer issuing tokens valid for [`TOKEN_TTL`].
    pub fn new(secret: &str) -> Self {
        Self::with_ttl(secret, TOKEN_TTL)
    }

    pub fn with_ttl(secret: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Signs the given claims, stamping `iat` and `exp` from the current time.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingEmail`] if `claims` has no non-empty string `email`
    /// - [`AuthError::Signing`] if encoding fails
    pub fn issue(&self, claims: Map<String, Value>) -> Result<String, AuthError> {
        self.issue_at(claims, Utc::now())
    }

    /// Like [`issue`](Self::issue) with an explicit issue time.
    ///
    /// Client-supplied `iat`/`exp` values are discarded.
    pub fn issue_at(
        &self,
        mut claims: Map<String, Value>,
        issued_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let email = match claims.remove("email") {
            Some(Value::String(email)) if !email.trim().is_empty() => email,
            _ => return Err(AuthError::MissingEmail),
        };
        claims.remove("iat");
        claims.remove("exp");

        let iat = issued_at.timestamp();
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            email,
            iat,
            exp: iat.saturating_add(ttl_secs),
            extra: claims,
        };

        trace!(email = %claims.email, exp = claims.exp, "Issuing session token");

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| AuthError::Signing(err.to_string()))
    }

    /// Verifies signature and expiry and returns the decoded claims.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Expired`] if `exp` is in the past
    /// - [`AuthError::InvalidToken`] for every other failure
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            })
    }
}

/// Builds the cookie that carries a freshly issued token.
pub fn session_cookie(token: String, production: bool) -> Cookie<'static> {
    let same_site = if production {
        SameSite::None
    } else {
        SameSite::Strict
    };

    Cookie::build((SESSION_COOKIE, token))
        .http_only(true)
        .secure(production)
        .same_site(same_site)
        .path("/")
        .build()
}

/// Builds a cookie that clears the session cookie in the browser.
pub fn removal_cookie(production: bool) -> Cookie<'static> {
    let mut cookie = session_cookie(String::new(), production);
    cookie.make_removal();
    cookie
}

/// Decides whether the session holder owns a resource.
///
/// Emails are compared case-insensitively. A resource without an owner is
/// owned by nobody.
pub fn authorize_owner(claims: &Claims, owner_email: Option<&str>) -> Result<(), AuthError> {
    match owner_email {
        Some(owner) if owner.trim().eq_ignore_ascii_case(claims.email.trim()) => Ok(()),
        _ => Err(AuthError::NotOwner),
    }
}

/// Verified claims of the request's session.
///
/// Taking this as a handler argument makes the route protected: the handler
/// runs only after the cookie has been verified.
#[derive(Debug, Clone)]
pub struct Session(pub Claims);

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
    Arc<TokenSigner>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let signer = Arc::<TokenSigner>::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);

        let token = jar
            .get(SESSION_COOKIE)
            .map(|cookie| cookie.value())
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let claims = signer.verify(token).map_err(|err| {
            debug!(error = %err, path = %parts.uri.path(), "Session verification failed");
            err
        })?;

        trace!(email = %claims.email, "Session verified");
        Ok(Session(claims))
    }
}
