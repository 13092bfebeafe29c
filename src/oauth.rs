//! # OAuth 2.0 Types
//!
//! The small slice of [RFC 6749](https://www.rfc-editor.org/rfc/rfc6749.html)
//! and its extensions the engine needs: the grant types used by the OID4VCI
//! token endpoint, and the bearer token shape returned from it.

use serde::{Deserialize, Serialize};

/// OAuth 2.0 / OID4VCI grant types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum GrantType {
    /// `urn:ietf:params:oauth:grant-type:pre-authorized_code`. The only
    /// grant type the virtual authorization server accepts (§4.8).
    #[serde(rename = "urn:ietf:params:oauth:grant-type:pre-authorized_code")]
    PreAuthorizedCode,

    /// `authorization_code`. Not currently issued by this engine, but
    /// recognized so workflow metadata can name it as unsupported.
    #[serde(rename = "authorization_code")]
    AuthorizationCode,
}

/// Access token response returned by the token endpoint (§4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The minted `at+jwt` access token.
    pub access_token: String,

    /// Always `"bearer"`.
    pub token_type: String,

    /// Seconds until `access_token` expires.
    pub expires_in: i64,
}
