//! # Credential-Offer and Nonce Endpoints (§4.8)

use serde::{Deserialize, Serialize};

use crate::exchange::Exchange;
use crate::{invalid, Result};

/// `GET <exchangePath>/openid/credential-offer` response body (§4.8
/// "Credential-offer endpoint").
///
/// `credentials` and `credential_configuration_ids` are identical arrays,
/// carried as two spec-version aliases of the same information.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialOfferResponse {
    /// The exchange path clients resolve metadata/endpoints against.
    pub credential_issuer: String,
    /// Offered grant types; only `pre-authorized_code` is ever present.
    pub grants: Grants,
    /// Offered configuration ids (draft-13 spelling).
    pub credentials: Vec<String>,
    /// Offered configuration ids (current spelling), identical to
    /// `credentials`.
    pub credential_configuration_ids: Vec<String>,
}

/// `grants` member of [`CredentialOfferResponse`].
#[derive(Clone, Debug, Serialize)]
pub struct Grants {
    /// `urn:ietf:params:oauth:grant-type:pre-authorized_code`.
    #[serde(rename = "urn:ietf:params:oauth:grant-type:pre-authorized_code")]
    pub pre_authorized_code: PreAuthorizedCodeGrant,
}

/// The pre-authorized-code grant body.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PreAuthorizedCodeGrant {
    /// The code the wallet exchanges at the token endpoint.
    pub pre_authorized_code: String,
}

/// Builds the credential-offer response for `exchange` (§4.8
/// "Credential-offer endpoint").
///
/// `exchange_path` is `<workflowId>/exchanges/<exchangeId>`; `configuration_ids`
/// is the set of `credential_configurations_supported` keys this offer
/// covers (typically all of them, computed by
/// [`crate::oid4vci::metadata::configuration_id`] over
/// `openId.expectedCredentialRequests`).
///
/// # Errors
/// Returns [`crate::Error::DataError`] if the exchange has no
/// pre-authorized code.
pub fn credential_offer(
    exchange: &Exchange,
    exchange_path: &str,
    configuration_ids: Vec<String>,
) -> Result<CredentialOfferResponse> {
    let code = exchange
        .open_id
        .pre_authorized_code
        .clone()
        .ok_or_else(|| invalid!("exchange has no pre-authorized code"))?;
    Ok(CredentialOfferResponse {
        credential_issuer: exchange_path.to_string(),
        grants: Grants { pre_authorized_code: PreAuthorizedCodeGrant { pre_authorized_code: code } },
        credentials: configuration_ids.clone(),
        credential_configuration_ids: configuration_ids,
    })
}

/// `GET <exchangePath>/openid/nonce` response body (§4.8 "Nonce endpoint").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NonceResponse {
    /// Always `exchange.id`.
    pub c_nonce: String,
}

/// Builds the nonce endpoint response: `exchange.id` serves directly as the
/// `c_nonce` (§4.8 "Nonce endpoint").
#[must_use]
pub fn nonce(exchange: &Exchange) -> NonceResponse {
    NonceResponse { c_nonce: exchange.id.clone() }
}

/// Whether `definition` names no credential configuration at all, used by
/// callers deciding whether an offer is well-formed before returning it.
#[must_use]
pub fn has_configurations(exchange: &Exchange) -> bool {
    !exchange.open_id.expected_credential_requests.is_empty()
}
