//! # Engine Configuration (§4.13)
//!
//! The engine does not load configuration itself — that is the hosting
//! process's job — but it exposes the small set of durations and limits the
//! specification calls out as "should be configuration" rather than
//! hard-coded: the TTL defaults, the `setLastError` rate-limit gate, and the
//! workflow structural limits (§6).

use std::time::Duration;

/// Tunable constants governing exchange lifetime, rate limiting, and
/// workflow structural limits.
///
/// Construct with [`EngineConfig::default`] and override individual fields;
/// loading these from environment variables or a file is left to the host
/// process.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Default exchange TTL when a creation request specifies neither `ttl`
    /// nor `expires` (§6). 15 minutes.
    pub exchange_ttl_default: Duration,

    /// Maximum allowed exchange TTL from `now` (§6). 48 hours.
    pub exchange_ttl_max: Duration,

    /// Default processor deadline, bounded further by `exchange.expires`
    /// (§4.6 step 3). 15 minutes.
    pub processor_deadline_default: Duration,

    /// Number of writes after which `setLastError` starts rate-limiting
    /// (§4.1). 5.
    pub last_error_rate_limit_count: u64,

    /// Minimum spacing between rate-limited `setLastError` writes (§4.1).
    /// 1 second.
    pub last_error_rate_limit_window: Duration,

    /// TTL applied to a record when it is force-invalidated on replay
    /// (§4.1 `invalidate`). 3 days.
    pub invalidated_record_ttl: Duration,

    /// Maximum lifetime of an OID4VCI access token, bounded further by
    /// `meta.expires` (§4.8). 15 minutes.
    pub access_token_ttl_max: Duration,

    /// Lifetime of a cached OID4VP authorization request object, grounded in
    /// the teacher's `vercre_verifier::state::Expire::Request` duration.
    /// 5 minutes.
    pub vpr_request_object_ttl: Duration,

    /// Maximum number of issuer instances a workflow may declare (§6). 10.
    pub max_issuer_instances: usize,

    /// Maximum number of OID4VP client profiles a workflow may declare
    /// (§6). 10.
    pub max_client_profiles: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exchange_ttl_default: Duration::from_secs(15 * 60),
            exchange_ttl_max: Duration::from_secs(48 * 60 * 60),
            processor_deadline_default: Duration::from_secs(15 * 60),
            last_error_rate_limit_count: 5,
            last_error_rate_limit_window: Duration::from_secs(1),
            invalidated_record_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            access_token_ttl_max: Duration::from_secs(15 * 60),
            vpr_request_object_ttl: Duration::from_secs(5 * 60),
            max_issuer_instances: 10,
            max_client_profiles: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.exchange_ttl_default, Duration::from_secs(900));
        assert_eq!(cfg.exchange_ttl_max, Duration::from_secs(48 * 3600));
        assert_eq!(cfg.last_error_rate_limit_count, 5);
        assert_eq!(cfg.last_error_rate_limit_window, Duration::from_secs(1));
        assert_eq!(cfg.invalidated_record_ttl, Duration::from_secs(3 * 86400));
    }
}
