//! An engine for driving multi-step exchanges between a relying party and a
//! holder's wallet, transported over VC-API, [OpenID for Verifiable Credential
//! Issuance](https://openid.net/specs/openid-4-verifiable-credential-issuance-1_0.html),
//! [OpenID for Verifiable Presentations](https://openid.net/specs/openid-4-verifiable-presentations-1_0.html),
//! and a lightweight invite-request protocol.
//!
//! # Design
//!
//! An [`exchange::Exchange`] is a persistent, single-use session of a
//! [`workflow::Workflow`] template. [`processor::Processor`] is the state
//! machine core: it evaluates one step at a time, decides whether client
//! input is required, runs issuance, and advances or completes the exchange.
//! The three protocol adapters (`vcapi`, `oid4vci`, `oid4vp`) and the
//! invite-request adapter translate their respective wire formats into calls
//! onto the processor; none of them carry state of their own beyond the
//! exchange record.
//!
//! Callers provide a [`capability::Provider`] implementation wiring the
//! engine to a concrete [`exchange::store::Store`], DID resolver, signer,
//! template evaluator and remote capability client. See [`test_utils`] for an
//! in-memory implementation used by this crate's own tests.
//!
//! # Feature Flags
//!
//! The following features are on by default:
//!
//! * `oid4vci` - Enables the OpenID4VCI adapter.
//! * `oid4vp` - Enables the OpenID4VP adapter.

pub mod capability;
pub mod config;
pub mod core;
pub mod error;
pub mod exchange;
pub mod invite;
pub mod issuance;
pub mod oauth;
#[cfg(feature = "oid4vci")]
pub mod oid4vci;
#[cfg(feature = "oid4vp")]
pub mod oid4vp;
pub mod processor;
pub mod template;
pub mod vcapi;
pub mod verify;
pub mod w3c_vc;
pub mod workflow;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{Error, Result};

/// Re-export DID resolution types used at the engine's boundary.
pub mod did {
    pub use credibil_did::*;
}

/// Re-export cryptographic primitives used at the engine's boundary.
pub mod infosec {
    pub use credibil_infosec::*;
}
