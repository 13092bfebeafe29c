//! # Exchange Store (§4.1)
//!
//! The durable, CAS-updated collection of exchange records. This module
//! defines the [`Store`] trait the engine is generic over; a concrete
//! implementation (a real database, or [`crate::test_utils::MemoryStore`]
//! for tests) provides the actual persistence.

use chrono::Utc;

use crate::error::Result;
use crate::exchange::{Exchange, ExchangeRecord, Meta, State};
use crate::operation;

/// Outcome of a [`Store::update`] or [`Store::complete`] CAS attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write committed.
    Committed,
    /// `sequence` didn't match and the record is still live; caller may
    /// re-read and retry (only `getAuthorizationRequest`, §4.9, actually
    /// does).
    Conflict,
    /// `sequence` didn't match because the record had already reached a
    /// terminal state; the caller's write is a replay.
    Duplicate,
}

/// Durable storage of [`ExchangeRecord`]s, keyed by `(workflow_id,
/// exchange.id)` (§4.1 "Indices").
///
/// Every mutating method enforces the compare-and-swap discipline
/// described in §4.1: a write only commits when the record's current
/// `sequence` matches what the caller last read. The store is the single
/// serialization point for concurrent writers to one exchange — callers
/// must not additionally synchronize in-process.
pub trait Store: Send + Sync {
    /// Inserts a brand-new exchange with `sequence=0, state=pending`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Duplicate`] if `exchange.id` already exists
    /// for this workflow.
    fn insert(
        &self,
        workflow_id: &str,
        exchange: Exchange,
    ) -> impl Future<Output = Result<ExchangeRecord>> + Send;

    /// Reads the current record.
    ///
    /// When `allow_expired` is `false` (the default for all callers except
    /// diagnostics), a record whose `exchange.expires` has passed, or whose
    /// `state` is [`State::Invalid`], is treated as not-found even if a
    /// background evictor has not yet removed it (§4.1 `get`).
    ///
    /// # Errors
    /// Returns [`crate::Error::NotFound`] if no live record exists.
    fn get(
        &self,
        workflow_id: &str,
        id: &str,
        allow_expired: bool,
    ) -> impl Future<Output = Result<ExchangeRecord>> + Send;

    /// Compare-and-swap update: commits only if the record's current
    /// `sequence` equals `exchange.sequence - 1` and its state is
    /// [`State::Pending`] or [`State::Active`] (§4.1 `update`).
    ///
    /// On success the returned record's `sequence` is incremented from the
    /// caller's value.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotFound`] if the record no longer exists,
    /// or [`crate::Error::InvalidState`] on a CAS mismatch against a live
    /// record.
    fn update(
        &self,
        workflow_id: &str,
        exchange: Exchange,
    ) -> impl Future<Output = Result<ExchangeRecord>> + Send;

    /// Compare-and-swap completion: identical CAS discipline to
    /// [`Store::update`], but additionally requires `exchange.state ==
    /// State::Complete` and reacts differently to a lost race (§4.1
    /// `complete`).
    ///
    /// On a CAS mismatch, the store re-reads: if the existing record is
    /// still `pending`/`active`, this returns [`crate::Error::InvalidState`]
    /// (ordinary conflict, not a replay); if the existing record is already
    /// `complete`/`invalid`, this invalidates the record (best-effort) and
    /// returns [`crate::Error::Duplicate`] (§8 S6).
    ///
    /// # Errors
    /// See above.
    fn complete(
        &self,
        workflow_id: &str,
        exchange: Exchange,
    ) -> impl Future<Output = Result<ExchangeRecord>> + Send;

    /// Best-effort, rate-limited recording of the last error an exchange
    /// hit (§4.1 `setLastError`). `exchange.last_error` must already carry
    /// the sanitized error the caller wants persisted.
    ///
    /// After the exchange's `sequence` exceeds
    /// `rate_limit_count`, writes within `rate_limit_window` of
    /// `last_updated` are silently suppressed. Otherwise this performs the
    /// same CAS as [`Store::update`] but without a state constraint — it
    /// may record an error even against a record mid-transition.
    ///
    /// Implementations must never let this fail the caller: errors here
    /// are logged, not propagated (§4.1, §5 propagation policy).
    fn set_last_error(
        &self,
        workflow_id: &str,
        exchange: &Exchange,
        last_updated: chrono::DateTime<Utc>,
        rate_limit_count: u64,
        rate_limit_window: chrono::Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Forces a record to [`State::Invalid`] and resets `meta.expires` to
    /// `now + ttl` (§4.1 `invalidate`).
    ///
    /// Best-effort: implementations log failures internally and must not
    /// propagate them, matching the call sites in [`Store::complete`] and
    /// the processor's top-level error handler (§5).
    fn invalidate(
        &self,
        workflow_id: &str,
        id: &str,
        ttl: chrono::Duration,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Builds the `meta` bookkeeping for a brand-new record (§4.1 `insert`).
#[must_use]
pub fn new_meta(expires: chrono::DateTime<Utc>) -> Meta {
    let now = Utc::now();
    Meta { created: now, updated: now, expires }
}

/// Validates the state precondition for [`Store::update`]/[`Store::complete`]
/// CAS (§4.1): only `pending`/`active` records accept further writes through
/// this path.
///
/// # Errors
/// Returns [`crate::Error::Operation`] if `current` is terminal; callers are
/// expected to have already distinguished this from an ordinary CAS
/// mismatch (see [`CasOutcome`]).
pub fn require_live(current: State) -> Result<()> {
    if current.is_terminal() {
        return Err(operation!("record is already terminal"));
    }
    Ok(())
}
