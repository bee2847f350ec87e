//! `Instant` is monotonic and deliberately not `Serialize` — the read-model
//! types that cross the boundary to the embedding binary need a number, so
//! these helpers render an `Instant` as "seconds elapsed since now" at the
//! moment of serialization.

use std::time::Instant;

pub fn as_secs_ago<S>(instant: &Instant, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(instant.elapsed().as_secs_f64())
}

pub fn as_secs_ago_opt<S>(instant: &Option<Instant>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match instant {
        Some(i) => serializer.serialize_some(&i.elapsed().as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// For timestamps that name a point in the future (e.g. `blocked_until`):
/// seconds remaining, zero once passed.
pub fn as_secs_remaining_opt<S>(instant: &Option<Instant>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match instant {
        Some(i) => serializer.serialize_some(&i.saturating_duration_since(Instant::now()).as_secs_f64()),
        None => serializer.serialize_none(),
    }
}
