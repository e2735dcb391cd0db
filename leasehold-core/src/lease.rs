//! Lease envelope.

use serde::{Deserialize, Serialize};

/// A time-bounded claim on an entity held by one connector instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Instance holding the lease.
    pub leased_by: String,

    /// Acquisition time (Unix millis).
    pub leased_at: i64,

    /// Lifetime in milliseconds.
    pub lease_duration_ms: i64,
}

impl Lease {
    pub fn new(leased_by: impl Into<String>, leased_at: i64, lease_duration_ms: i64) -> Self {
        Self {
            leased_by: leased_by.into(),
            leased_at,
            lease_duration_ms,
        }
    }

    /// Returns the instant after which the lease is expired.
    pub fn expires_at(&self) -> i64 {
        self.leased_at.saturating_add(self.lease_duration_ms)
    }

    /// A lease is expired once `now > leased_at + lease_duration`.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at()
    }

    pub fn is_held_by(&self, holder: &str) -> bool {
        self.leased_by == holder
    }

    /// Returns true if `holder` may take this lease at `now`: either it
    /// already holds it or it has expired.
    pub fn is_acquirable_by(&self, holder: &str, now: i64) -> bool {
        self.is_held_by(holder) || self.is_expired(now)
    }
}
