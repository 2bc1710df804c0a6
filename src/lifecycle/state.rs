//! Token state classification.

use crate::credentials::TokenRecord;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;

/// Where a (tenant, marketplace) token sits in its lifecycle.
///
/// ```text
/// Unlinked → LinkedValid → LinkedNearExpiry → LinkedExpired
///                 ↑                 │                │
///                 └──── refresh ────┴────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// No token record exists
    Unlinked,
    /// More than the refresh threshold remains
    LinkedValid,
    /// Still valid, but within the refresh threshold
    LinkedNearExpiry,
    /// `expires_at` has passed
    LinkedExpired,
}

impl TokenState {
    pub fn classify(record: Option<&TokenRecord>, now: DateTime<Utc>, threshold: Duration) -> Self {
        let Some(record) = record else {
            return TokenState::Unlinked;
        };

        let remaining = record.expires_at - now;
        if remaining > threshold {
            TokenState::LinkedValid
        } else if remaining > Duration::zero() {
            TokenState::LinkedNearExpiry
        } else {
            TokenState::LinkedExpired
        }
    }

    pub fn needs_refresh(&self) -> bool {
        matches!(self, TokenState::LinkedNearExpiry | TokenState::LinkedExpired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Unlinked => "unlinked",
            TokenState::LinkedValid => "linked_valid",
            TokenState::LinkedNearExpiry => "linked_near_expiry",
            TokenState::LinkedExpired => "linked_expired",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
