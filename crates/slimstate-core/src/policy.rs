//! Run-wide deferral flags
//!
//! Passed explicitly into resolution rather than read from global state.
//! The state snapshot itself is loaded separately; this value only carries
//! what the user asked for.

use serde::{Deserialize, Serialize};

/// `--defer` / `--favor-state` as given on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferralPolicy {
    /// Substitute unbuilt upstream nodes with their prior-state records
    pub defer: bool,

    /// Prefer state over the current environment without checking existence
    pub favor_state: bool,
}

impl DeferralPolicy {
    /// Build a policy, rejecting `favor_state` without `defer`
    pub fn new(defer: bool, favor_state: bool) -> Result<Self, PolicyError> {
        if favor_state && !defer {
            return Err(PolicyError::FavorStateWithoutDefer);
        }

        Ok(Self { defer, favor_state })
    }

    /// No deferral at all
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.defer
    }
}

/// Flag combinations that make no sense
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("--favor-state requires --defer")]
    FavorStateWithoutDefer,
}
