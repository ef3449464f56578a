//! Grant result classification
//!
//! Distinguishes a successful grant from a refusal (the key is exhausted and
//! must be enforced) and from a transient failure (the report cycle is
//! cancelled and retried on the next scan). Result codes follow the Diameter
//! credit-control numbering used by the online-charging authority.

use serde::{Deserialize, Serialize};

pub const DIAMETER_SUCCESS: u32 = 2001;
pub const DIAMETER_LIMITED_SUCCESS: u32 = 2002;
pub const END_USER_SERVICE_DENIED: u32 = 4010;
pub const CREDIT_LIMIT_REACHED: u32 = 4012;
pub const AUTHORIZATION_REJECTED: u32 = 5003;
pub const USER_UNKNOWN: u32 = 5030;
pub const RATING_FAILED: u32 = 5031;

/// Result codes that refuse further credit for the key.
const DENIAL_CODES: &[u32] = &[
    END_USER_SERVICE_DENIED,
    CREDIT_LIMIT_REACHED,
    AUTHORIZATION_REJECTED,
    USER_UNKNOWN,
    RATING_FAILED,
];

/// Outcome of a grant response as far as the credit is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantOutcome {
    /// Credit granted, extend allowance
    Granted,
    /// Credit refused or limit reached, treat the key as exhausted
    Denied,
    /// Failure unrelated to the subscriber's credit, retry next scan
    Transient,
}

impl GrantOutcome {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            GrantOutcome::Granted => "granted",
            GrantOutcome::Denied => "denied",
            GrantOutcome::Transient => "transient",
        }
    }
}

/// Classify a credit-control result code.
///
/// Any 2xxx code is a grant. The fixed set of credit refusals is Denied.
/// Everything else (protocol errors, 3xxx, unknown codes) is Transient.
pub fn classify_result_code(result_code: u32) -> GrantOutcome {
    match result_code {
        2000..=2999 => GrantOutcome::Granted,
        code if DENIAL_CODES.contains(&code) => GrantOutcome::Denied,
        _ => GrantOutcome::Transient,
    }
}

/// Classify a usage-monitoring response, which only carries a success flag.
pub fn classify_success(success: bool) -> GrantOutcome {
    if success {
        GrantOutcome::Granted
    } else {
        GrantOutcome::Denied
    }
}
