//! Connect failure classification.

use pethub_core::Error;
use serde::Serialize;

/// What a failed lamp connect most likely means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    /// The lamp wants pairing or rejected our credentials; usually a
    /// neighbour's lamp.
    Authorization,
    /// The lamp did not answer in time.
    Timeout,
    General,
}

const AUTHORIZATION_HINTS: &[&str] = &[
    "auth",
    "pair",
    "encrypt",
    "insufficient",
    "permission",
];

pub fn classify_failure(error: &Error) -> FailureClass {
    let error = error.root_cause();
    if error.is_authorization() {
        return FailureClass::Authorization;
    }
    if error.is_timeout() {
        return FailureClass::Timeout;
    }

    let message = error.to_string().to_ascii_lowercase();
    if AUTHORIZATION_HINTS.iter().any(|hint| message.contains(hint)) {
        FailureClass::Authorization
    } else if message.contains("timed out") || message.contains("timeout") {
        FailureClass::Timeout
    } else {
        FailureClass::General
    }
}
