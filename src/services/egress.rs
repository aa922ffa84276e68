//! Egress path selection
//!
//! Every logical request starts on the direct path. A block signal on the
//! direct path escalates to the bypass path when one is configured; transient
//! failures stay on the path they happened on. The selector holds no memory
//! between calls.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Network path used for one upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressPath {
    Direct,
    Bypass,
}

impl EgressPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgressPath::Direct => "direct",
            EgressPath::Bypass => "bypass",
        }
    }
}

impl fmt::Display for EgressPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed upstream attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Access denied or anti-automation challenge
    Blocked,
    /// Network error, timeout, rate limit, or upstream 5xx
    Transient,
    /// Unrecoverable for this request
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Blocked => "blocked",
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless per-attempt egress policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressSelector {
    bypass_available: bool,
}

impl EgressSelector {
    pub fn new(bypass_available: bool) -> Self {
        Self { bypass_available }
    }

    pub fn bypass_available(&self) -> bool {
        self.bypass_available
    }

    /// Path for the first attempt of a logical request
    pub fn initial(&self) -> EgressPath {
        EgressPath::Direct
    }

    /// Path for the attempt after one that failed with `class` on `current`.
    /// `None` means the failure is terminal for this request.
    pub fn next(&self, current: EgressPath, class: FailureClass) -> Option<EgressPath> {
        match (class, current) {
            (FailureClass::Blocked, EgressPath::Direct) if self.bypass_available => {
                Some(EgressPath::Bypass)
            }
            (FailureClass::Blocked, _) => None,
            (FailureClass::Transient, path) => Some(path),
            (FailureClass::Fatal, _) => None,
        }
    }
}
