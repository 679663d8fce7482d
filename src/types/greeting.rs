use std::fmt;

use serde::{Deserialize, Serialize};

/// The `{"QMP": {...}}` banner QEMU writes as soon as a monitor connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    /// Banner body.
    #[serde(rename = "QMP")]
    pub qmp: QmpInfo,
}

impl Greeting {
    /// Whether the peer advertises `capability` (e.g. `"oob"`).
    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        self.qmp.capabilities.iter().any(|c| c == capability)
    }
}

/// Body of the greeting banner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpInfo {
    /// Emulator version.
    pub version: QmpVersion,

    /// Capabilities that may be enabled during negotiation.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// QEMU version information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersion {
    /// Numeric version.
    pub qemu: QmpVersionNumber,

    /// Downstream package string, often empty.
    #[serde(default)]
    pub package: String,
}

/// Numeric `major.minor.micro` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QmpVersionNumber {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Micro version.
    pub micro: u64,
}

impl fmt::Display for QmpVersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}
