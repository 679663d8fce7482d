use serde::{Deserialize, Serialize};

/// Response of `query-status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStatus {
    /// Whether vCPUs are running.
    pub running: bool,

    /// Run state, e.g. `running`, `paused`, `suspended`.
    pub status: String,
}

/// One entry of `query-mice`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseInfo {
    /// Device name.
    pub name: String,

    /// Index accepted by the `mouse_set` monitor command.
    pub index: i64,

    /// Whether this device currently receives pointer input.
    pub current: bool,

    /// Whether the device reports absolute coordinates (tablet).
    pub absolute: bool,
}

/// Index of the first mouse whose `absolute` flag equals `absolute`.
pub(crate) fn first_with_absolute(mice: &[MouseInfo], absolute: bool) -> Option<i64> {
    mice.iter().find(|m| m.absolute == absolute).map(|m| m.index)
}
