use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

use super::decode_value;

/// QMP timestamp attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since epoch.
    pub seconds: i64,

    /// Microseconds within the second.
    pub microseconds: i64,
}

impl Timestamp {
    /// Convert to wall-clock time. Negative stamps (QEMU uses `-1` when the
    /// host clock is unavailable) yield `None`.
    #[must_use]
    pub fn to_system_time(self) -> Option<SystemTime> {
        let secs = u64::try_from(self.seconds).ok()?;
        let micros = u64::try_from(self.microseconds).ok()?;
        UNIX_EPOCH.checked_add(Duration::from_secs(secs) + Duration::from_micros(micros))
    }
}

/// Raw event message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event name, e.g. `STOP`.
    #[serde(rename = "event")]
    pub name: String,

    /// Event payload; absent for events without fields.
    #[serde(default)]
    pub data: Value,

    /// Emission time.
    pub timestamp: Option<Timestamp>,
}

/// A recognized event, decoded into its typed record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Wire name.
    pub name: String,
    /// Decoded payload.
    pub record: EventRecord,
    /// Emission time.
    pub timestamp: Option<Timestamp>,
}

impl Event {
    /// Decode a wire event.
    ///
    /// Returns `Ok(None)` for names outside the recognized vocabulary and a
    /// protocol error when a recognized event carries a malformed payload.
    pub fn decode(msg: EventMessage) -> Result<Option<Self>> {
        let Some(record) = EventRecord::decode(&msg.name, msg.data)? else {
            return Ok(None);
        };

        Ok(Some(Self {
            name: msg.name,
            record,
            timestamp: msg.timestamp,
        }))
    }
}

/// The closed set of events this crate understands.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EventRecord {
    /// `SHUTDOWN`: the VM is going away.
    Shutdown {
        /// Whether the guest initiated it.
        guest: bool,
        /// Cause.
        reason: ShutdownCause,
    },
    /// `POWERDOWN`: an ACPI power button press was delivered.
    Powerdown,
    /// `RESET`: the VM was reset.
    Reset {
        /// Whether the guest initiated it.
        guest: bool,
        /// Cause.
        reason: ShutdownCause,
    },
    /// `STOP`: vCPUs stopped.
    Stop,
    /// `RESUME`: vCPUs resumed.
    Resume,
    /// `SUSPEND`: guest entered S3.
    Suspend,
    /// `SUSPEND_DISK`: guest entered S4.
    SuspendDisk,
    /// `WAKEUP`: guest left a sleep state.
    Wakeup,
    /// `GUEST_PANICKED`
    GuestPanicked {
        /// What QEMU did about it.
        action: GuestPanicAction,
        /// Architecture specific crash information, when reported.
        info: Option<Value>,
    },
    /// `BLOCK_IMAGE_CORRUPTED`
    BlockImageCorrupted(BlockImageCorrupted),
    /// `BLOCK_IO_ERROR`
    BlockIoError(BlockIoError),
    /// `RTC_CHANGE`: the guest moved its real time clock.
    RtcChange {
        /// New offset from host time, in seconds.
        offset: i64,
    },
    /// `WATCHDOG`: the watchdog device fired.
    Watchdog {
        /// Action taken.
        action: WatchdogAction,
    },
    /// `DEVICE_DELETED`: a device finished unplugging.
    DeviceDeleted {
        /// Device id, if it had one.
        device: Option<String>,
        /// QOM path.
        path: String,
    },
}

/// Cause carried by `SHUTDOWN` and `RESET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownCause {
    /// No cause given.
    #[default]
    None,
    /// Host-side error.
    HostError,
    /// `quit` issued over QMP.
    HostQmpQuit,
    /// `system_reset` issued over QMP.
    HostQmpSystemReset,
    /// Signal delivered to the emulator.
    HostSignal,
    /// Host UI request.
    HostUi,
    /// Guest powered off.
    GuestShutdown,
    /// Guest rebooted.
    GuestReset,
    /// Guest panicked.
    GuestPanic,
    /// Partial reset of a subsystem.
    SubsystemReset,
    /// Snapshot load.
    SnapshotLoad,
    /// A cause newer than this crate.
    #[serde(other)]
    Unknown,
}

/// Action reported by `GUEST_PANICKED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuestPanicAction {
    /// VM paused.
    Pause,
    /// VM powered off.
    Poweroff,
    /// VM keeps running.
    Run,
    /// An action newer than this crate, or none reported.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Action reported by `WATCHDOG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchdogAction {
    /// Reset.
    Reset,
    /// Shutdown.
    Shutdown,
    /// Power off.
    Poweroff,
    /// Pause.
    Pause,
    /// Debug.
    Debug,
    /// Nothing.
    None,
    /// NMI injected.
    InjectNmi,
    /// An action newer than this crate.
    #[serde(other)]
    Unknown,
}

/// Payload of `BLOCK_IMAGE_CORRUPTED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockImageCorrupted {
    /// Block device name (may be empty).
    pub device: String,
    /// Block node name.
    #[serde(rename = "node-name", default)]
    pub node_name: Option<String>,
    /// Human readable reason.
    pub msg: String,
    /// Offset of the corruption, in bytes.
    #[serde(default)]
    pub offset: Option<i64>,
    /// Size of the corrupted region, in bytes.
    #[serde(default)]
    pub size: Option<i64>,
    /// Whether the image was marked corrupt and made unusable.
    pub fatal: bool,
}

/// Payload of `BLOCK_IO_ERROR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIoError {
    /// Block device name (may be empty).
    pub device: String,
    /// Block node name.
    #[serde(rename = "node-name", default)]
    pub node_name: Option<String>,
    /// Failed operation.
    pub operation: IoOperation,
    /// What QEMU did about it.
    pub action: BlockErrorAction,
    /// Whether the failure was ENOSPC.
    #[serde(default)]
    pub nospace: Option<bool>,
    /// Human readable reason.
    pub reason: String,
}

/// Operation that failed in `BLOCK_IO_ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoOperation {
    /// Read.
    Read,
    /// Write.
    Write,
    /// An operation newer than this crate.
    #[serde(other)]
    Unknown,
}

/// Action taken on a block I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockErrorAction {
    /// Error ignored.
    Ignore,
    /// Error reported to the guest.
    Report,
    /// VM stopped.
    Stop,
    /// An action newer than this crate.
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct CausePayload {
    #[serde(default)]
    guest: bool,
    #[serde(default)]
    reason: ShutdownCause,
}

#[derive(Deserialize)]
struct PanicPayload {
    #[serde(default)]
    action: GuestPanicAction,
    #[serde(default)]
    info: Option<Value>,
}

#[derive(Deserialize)]
struct RtcPayload {
    offset: i64,
}

#[derive(Deserialize)]
struct WatchdogPayload {
    action: WatchdogAction,
}

#[derive(Deserialize)]
struct DeviceDeletedPayload {
    #[serde(default)]
    device: Option<String>,
    path: String,
}

impl EventRecord {
    /// Decode `data` for the event called `name`.
    ///
    /// Unrecognized names yield `Ok(None)`.
    pub fn decode(name: &str, data: Value) -> Result<Option<Self>> {
        let record = match name {
            "SHUTDOWN" => {
                let p: CausePayload = payload(name, data)?;
                Self::Shutdown {
                    guest: p.guest,
                    reason: p.reason,
                }
            }
            "POWERDOWN" => Self::Powerdown,
            "RESET" => {
                let p: CausePayload = payload(name, data)?;
                Self::Reset {
                    guest: p.guest,
                    reason: p.reason,
                }
            }
            "STOP" => Self::Stop,
            "RESUME" => Self::Resume,
            "SUSPEND" => Self::Suspend,
            "SUSPEND_DISK" => Self::SuspendDisk,
            "WAKEUP" => Self::Wakeup,
            "GUEST_PANICKED" => {
                let p: PanicPayload = payload(name, data)?;
                Self::GuestPanicked {
                    action: p.action,
                    info: p.info,
                }
            }
            "BLOCK_IMAGE_CORRUPTED" => Self::BlockImageCorrupted(payload(name, data)?),
            "BLOCK_IO_ERROR" => Self::BlockIoError(payload(name, data)?),
            "RTC_CHANGE" => {
                let p: RtcPayload = payload(name, data)?;
                Self::RtcChange { offset: p.offset }
            }
            "WATCHDOG" => {
                let p: WatchdogPayload = payload(name, data)?;
                Self::Watchdog { action: p.action }
            }
            "DEVICE_DELETED" => {
                let p: DeviceDeletedPayload = payload(name, data)?;
                Self::DeviceDeleted {
                    device: p.device,
                    path: p.path,
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(record))
    }

    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Shutdown { .. } => "SHUTDOWN",
            Self::Powerdown => "POWERDOWN",
            Self::Reset { .. } => "RESET",
            Self::Stop => "STOP",
            Self::Resume => "RESUME",
            Self::Suspend => "SUSPEND",
            Self::SuspendDisk => "SUSPEND_DISK",
            Self::Wakeup => "WAKEUP",
            Self::GuestPanicked { .. } => "GUEST_PANICKED",
            Self::BlockImageCorrupted(_) => "BLOCK_IMAGE_CORRUPTED",
            Self::BlockIoError(_) => "BLOCK_IO_ERROR",
            Self::RtcChange { .. } => "RTC_CHANGE",
            Self::Watchdog { .. } => "WATCHDOG",
            Self::DeviceDeleted { .. } => "DEVICE_DELETED",
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(name: &str, data: Value) -> Result<T> {
    // Older emulators omit `data` entirely for events whose fields are optional.
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data
    };

    decode_value(data).map_err(|e| Error::protocol(format!("invalid {name} payload: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn guest_reset_carries_cause() {
        let record = EventRecord::decode("RESET", json!({"guest": true, "reason": "guest-reset"}))
            .unwrap()
            .unwrap();
        assert_eq!(
            record,
            EventRecord::Reset {
                guest: true,
                reason: ShutdownCause::GuestReset
            }
        );
    }

    #[test]
    fn shutdown_without_data_defaults() {
        let record = EventRecord::decode("SHUTDOWN", Value::Null).unwrap().unwrap();
        assert_eq!(
            record,
            EventRecord::Shutdown {
                guest: false,
                reason: ShutdownCause::None
            }
        );
    }

    #[test]
    fn unknown_cause_does_not_fail() {
        let record = EventRecord::decode("SHUTDOWN", json!({"guest": false, "reason": "brand-new"}))
            .unwrap()
            .unwrap();
        assert!(matches!(
            record,
            EventRecord::Shutdown {
                reason: ShutdownCause::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn block_image_corrupted_fields() {
        let record = EventRecord::decode(
            "BLOCK_IMAGE_CORRUPTED",
            json!({
                "device": "drive0",
                "node-name": "#block123",
                "msg": "L2 table offset unaligned",
                "offset": 65536,
                "size": 512,
                "fatal": true
            }),
        )
        .unwrap()
        .unwrap();

        let EventRecord::BlockImageCorrupted(info) = record else {
            panic!("wrong variant");
        };
        assert_eq!(info.device, "drive0");
        assert_eq!(info.node_name.as_deref(), Some("#block123"));
        assert_eq!(info.offset, Some(65536));
        assert!(info.fatal);
    }

    #[test]
    fn block_io_error_fields() {
        let record = EventRecord::decode(
            "BLOCK_IO_ERROR",
            json!({
                "device": "",
                "node-name": "disk0",
                "operation": "write",
                "action": "stop",
                "nospace": true,
                "reason": "No space left on device"
            }),
        )
        .unwrap()
        .unwrap();

        let EventRecord::BlockIoError(info) = record else {
            panic!("wrong variant");
        };
        assert_eq!(info.operation, IoOperation::Write);
        assert_eq!(info.action, BlockErrorAction::Stop);
        assert_eq!(info.reason, "No space left on device");
    }

    #[test]
    fn unrecognized_names_are_not_errors() {
        assert_eq!(EventRecord::decode("VNC_CONNECTED", json!({})).unwrap(), None);
    }

    #[test]
    fn malformed_payload_names_the_field() {
        let err = EventRecord::decode("BLOCK_IO_ERROR", json!({"device": "d"})).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
        assert!(err.description().contains("BLOCK_IO_ERROR"));
    }

    #[test]
    fn timestamps_convert() {
        let ts = Timestamp {
            seconds: 10,
            microseconds: 500,
        };
        assert_eq!(
            ts.to_system_time(),
            Some(UNIX_EPOCH + Duration::from_micros(10_000_500))
        );
        let ts = Timestamp {
            seconds: -1,
            microseconds: -1,
        };
        assert_eq!(ts.to_system_time(), None);
    }
}
