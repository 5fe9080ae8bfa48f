use std::time::Instant;

use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::api::{ApiError, DeviceInfo, Preferences};
use crate::connection::ConnectionEvent;
use crate::device::{Role, WireDevice};
use crate::registry::EditId;

/// Message pushed by the device over the real-time channel.
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum PushMessage {
    #[serde(rename = "saved_devices")]
    SavedDevices { data: Vec<WireDevice> },
    #[serde(rename = "discovered_devices")]
    DiscoveredDevices { data: Vec<WireDevice> },
    #[serde(rename = "status")]
    Status {
        #[serde(alias = "value")]
        status: String,
    },
    #[serde(rename = "device_role_changed")]
    DeviceRoleChanged(RoleChange),
    #[serde(rename = "lastTime")]
    LastTime { value: Numeric },
    #[serde(rename = "laufCount")]
    RunCount { value: Numeric },
    #[serde(other)]
    Unrecognized,
}

/// `device_role_changed` carries its device either under `data` or inline.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum RoleChange {
    Wrapped { data: WireDevice },
    Inline(WireDevice),
}

impl RoleChange {
    pub fn into_device(self) -> WireDevice {
        match self {
            RoleChange::Wrapped { data } => data,
            RoleChange::Inline(device) => device,
        }
    }
}

/// The firmware sends counters as numbers or as numeric strings.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Numeric {
    Number(u64),
    Text(String),
}

impl Numeric {
    pub fn value(&self) -> Option<u64> {
        match self {
            Numeric::Number(n) => Some(*n),
            Numeric::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl PushMessage {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditTarget {
    SelfDevice,
    Device(MacAddress),
}

/// Everything that can drive the controller.
#[derive(Debug)]
pub enum Event {
    Connection(ConnectionEvent),
    DeviceInfoLoaded(DeviceInfo),
    SnapshotLoaded(Preferences),
    LastTimeLoaded(u64),
    RunCountLoaded(u64),
    FetchFailed {
        what: &'static str,
        error: ApiError,
    },
    EditRequested {
        target: EditTarget,
        role: Role,
        at: Instant,
    },
    DeviceRoleSubmitted {
        mac: MacAddress,
        edit: EditId,
        result: Result<(), ApiError>,
    },
    SelfRoleSubmitted {
        result: Result<(), ApiError>,
    },
    DiscoveryTriggered {
        result: Result<(), ApiError>,
    },
    RefreshRequested,
    SnapshotDue,
    Tick(Instant),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Needs the user's attention.
    Error(String),
    /// Informational, goes away on its own.
    Warning(String),
}

/// Side effects requested by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    FetchDeviceInfo,
    FetchSnapshot,
    FetchLastTime,
    FetchRunCount,
    TriggerDiscovery,
    SubmitDeviceRole {
        mac: MacAddress,
        role: Role,
        edit: EditId,
    },
    SubmitSelfRole { role: Role },
    Notify(Notice),
}
