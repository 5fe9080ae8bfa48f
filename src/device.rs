use std::fmt;
use std::str::FromStr;

use log::debug;
use mac_address::MacAddress;
use serde_derive::Deserialize;

/// Role a device plays on the course.
///
/// The wire strings are fixed by the device firmware: `-` for a device that
/// has not been assigned yet, `Start`, `Ziel` (finish line) and `Ignorieren`
/// for a device the fleet has been told to ignore.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum Role {
    #[default]
    Unassigned,
    Start,
    Finish,
    Ignore,
}

impl Role {
    const SELF_OPTIONS: [Role; 2] = [Role::Start, Role::Finish];
    const DEVICE_OPTIONS: [Role; 3] = [Role::Unassigned, Role::Start, Role::Finish];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unassigned => "-",
            Role::Start => "Start",
            Role::Finish => "Ziel",
            Role::Ignore => "Ignorieren",
        }
    }

    /// Roles a user may pick for a device. The hosting device always needs
    /// an active role, so it cannot be unassigned.
    pub fn options(is_self: bool) -> &'static [Role] {
        if is_self {
            &Self::SELF_OPTIONS
        } else {
            &Self::DEVICE_OPTIONS
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown role '{}'", self.0)
    }
}

impl std::error::Error for UnknownRole {}

/// Strict parse, used for user input.
impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "-" => Ok(Role::Unassigned),
            "Start" => Ok(Role::Start),
            "Ziel" => Ok(Role::Finish),
            "Ignorieren" => Ok(Role::Ignore),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Lenient parse, used for server payloads: anything unrecognised is
/// treated as unassigned.
impl From<String> for Role {
    fn from(value: String) -> Self {
        value.parse().unwrap_or_else(|_| {
            debug!("Treating unrecognised role {value:?} as unassigned");
            Role::Unassigned
        })
    }
}

/// Device entry as it appears in roster payloads.
#[derive(Deserialize, Debug, Clone)]
pub struct WireDevice {
    pub mac: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRecord {
    pub mac: MacAddress,
    pub role: Role,
}

impl DeviceRecord {
    pub fn new(mac: MacAddress, role: Role) -> Self {
        DeviceRecord { mac, role }
    }
}

pub fn parse_mac(text: &str) -> Option<MacAddress> {
    MacAddress::from_str(text.trim()).ok()
}

/// Converts wire entries into records, dropping entries whose mac does not
/// parse.
pub fn from_wire(devices: Vec<WireDevice>) -> Vec<DeviceRecord> {
    devices
        .into_iter()
        .filter_map(|dev| match parse_mac(&dev.mac) {
            Some(mac) => Some(DeviceRecord::new(mac, dev.role)),
            None => {
                debug!("Dropping roster entry with invalid mac {:?}", dev.mac);
                None
            }
        })
        .collect()
}

/// Decodes a JSON array of `{mac, role}` objects.
pub fn decode_roster(json: &str) -> Result<Vec<DeviceRecord>, serde_json::Error> {
    let devices: Vec<WireDevice> = serde_json::from_str(json)?;
    Ok(from_wire(devices))
}

/// How a device relates to the two rosters, from the point of view of this
/// controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    SelfDevice,
    SavedOnline,
    SavedOffline,
    Discovered,
    Unknown,
}

impl Category {
    pub fn classify(is_self: bool, in_saved: bool, in_discovered: bool) -> Self {
        match (is_self, in_saved, in_discovered) {
            (true, _, _) => Category::SelfDevice,
            (false, true, true) => Category::SavedOnline,
            (false, true, false) => Category::SavedOffline,
            (false, false, true) => Category::Discovered,
            (false, false, false) => Category::Unknown,
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Category::SelfDevice => "📱",
            Category::SavedOnline => "🟢",
            Category::SavedOffline => "🔴",
            Category::Discovered => "🟡",
            Category::Unknown => "⚪",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::SelfDevice => "This device",
            Category::SavedOnline => "Saved & online",
            Category::SavedOffline => "Saved & offline",
            Category::Discovered => "Discovered",
            Category::Unknown => "Unknown",
        }
    }
}
