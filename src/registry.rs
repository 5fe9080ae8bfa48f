use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use log::{debug, info};
use mac_address::MacAddress;

use crate::device::{Category, DeviceRecord, Role};

/// Identifies one submitted device edit, so a late answer for an expired
/// edit cannot resolve a newer one.
pub type EditId = u64;

/// An optimistic role edit that the server has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChange {
    pub role: Role,
    pub since: Instant,
    pub edit: EditId,
}

/// Render-ready projection of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceView {
    pub mac: MacAddress,
    pub role: Role,
    pub is_self: bool,
    pub category: Category,
    pub pending: bool,
    pub locked: bool,
}

impl DeviceView {
    pub fn options(&self) -> &'static [Role] {
        Role::options(self.is_self)
    }
}

/// What the caller has to submit after an edit was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPlan {
    /// Optimistic edit of another device, awaiting a `device_role_changed`
    /// confirmation.
    Device {
        mac: MacAddress,
        role: Role,
        edit: EditId,
    },
    /// Role change of the hosting device itself. Not optimistic.
    SelfRole { role: Role },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditRejected {
    Locked(MacAddress),
    NotSelectable(Role),
    UnknownDevice(MacAddress),
    SelfUnknown,
}

impl std::fmt::Display for EditRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EditRejected::Locked(mac) => write!(f, "{mac} has an edit in flight"),
            EditRejected::NotSelectable(role) => write!(f, "role {role} cannot be selected here"),
            EditRejected::UnknownDevice(mac) => write!(f, "{mac} is not in any roster"),
            EditRejected::SelfUnknown => write!(f, "this device's mac is not known yet"),
        }
    }
}

/// Merged view over the saved and discovered rosters plus the optimistic
/// edits layered on top of them.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    self_mac: Option<MacAddress>,
    self_role: Role,
    saved: Vec<DeviceRecord>,
    discovered: Vec<DeviceRecord>,
    pending: HashMap<MacAddress, PendingChange>,
    self_locked: bool,
    next_edit: EditId,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every piece of state, as if the controller had just started.
    /// Edit ids keep counting so answers for edits from before the reset
    /// never match a new one.
    pub fn reset(&mut self) {
        let next_edit = self.next_edit;
        *self = Self::default();
        self.next_edit = next_edit;
    }

    pub fn set_self(&mut self, mac: MacAddress, role: Role) {
        self.self_mac = Some(mac);
        self.self_role = role;
    }

    pub fn set_self_role(&mut self, role: Role) {
        self.self_role = role;
    }

    #[cfg(test)]
    pub fn self_mac(&self) -> Option<MacAddress> {
        self.self_mac
    }

    pub fn apply_saved(&mut self, devices: Vec<DeviceRecord>) {
        self.saved = dedup(devices);
        debug!("Saved roster now has {} devices", self.saved.len());
    }

    pub fn apply_discovered(&mut self, devices: Vec<DeviceRecord>) {
        self.discovered = dedup(devices);
        debug!("Discovered roster now has {} devices", self.discovered.len());
    }

    #[cfg(test)]
    pub fn pending(&self, mac: &MacAddress) -> Option<&PendingChange> {
        self.pending.get(mac)
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn saved_entry(&self, mac: &MacAddress) -> Option<&DeviceRecord> {
        self.saved.iter().find(|d| d.mac == *mac)
    }

    fn is_discovered(&self, mac: &MacAddress) -> bool {
        self.discovered.iter().any(|d| d.mac == *mac)
    }

    fn is_self(&self, mac: &MacAddress) -> bool {
        self.self_mac.as_ref() == Some(mac)
    }

    /// Role the server last told us about, ignoring any pending edit.
    pub fn authoritative_role(&self, mac: &MacAddress) -> Role {
        if let Some(saved) = self.saved_entry(mac) {
            saved.role
        } else if self.is_self(mac) {
            self.self_role
        } else {
            Role::Unassigned
        }
    }

    /// Role to display: a pending edit wins over whatever the server said.
    pub fn effective_role(&self, mac: &MacAddress) -> Role {
        match self.pending.get(mac) {
            Some(change) => change.role,
            None => self.authoritative_role(mac),
        }
    }

    pub fn is_locked(&self, mac: &MacAddress) -> bool {
        if self.is_self(mac) {
            self.self_locked
        } else {
            self.pending.contains_key(mac)
        }
    }

    /// Starts an edit. For other devices the requested role is recorded as
    /// pending right away; for the hosting device only a lock is taken.
    pub fn begin_edit(
        &mut self,
        mac: MacAddress,
        role: Role,
        now: Instant,
    ) -> Result<EditPlan, EditRejected> {
        if self.is_self(&mac) {
            return self.begin_self_edit(role);
        }
        if self.pending.contains_key(&mac) {
            return Err(EditRejected::Locked(mac));
        }
        if !Role::options(false).contains(&role) {
            return Err(EditRejected::NotSelectable(role));
        }
        if self.saved_entry(&mac).is_none() && !self.is_discovered(&mac) {
            return Err(EditRejected::UnknownDevice(mac));
        }
        info!(
            "Changing {mac} from {} to {role} (pending confirmation)",
            self.authoritative_role(&mac)
        );
        let edit = self.next_edit;
        self.next_edit += 1;
        self.pending.insert(
            mac,
            PendingChange {
                role,
                since: now,
                edit,
            },
        );
        Ok(EditPlan::Device { mac, role, edit })
    }

    pub fn begin_self_edit(&mut self, role: Role) -> Result<EditPlan, EditRejected> {
        let mac = self.self_mac.ok_or(EditRejected::SelfUnknown)?;
        if self.self_locked {
            return Err(EditRejected::Locked(mac));
        }
        if !Role::options(true).contains(&role) {
            return Err(EditRejected::NotSelectable(role));
        }
        info!("Changing this device's role to {role}");
        self.self_locked = true;
        Ok(EditPlan::SelfRole { role })
    }

    /// Server confirmed a role. Clears the pending edit for the mac, if any,
    /// and makes the role authoritative. Returns whether a pending edit was
    /// cleared.
    pub fn confirm_role(&mut self, mac: MacAddress, role: Role) -> bool {
        let is_self = self.is_self(&mac);
        if is_self {
            self.self_role = role;
        }
        if let Some(entry) = self.saved.iter_mut().find(|d| d.mac == mac) {
            entry.role = role;
        } else if !is_self {
            self.saved.push(DeviceRecord::new(mac, role));
        }
        let cleared = self.pending.remove(&mac);
        if let Some(change) = cleared {
            if change.role != role {
                debug!(
                    "Confirmation for {mac} carries {role}, edit had requested {}",
                    change.role
                );
            }
        }
        cleared.is_some()
    }

    /// Submission of `edit` failed: drop its optimistic value so the
    /// authoritative role shows again. A pending entry from a later edit of
    /// the same mac is left alone. Returns whether anything was cleared.
    pub fn fail_edit(&mut self, mac: &MacAddress, edit: EditId) -> bool {
        match self.pending.get(mac) {
            Some(change) if change.edit == edit => {
                self.pending.remove(mac);
                true
            }
            _ => false,
        }
    }

    pub fn fail_self_edit(&mut self) {
        self.self_locked = false;
    }

    /// Clears pending edits older than `lifetime` and returns their macs.
    pub fn expire_pending(&mut self, now: Instant, lifetime: Duration) -> Vec<MacAddress> {
        let mut expired: Vec<MacAddress> = self
            .pending
            .iter()
            .filter(|(_, change)| now.saturating_duration_since(change.since) >= lifetime)
            .map(|(mac, _)| *mac)
            .collect();
        expired.sort_by_key(|mac| mac.bytes());
        for mac in &expired {
            self.pending.remove(mac);
        }
        expired
    }

    /// Deterministic render order: self first, then saved in snapshot
    /// order, then discovered-only devices in snapshot order.
    pub fn render_order(&self) -> Vec<MacAddress> {
        let mut seen = HashSet::new();
        let mut order = Vec::with_capacity(self.saved.len() + self.discovered.len() + 1);
        if let Some(mac) = self.self_mac {
            seen.insert(mac);
            order.push(mac);
        }
        for dev in self.saved.iter().chain(self.discovered.iter()) {
            if seen.insert(dev.mac) {
                order.push(dev.mac);
            }
        }
        order
    }

    pub fn view(&self) -> Vec<DeviceView> {
        self.render_order()
            .into_iter()
            .map(|mac| {
                let is_self = self.is_self(&mac);
                DeviceView {
                    mac,
                    role: self.effective_role(&mac),
                    is_self,
                    category: Category::classify(
                        is_self,
                        self.saved_entry(&mac).is_some(),
                        self.is_discovered(&mac),
                    ),
                    pending: self.pending.contains_key(&mac),
                    locked: self.is_locked(&mac),
                }
            })
            .collect()
    }
}

fn dedup(devices: Vec<DeviceRecord>) -> Vec<DeviceRecord> {
    let mut seen = HashSet::new();
    devices.into_iter().filter(|d| seen.insert(d.mac)).collect()
}
