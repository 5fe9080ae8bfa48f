use std::time::Duration;

use log::{debug, error, info, warn};

use crate::connection::ConnectionEvent;
use crate::device::{self, from_wire};
use crate::messages::{Command, EditTarget, Event, Notice, PushMessage};
use crate::registry::{DeviceRegistry, DeviceView, EditPlan};
use crate::status::{self, StatusPresentation, StatusState};

/// Everything the rendering side needs, derived from controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub devices: Vec<DeviceView>,
    pub status: StatusPresentation,
    pub last_time: String,
    pub run_markers: String,
    pub version: Option<String>,
}

/// Single owner of the registry. Every state change goes through
/// [`Controller::update`], which returns the side effects to perform.
pub struct Controller {
    registry: DeviceRegistry,
    status: StatusPresentation,
    last_time_ms: u64,
    run_count: u32,
    version: Option<String>,
    pending_timeout: Duration,
    has_opened: bool,
}

impl Controller {
    pub fn new(pending_timeout: Duration) -> Self {
        Controller {
            registry: DeviceRegistry::new(),
            status: StatusState::Unknown.presentation(),
            last_time_ms: 0,
            run_count: 0,
            version: None,
            pending_timeout,
            has_opened: false,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Commands that (re)load everything from the device.
    pub fn start(&self) -> Vec<Command> {
        vec![
            Command::FetchDeviceInfo,
            Command::FetchSnapshot,
            Command::FetchLastTime,
            Command::FetchRunCount,
            Command::TriggerDiscovery,
        ]
    }

    /// Discards all device state and reloads it. The link itself stays up.
    fn reinitialize(&mut self) -> Vec<Command> {
        info!("Reinitialising device state");
        self.registry.reset();
        self.status = StatusState::Unknown.presentation();
        self.last_time_ms = 0;
        self.run_count = 0;
        self.version = None;
        self.start()
    }

    pub fn view(&self) -> View {
        View {
            devices: self.registry.view(),
            status: self.status,
            last_time: status::format_duration(self.last_time_ms),
            run_markers: status::run_markers(self.run_count),
            version: self.version.clone(),
        }
    }

    pub fn update(&mut self, event: Event) -> Vec<Command> {
        match event {
            Event::Connection(event) => self.on_connection(event),
            Event::DeviceInfoLoaded(info) => {
                match device::parse_mac(&info.self_mac) {
                    Some(mac) => self.registry.set_self(mac, info.self_role),
                    None => warn!("Device reported unusable mac {:?}", info.self_mac),
                }
                self.version = Some(info.version());
                Vec::new()
            }
            Event::SnapshotLoaded(prefs) => {
                self.registry.apply_saved(prefs.saved);
                self.registry.apply_discovered(prefs.discovered);
                if let Some(role) = prefs.self_role {
                    self.registry.set_self_role(role);
                }
                Vec::new()
            }
            Event::LastTimeLoaded(ms) => {
                self.last_time_ms = ms;
                Vec::new()
            }
            Event::RunCountLoaded(count) => {
                self.set_run_count(count);
                Vec::new()
            }
            Event::FetchFailed { what, error } => {
                warn!("Loading {what} failed: {error}");
                Vec::new()
            }
            Event::EditRequested { target, role, at } => {
                let result = match target {
                    EditTarget::SelfDevice => self.registry.begin_self_edit(role),
                    EditTarget::Device(mac) => self.registry.begin_edit(mac, role, at),
                };
                match result {
                    Ok(EditPlan::Device { mac, role, edit }) => {
                        vec![Command::SubmitDeviceRole { mac, role, edit }]
                    }
                    Ok(EditPlan::SelfRole { role }) => vec![Command::SubmitSelfRole { role }],
                    Err(rejected) => {
                        vec![Command::Notify(Notice::Warning(format!(
                            "Edit not possible: {rejected}"
                        )))]
                    }
                }
            }
            Event::DeviceRoleSubmitted { mac, edit, result } => match result {
                // Pending stays until the device confirms over the channel.
                Ok(()) => {
                    debug!("Role change for {mac} accepted, waiting for confirmation");
                    Vec::new()
                }
                Err(err) => {
                    error!("Saving role for {mac} failed: {err}");
                    if !self.registry.fail_edit(&mac, edit) {
                        debug!("Edit {edit} for {mac} is no longer pending");
                    }
                    vec![Command::Notify(Notice::Error(format!(
                        "Saving the device failed: {err}"
                    )))]
                }
            },
            Event::SelfRoleSubmitted { result } => match result {
                Ok(()) => self.reinitialize(),
                Err(err) => {
                    error!("Saving own role failed: {err}");
                    self.registry.fail_self_edit();
                    vec![Command::Notify(Notice::Error(format!(
                        "Saving the role failed: {err}"
                    )))]
                }
            },
            Event::DiscoveryTriggered { result } => {
                if let Err(err) = result {
                    warn!("Discovery request failed: {err}");
                }
                Vec::new()
            }
            Event::RefreshRequested => vec![Command::TriggerDiscovery, Command::FetchSnapshot],
            Event::SnapshotDue => vec![Command::FetchSnapshot],
            Event::Tick(now) => self
                .registry
                .expire_pending(now, self.pending_timeout)
                .into_iter()
                .map(|mac| {
                    warn!("No confirmation for {mac}, dropping pending edit");
                    Command::Notify(Notice::Warning(format!(
                        "{mac} did not confirm the role change"
                    )))
                })
                .collect(),
        }
    }

    fn on_connection(&mut self, event: ConnectionEvent) -> Vec<Command> {
        match event {
            ConnectionEvent::Opened => {
                // Pushes sent while we were away are gone; resync from a
                // snapshot.
                let reopened = self.has_opened;
                self.has_opened = true;
                if reopened {
                    vec![Command::FetchSnapshot]
                } else {
                    Vec::new()
                }
            }
            ConnectionEvent::Message(raw) => {
                self.on_push(&raw);
                Vec::new()
            }
            ConnectionEvent::Closed { reconnect_in } => {
                debug!("Channel closed, reconnect in {reconnect_in:?}");
                Vec::new()
            }
            ConnectionEvent::Errored(err) => {
                debug!("Channel error: {err}");
                Vec::new()
            }
        }
    }

    fn on_push(&mut self, raw: &str) {
        let message = match PushMessage::decode(raw) {
            Ok(message) => message,
            Err(err) => {
                debug!("Dropping malformed push message: {err}");
                return;
            }
        };
        match message {
            PushMessage::SavedDevices { data } => self.registry.apply_saved(from_wire(data)),
            PushMessage::DiscoveredDevices { data } => {
                self.registry.apply_discovered(from_wire(data))
            }
            PushMessage::Status { status } => self.status = status::interpret(&status),
            PushMessage::DeviceRoleChanged(change) => {
                let wire = change.into_device();
                match device::parse_mac(&wire.mac) {
                    Some(mac) => {
                        if self.registry.confirm_role(mac, wire.role) {
                            info!("{mac} confirmed role {}", wire.role);
                        }
                    }
                    None => debug!("Role change for unusable mac {:?}", wire.mac),
                }
            }
            PushMessage::LastTime { value } => match value.value() {
                Some(ms) => self.last_time_ms = ms,
                None => debug!("Ignoring non-numeric lastTime {value:?}"),
            },
            PushMessage::RunCount { value } => match value.value() {
                Some(count) => self.set_run_count(count),
                None => debug!("Ignoring non-numeric laufCount {value:?}"),
            },
            PushMessage::Unrecognized => debug!("Ignoring push of unknown type"),
        }
    }

    fn set_run_count(&mut self, count: u64) {
        match u32::try_from(count) {
            Ok(count) if count <= status::MAX_RUN_MARKERS => self.run_count = count,
            _ => debug!("Ignoring out-of-range run count {count}"),
        }
    }
}
