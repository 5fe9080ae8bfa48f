use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};

use crate::api::ApiClient;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionState, LinkStatus};
use crate::controller::{Controller, View};
use crate::device::{Role, parse_mac};
use crate::messages::{Command, EditTarget, Event, Notice};

const TICK: Duration = Duration::from_secs(1);

/// A line typed by the user.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Edit { target: EditTarget, role: Role },
    Refresh,
    List,
    Quit,
}

pub fn parse_input(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next(), words.next()) {
        (Some("role"), Some(who), Some(role), None) => {
            let role: Role = role.parse().map_err(|e| format!("{e}"))?;
            let target = if who == "self" {
                EditTarget::SelfDevice
            } else {
                EditTarget::Device(parse_mac(who).ok_or_else(|| format!("invalid mac '{who}'"))?)
            };
            Ok(Input::Edit { target, role })
        }
        (Some("refresh"), None, None, None) => Ok(Input::Refresh),
        (Some("list"), None, None, None) => Ok(Input::List),
        (Some("quit" | "exit"), None, None, None) => Ok(Input::Quit),
        _ => Err("usage: role <mac|self> <-|Start|Ziel> | refresh | list | quit".to_string()),
    }
}

/// Text lines for the current view and link state.
pub fn render(view: &View, link: &LinkStatus) -> Vec<String> {
    let mut lines = Vec::with_capacity(view.devices.len() + 4);
    if let Some(warning) = &link.warning {
        if link.attempts > 0 {
            lines.push(format!("!! {warning} (attempt {})", link.attempts));
        } else {
            lines.push(format!("!! {warning}"));
        }
    } else if link.state != ConnectionState::Open {
        lines.push(format!("-- link {:?}", link.state));
    }
    lines.push(format!(
        "Status: {} {} | last run {} {}",
        view.status.icon, view.status.label, view.last_time, view.run_markers
    ));
    for dev in &view.devices {
        let options: Vec<&str> = dev.options().iter().map(Role::as_str).collect();
        lines.push(format!(
            "{} {} {:<16} {}{} [{}]",
            dev.category.icon(),
            dev.mac,
            dev.category.label(),
            dev.role,
            match (dev.pending, dev.locked) {
                (true, _) => " (pending)",
                (false, true) => " (saving)",
                _ => "",
            },
            options.join("/")
        ));
    }
    if let Some(version) = &view.version {
        lines.push(version.clone());
    }
    lines
}

fn deliver(tx: &mpsc::UnboundedSender<Event>, event: Event) {
    if let Err(err) = tx.send(event) {
        error!("Error delivering HTTP result: {:?}", err.0);
    }
}

/// Drives the controller: feeds it connection, timer, HTTP and user events
/// and carries out the commands it returns.
pub struct Manager {
    controller: Controller,
    api: ApiClient,
    connection: ConnectionHandle,
    link_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    snapshot_interval: Duration,
    last_render: Vec<String>,
}

impl Manager {
    pub fn new(
        controller: Controller,
        api: ApiClient,
        connection: ConnectionHandle,
        link_events: mpsc::UnboundedReceiver<ConnectionEvent>,
        snapshot_interval: Duration,
    ) -> Self {
        Manager {
            controller,
            api,
            connection,
            link_events,
            snapshot_interval,
            last_render: Vec::new(),
        }
    }

    fn execute(&self, commands: Vec<Command>, tx: &mpsc::UnboundedSender<Event>) {
        for command in commands {
            let api = self.api.clone();
            let tx = tx.clone();
            match command {
                Command::Notify(Notice::Error(msg)) => error!("{msg}"),
                Command::Notify(Notice::Warning(msg)) => warn!("{msg}"),
                Command::FetchDeviceInfo => {
                    tokio::spawn(async move {
                        let event = match api.fetch_device_info().await {
                            Ok(info) => Event::DeviceInfoLoaded(info),
                            Err(error) => Event::FetchFailed {
                                what: "device info",
                                error,
                            },
                        };
                        deliver(&tx, event);
                    });
                }
                Command::FetchSnapshot => {
                    tokio::spawn(async move {
                        let event = match api.fetch_preferences().await {
                            Ok(prefs) => Event::SnapshotLoaded(prefs),
                            Err(error) => Event::FetchFailed {
                                what: "preferences",
                                error,
                            },
                        };
                        deliver(&tx, event);
                    });
                }
                Command::FetchLastTime => {
                    tokio::spawn(async move {
                        let event = match api.fetch_last_time().await {
                            Ok(ms) => Event::LastTimeLoaded(ms),
                            Err(error) => Event::FetchFailed {
                                what: "last run time",
                                error,
                            },
                        };
                        deliver(&tx, event);
                    });
                }
                Command::FetchRunCount => {
                    tokio::spawn(async move {
                        let event = match api.fetch_run_count().await {
                            Ok(count) => Event::RunCountLoaded(count),
                            Err(error) => Event::FetchFailed {
                                what: "run count",
                                error,
                            },
                        };
                        deliver(&tx, event);
                    });
                }
                Command::TriggerDiscovery => {
                    tokio::spawn(async move {
                        let result = api.trigger_discovery().await;
                        deliver(&tx, Event::DiscoveryTriggered { result });
                    });
                }
                Command::SubmitDeviceRole { mac, role, edit } => {
                    tokio::spawn(async move {
                        let result = api.submit_device_role(mac, role).await;
                        deliver(&tx, Event::DeviceRoleSubmitted { mac, edit, result });
                    });
                }
                Command::SubmitSelfRole { role } => {
                    tokio::spawn(async move {
                        let result = api.submit_self_role(role).await;
                        deliver(&tx, Event::SelfRoleSubmitted { result });
                    });
                }
            }
        }
    }

    fn render(&mut self, force: bool) {
        let lines = render(&self.controller.view(), &self.connection.status());
        if force || lines != self.last_render {
            for line in &lines {
                info!("{line}");
            }
            self.last_render = lines;
        }
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.execute(self.controller.start(), &tx);

        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot = interval(self.snapshot_interval);
        snapshot.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and start() already fetched.
        snapshot.tick().await;

        let mut link_status = self.connection.subscribe();
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                Some(event) = self.link_events.recv() => Event::Connection(event),
                Some(event) = rx.recv() => event,
                _ = tick.tick() => Event::Tick(Instant::now()),
                _ = snapshot.tick() => Event::SnapshotDue,
                Ok(()) = link_status.changed() => {
                    self.render(false);
                    continue;
                }
                line = stdin.next_line(), if stdin_open => match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match parse_input(&line) {
                        Ok(Input::Edit { target, role }) => Event::EditRequested {
                            target,
                            role,
                            at: Instant::now(),
                        },
                        Ok(Input::Refresh) => Event::RefreshRequested,
                        Ok(Input::List) => {
                            self.render(true);
                            continue;
                        }
                        Ok(Input::Quit) => break,
                        Err(usage) => {
                            warn!("{usage}");
                            continue;
                        }
                    },
                    Ok(None) | Err(_) => {
                        info!("Input closed, running until interrupted");
                        stdin_open = false;
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("Interrupted");
                    break;
                }
            };

            let commands = self.controller.update(event);
            self.execute(commands, &tx);
            self.render(false);
        }

        self.connection.shutdown().await;
        Ok(())
    }
}
