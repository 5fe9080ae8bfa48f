/// Operational state of the light barrier as pushed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusState {
    Normal,
    Triggered,
    Cooldown,
    TriggeredInCooldown,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPresentation {
    pub icon: &'static str,
    pub style_class: &'static str,
    pub label: &'static str,
}

impl StatusState {
    pub fn from_code(code: &str) -> Self {
        match code {
            "normal" => StatusState::Normal,
            "triggered" => StatusState::Triggered,
            "cooldown" => StatusState::Cooldown,
            "triggered_in_cooldown" => StatusState::TriggeredInCooldown,
            _ => StatusState::Unknown,
        }
    }

    pub fn presentation(&self) -> StatusPresentation {
        let (icon, style_class, label) = match self {
            StatusState::Normal => ("🟢", "not-triggered", "Ready"),
            StatusState::Triggered => ("🔴", "triggered", "Triggered"),
            StatusState::Cooldown => ("🟡", "cooldown", "Cooldown"),
            StatusState::TriggeredInCooldown => ("🟠", "cooldown", "Triggered (cooldown)"),
            StatusState::Unknown => ("⚪", "unknown", "Unknown"),
        };
        StatusPresentation {
            icon,
            style_class,
            label,
        }
    }
}

/// Maps a raw status code straight to its presentation. Never fails.
pub fn interpret(code: &str) -> StatusPresentation {
    StatusState::from_code(code).presentation()
}

/// Formats a run time as `[h:]m:ss,mmm`, dropping leading zero groups.
pub fn format_duration(ms: u64) -> String {
    let millis = ms % 1000;
    let total_seconds = ms / 1000;
    let seconds = total_seconds % 60;
    let total_minutes = total_seconds / 60;
    let minutes = total_minutes % 60;
    let hours = total_minutes / 60;

    let clock = if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else if minutes > 0 {
        format!("{minutes}:{seconds:02}")
    } else {
        format!("{seconds}")
    };
    format!("{clock},{millis:03}")
}

/// Upper bound on runs shown at once; the course never holds more.
pub const MAX_RUN_MARKERS: u32 = 32;

/// One marker per run currently on the course.
pub fn run_markers(count: u32) -> String {
    "▲".repeat(count.min(MAX_RUN_MARKERS) as usize)
}
