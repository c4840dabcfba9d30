//! Machine state as observed by the service
//!
//! ```text
//!     ┌─────────┐
//!     │ Unknown │
//!     └────┬────┘
//!          │ start
//!     ┌────▼────┐   pause   ┌────────┐
//!     │ Running │◄─────────►│ Paused │
//!     └────┬────┘           └───┬────┘
//!          │ exit / failure     │
//!     ┌────▼────┐               │
//!     │  Error  │               │
//!     └────┬────┘               │
//!     ┌────▼───────┐            │
//!     │ PoweredOff │◄───────────┘
//!     └────────────┘ (terminal)
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MachineState {
    #[default]
    Unknown,
    Running,
    Paused,
    PoweredOff,
    Error,
}

impl MachineState {
    /// Stable name used on the bus
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::PoweredOff => "powered-off",
            Self::Error => "error",
        }
    }

    /// Human-readable text used in status replies
    pub fn text(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::PoweredOff => "Powered off",
            Self::Error => "Error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "unknown" => Some(Self::Unknown),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "powered-off" => Some(Self::PoweredOff),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PoweredOff)
    }

    /// Whether the emulator is alive and accepts monitor commands
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_become(&self, next: MachineState) -> bool {
        use MachineState::*;
        match (self, next) {
            (PoweredOff, _) => false,
            (_, PoweredOff) => true,
            (Unknown, Running | Error) => true,
            (Running, Paused | Error) => true,
            (Paused, Running | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
