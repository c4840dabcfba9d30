//! Virtual machine handles
//!
//! A handle is anything that implements [`Machine`]. The service only ever
//! talks to handles through this trait; handles report state changes by
//! pushing [`MachineEvent`]s into the queue they were created with, never by
//! calling back into the dispatcher.

mod emulator;
mod file;
mod state;

pub use emulator::{EmulatorLauncher, EmulatorMachine, WindowRequest};
pub use file::MachineFile;
pub use state::MachineState;

use std::fmt;
use std::path::Path;
use tokio::sync::mpsc;

use crate::ini::ParseError;

/// Registry-assigned identity of a handle, increasing in start order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineId(pub u64);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A state change reported by a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineEvent {
    pub id: MachineId,
    pub state: MachineState,
}

pub type EventSender = mpsc::UnboundedSender<MachineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<MachineEvent>;

/// Contract every VM handle fulfils
pub trait Machine: Send {
    /// Configuration file the handle was created from
    fn config_path(&self) -> &Path;

    fn start(&mut self) -> Result<(), MachineError>;
    fn stop(&mut self) -> Result<(), MachineError>;
    fn reset(&mut self) -> Result<(), MachineError>;
    /// Toggle between running and paused
    fn pause(&mut self) -> Result<(), MachineError>;
    fn save_state(&mut self) -> Result<(), MachineError>;
    fn show_error_log(&mut self) -> Result<(), MachineError>;
    fn show_control_window(&mut self) -> Result<(), MachineError>;
    fn send_command(&mut self, command: &str) -> Result<(), MachineError>;

    fn state(&self) -> MachineState;

    fn state_text(&self) -> String {
        self.state().text().to_string()
    }
}

/// Creates handles for the dispatcher
pub trait MachineLauncher: Send {
    /// Build a handle for `path`. The handle must report its state changes
    /// as `MachineEvent { id, .. }` on `events`.
    fn create(
        &self,
        id: MachineId,
        path: &Path,
        events: EventSender,
    ) -> Result<Box<dyn Machine>, MachineError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("Failed to load machine file {0}: {1}")]
    Load(String, #[source] ParseError),

    #[error("Machine file {0} has no emulator program")]
    NoEmulator(String),

    #[error("Failed to spawn emulator: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Machine already started")]
    AlreadyStarted,

    #[error("Machine is not running (state: {0})")]
    NotRunning(MachineState),

    #[error("Emulator monitor is closed")]
    MonitorClosed,

    #[error("No window is listening for {0}")]
    NoWindow(&'static str),
}
