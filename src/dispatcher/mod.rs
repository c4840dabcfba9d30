//! Service dispatcher
//!
//! Owns the registry of live machines and implements every operation the
//! session service exports. Operations never fail at this level: each one
//! replies with a human-readable status line.
//!
//! Handles report state changes through the event queue returned by
//! [`Dispatcher::new`]. The owner of the dispatcher drains that queue between
//! operations and feeds each event to [`Dispatcher::handle_event`].

mod registry;

pub use registry::{machine_key, Registry};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::mpsc;
use zbus::zvariant::Type;

use crate::machine::{
    EventReceiver, EventSender, Machine, MachineError, MachineEvent, MachineId, MachineLauncher,
    MachineState,
};

/// What `start` does when a machine with the same configuration is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateStart {
    /// Start another independent instance
    #[default]
    Allow,
    /// Refuse the start
    Reject,
    /// Report success and keep using the running instance
    Merge,
}

impl DuplicateStart {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Reject => "reject",
            Self::Merge => "merge",
        }
    }
}

impl FromStr for DuplicateStart {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "reject" => Ok(Self::Reject),
            "merge" => Ok(Self::Merge),
            other => Err(format!("unknown duplicate start policy: {}", other)),
        }
    }
}

/// Receives every state change after the dispatcher has applied it
pub trait StateAnnouncer: Send {
    fn announce(&self, path: &Path, state: MachineState);
}

/// Registry entry as reported by `list_machines`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct MachineInfo {
    pub path: String,
    pub state: String,
    /// RFC 3339 start time
    pub started_at: String,
}

/// Operations that target a running machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Stop,
    Reset,
    Pause,
    Save,
    ErrorLog,
    Control,
    Command,
}

impl Action {
    fn success(&self, path: &str) -> String {
        match self {
            Self::Stop => format!("VM \"{}\" got stopped.", path),
            Self::Reset => format!("VM \"{}\" got reset.", path),
            Self::Pause => format!("VM \"{}\" got paused.", path),
            Self::Save => format!("VM state of \"{}\" got saved.", path),
            Self::ErrorLog => format!("VM error log window of \"{}\" got shown.", path),
            Self::Control => format!("VM control window of \"{}\" got shown.", path),
            Self::Command => format!("Sent command to VM \"{}\".", path),
        }
    }

    fn failure(&self, path: &str) -> String {
        match self {
            Self::Stop => format!("VM \"{}\" could not be stopped.", path),
            Self::Reset => format!("VM \"{}\" could not be reset.", path),
            Self::Pause => format!("VM \"{}\" could not be paused.", path),
            Self::Save => format!("VM state of \"{}\" could not be saved.", path),
            Self::ErrorLog => format!("VM error log window of \"{}\" could not be shown.", path),
            Self::Control => format!("VM control window of \"{}\" could not be shown.", path),
            Self::Command => format!("Could not send command to VM \"{}\".", path),
        }
    }
}

pub fn started_text(path: &str) -> String {
    format!("VM \"{}\" got started.", path)
}

pub fn start_failed_text(path: &str) -> String {
    format!("VM \"{}\" could not be started.", path)
}

pub fn status_text(state_text: &str) -> String {
    format!("VM state:  {}.", state_text)
}

pub fn status_failed_text(path: &str) -> String {
    format!("Could not show state of VM \"{}\".", path)
}

pub struct Dispatcher {
    registry: Registry,
    next_id: u64,
    launcher: Box<dyn MachineLauncher>,
    events: EventSender,
    announcer: Box<dyn StateAnnouncer>,
    quit: mpsc::UnboundedSender<()>,
    /// Set once termination was requested for the current empty registry
    quit_requested: bool,
    duplicate_start: DuplicateStart,
    /// Keep running with no machines (the process hosts the main window)
    resident: bool,
}

impl Dispatcher {
    /// Create a dispatcher and the queue its handles report into.
    /// `quit` receives one message each time the registry drains while not resident.
    pub fn new(
        launcher: Box<dyn MachineLauncher>,
        announcer: Box<dyn StateAnnouncer>,
        quit: mpsc::UnboundedSender<()>,
    ) -> (Self, EventReceiver) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            registry: Registry::new(),
            next_id: 1,
            launcher,
            events,
            announcer,
            quit,
            quit_requested: false,
            duplicate_start: DuplicateStart::default(),
            resident: false,
        };
        (dispatcher, events_rx)
    }

    pub fn set_duplicate_start(&mut self, policy: DuplicateStart) {
        self.duplicate_start = policy;
    }

    pub fn set_resident(&mut self, resident: bool) {
        self.resident = resident;
    }

    pub fn set_announcer(&mut self, announcer: Box<dyn StateAnnouncer>) {
        self.announcer = announcer;
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    /// True while any machine is registered
    pub fn is_active(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Number of registered machines created from `path`
    pub fn count(&self, path: &str) -> usize {
        self.registry.count_key(&machine_key(Path::new(path)))
    }

    pub fn start(&mut self, path: &str) -> String {
        log::info!("start {}", path);
        let key = machine_key(Path::new(path));

        if self.registry.find(&key).is_some() {
            match self.duplicate_start {
                DuplicateStart::Allow => {
                    log::info!("{} is already running, starting another instance", path)
                }
                DuplicateStart::Reject => {
                    log::warn!("{} is already running, refusing to start it again", path);
                    return start_failed_text(path);
                }
                DuplicateStart::Merge => {
                    log::info!("{} is already running, reusing it", path);
                    return started_text(path);
                }
            }
        }

        let id = MachineId(self.next_id);
        self.next_id += 1;

        let mut machine = match self.launcher.create(id, Path::new(path), self.events.clone()) {
            Ok(machine) => machine,
            Err(e) => {
                log::warn!("Failed to load {}: {}", path, e);
                return start_failed_text(path);
            }
        };

        if let Err(e) = machine.start() {
            log::warn!("Failed to start {}: {}", path, e);
            return start_failed_text(path);
        }

        self.registry.insert(id, key, machine);
        self.quit_requested = false;
        log::info!("{} registered as {}", path, id);
        started_text(path)
    }

    pub fn stop(&mut self, path: &str) -> String {
        self.forward(path, Action::Stop, |m| m.stop())
    }

    pub fn reset(&mut self, path: &str) -> String {
        self.forward(path, Action::Reset, |m| m.reset())
    }

    pub fn pause(&mut self, path: &str) -> String {
        self.forward(path, Action::Pause, |m| m.pause())
    }

    pub fn save(&mut self, path: &str) -> String {
        self.forward(path, Action::Save, |m| m.save_state())
    }

    pub fn error(&mut self, path: &str) -> String {
        self.forward(path, Action::ErrorLog, |m| m.show_error_log())
    }

    pub fn control(&mut self, path: &str) -> String {
        self.forward(path, Action::Control, |m| m.show_control_window())
    }

    pub fn command(&mut self, path: &str, command: &str) -> String {
        self.forward(path, Action::Command, |m| m.send_command(command))
    }

    /// Report the machine's state and re-announce it as a state change
    pub fn status(&mut self, path: &str) -> String {
        let Some(id) = self.lookup(path) else {
            return status_failed_text(path);
        };
        let Some(machine) = self.registry.get(id) else {
            return status_failed_text(path);
        };

        let state = machine.state();
        let text = machine.state_text();
        if self.events.send(MachineEvent { id, state }).is_err() {
            log::debug!("event queue closed, not re-announcing {}", path);
        }
        status_text(&text)
    }

    /// Registry snapshot in start order
    pub fn list(&self) -> Vec<MachineInfo> {
        self.registry
            .iter()
            .map(|(id, machine)| MachineInfo {
                path: machine.config_path().display().to_string(),
                state: machine.state().as_str().to_string(),
                started_at: self
                    .registry
                    .started_at(id)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Apply a state change reported by a handle
    pub fn handle_event(&mut self, event: MachineEvent) {
        let Some(machine) = self.registry.get(event.id) else {
            log::debug!("state {} for unknown machine {}", event.state, event.id);
            return;
        };
        let path = machine.config_path().to_path_buf();
        log::info!("{} ({}) is now {}", path.display(), event.id, event.state);

        if event.state.is_terminal() {
            if let Some(machine) = self.registry.remove(event.id) {
                drop(machine);
                log::debug!("{} finalized", event.id);
            }

            self.quit_if_idle();
        }

        self.announcer.announce(&path, event.state);
    }

    /// Ask the host to exit if no machine is left and the service is not
    /// resident. Requested at most once per empty transition.
    pub fn quit_if_idle(&mut self) -> bool {
        if self.is_active() || self.resident || self.quit_requested {
            return false;
        }
        log::info!("No machines left, requesting shutdown");
        self.quit_requested = true;
        if self.quit.send(()).is_err() {
            log::debug!("shutdown receiver already gone");
        }
        true
    }

    /// Drop every registered machine
    pub fn shutdown(&mut self) {
        for (id, machine) in self.registry.drain() {
            log::info!("Finalizing {} ({})", machine.config_path().display(), id);
        }
    }

    /// Log the registry at info level
    pub fn dump(&self) {
        if self.registry.is_empty() {
            log::info!("No machines registered");
        }
        for (id, machine) in self.registry.iter() {
            log::info!("  {} {}: {}", id, machine.config_path().display(), machine.state());
        }
    }

    fn lookup(&self, path: &str) -> Option<MachineId> {
        let id = self.registry.find(&machine_key(Path::new(path)));
        if id.is_none() {
            log::debug!("no machine registered for {}", path);
        }
        id
    }

    fn forward<F>(&mut self, path: &str, action: Action, f: F) -> String
    where
        F: FnOnce(&mut dyn Machine) -> Result<(), MachineError>,
    {
        log::info!("{:?} {}", action, path);
        let Some(id) = self.lookup(path) else {
            return action.failure(path);
        };
        let Some(machine) = self.registry.get_mut(id) else {
            return action.failure(path);
        };

        match f(machine) {
            Ok(()) => action.success(path),
            Err(e) => {
                log::warn!("{:?} {} failed: {}", action, path, e);
                action.failure(path)
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
