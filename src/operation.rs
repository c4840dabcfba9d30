//! Operations shared by the command line front ends

use clap::Subcommand;

use crate::dispatcher::Dispatcher;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Start a machine from its machine file
    Start { path: String },
    /// Power a machine off
    Stop { path: String },
    /// Hard-reset a machine
    Reset { path: String },
    /// Pause or resume a machine
    Pause { path: String },
    /// Save the machine state
    Save { path: String },
    /// Show the machine's error log window
    Error { path: String },
    /// Show the machine's control window
    Control { path: String },
    /// Show the machine's state
    Status { path: String },
    /// Send a monitor command to a machine
    Command { path: String, command: String },
}

impl Operation {
    /// Method name on the session interface
    pub fn method(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Reset { .. } => "reset",
            Self::Pause { .. } => "pause",
            Self::Save { .. } => "save",
            Self::Error { .. } => "error",
            Self::Control { .. } => "control",
            Self::Status { .. } => "status",
            Self::Command { .. } => "command",
        }
    }

    /// Call arguments, machine path first
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Command { path, command } => vec![path.clone(), command.clone()],
            Self::Start { path }
            | Self::Stop { path }
            | Self::Reset { path }
            | Self::Pause { path }
            | Self::Save { path }
            | Self::Error { path }
            | Self::Control { path }
            | Self::Status { path } => vec![path.clone()],
        }
    }

    fn path_mut(&mut self) -> &mut String {
        match self {
            Self::Start { path }
            | Self::Stop { path }
            | Self::Reset { path }
            | Self::Pause { path }
            | Self::Save { path }
            | Self::Error { path }
            | Self::Control { path }
            | Self::Status { path }
            | Self::Command { path, .. } => path,
        }
    }

    /// Resolve a relative machine path against the caller's working
    /// directory, which the service does not share.
    pub fn absolute(mut self) -> Self {
        let path = self.path_mut();
        match std::path::absolute(path.as_str()) {
            Ok(resolved) => *path = resolved.display().to_string(),
            Err(e) => log::debug!("cannot resolve {}: {}", path, e),
        }
        self
    }

    /// Run the operation directly on a dispatcher
    pub fn apply(&self, dispatcher: &mut Dispatcher) -> String {
        match self {
            Self::Start { path } => dispatcher.start(path),
            Self::Stop { path } => dispatcher.stop(path),
            Self::Reset { path } => dispatcher.reset(path),
            Self::Pause { path } => dispatcher.pause(path),
            Self::Save { path } => dispatcher.save(path),
            Self::Error { path } => dispatcher.error(path),
            Self::Control { path } => dispatcher.control(path),
            Self::Status { path } => dispatcher.status(path),
            Self::Command { path, command } => dispatcher.command(path, command),
        }
    }
}
