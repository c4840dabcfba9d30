//! Service settings
//!
//! Read from `$XDG_CONFIG_HOME/vmsd/vmsd.conf` unless another file is given.
//! A missing file means defaults.
//!
//! ```ini
//! [Service]
//! BusName=org.vmsd.Session
//! DuplicateStart=allow
//! Resident=no
//! LockFile=/run/user/1000/vmsd.lock
//!
//! [Window]
//! BusName=org.vmsd.MainWindow
//! ObjectPath=/main_window
//! Interface=org.vmsd.MainWindow
//!
//! [Emulator]
//! Program=qemu-system-x86_64
//! SaveTag=vmsd
//! ```

use std::path::{Path, PathBuf};

use crate::dispatcher::DuplicateStart;
use crate::ini::{self, ParseError, ParsedSection};

pub const DEFAULT_BUS_NAME: &str = "org.vmsd.Session";
pub const DEFAULT_WINDOW_BUS_NAME: &str = "org.vmsd.MainWindow";
pub const DEFAULT_WINDOW_PATH: &str = "/main_window";
pub const DEFAULT_WINDOW_INTERFACE: &str = "org.vmsd.MainWindow";
pub const DEFAULT_EMULATOR: &str = "qemu-system-x86_64";
pub const DEFAULT_SAVE_TAG: &str = "vmsd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Well-known name the service registers on the session bus
    pub bus_name: String,
    pub duplicate_start: DuplicateStart,
    /// Keep running when the last machine powers off
    pub resident: bool,
    /// Single-instance lock file
    pub lock_file: PathBuf,
    pub window_bus_name: String,
    pub window_path: String,
    pub window_interface: String,
    /// Emulator used by machine files that name none
    pub emulator: String,
    pub save_tag: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bus_name: DEFAULT_BUS_NAME.to_string(),
            duplicate_start: DuplicateStart::default(),
            resident: false,
            lock_file: default_lock_file(),
            window_bus_name: DEFAULT_WINDOW_BUS_NAME.to_string(),
            window_path: DEFAULT_WINDOW_PATH.to_string(),
            window_interface: DEFAULT_WINDOW_INTERFACE.to_string(),
            emulator: DEFAULT_EMULATOR.to_string(),
            save_tag: DEFAULT_SAVE_TAG.to_string(),
        }
    }
}

/// `$XDG_CONFIG_HOME/vmsd/vmsd.conf`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vmsd").join("vmsd.conf"))
}

/// Lock file in the user's runtime directory, or a per-uid file in /tmp
pub fn default_lock_file() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join("vmsd.lock"),
        None => std::env::temp_dir().join(format!("vmsd-{}.lock", nix::unistd::getuid())),
    }
}

impl Settings {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut parsed = ini::parse_file(content)?;
        let mut settings = Self::default();

        if let Some(mut section) = parsed.remove("[Service]") {
            if let Some(name) = ini::single(&mut section, "BUSNAME")? {
                settings.bus_name = name;
            }
            if let Some(policy) = ini::single(&mut section, "DUPLICATESTART")? {
                settings.duplicate_start = policy.parse().map_err(ConfigError::Invalid)?;
            }
            if let Some(resident) = ini::single(&mut section, "RESIDENT")? {
                settings.resident = ini::parse_bool("Resident", &resident)?;
            }
            if let Some(lock) = ini::single(&mut section, "LOCKFILE")? {
                settings.lock_file = PathBuf::from(lock);
            }
            log_unknown("[Service]", &section);
        }

        if let Some(mut section) = parsed.remove("[Window]") {
            if let Some(name) = ini::single(&mut section, "BUSNAME")? {
                settings.window_bus_name = name;
            }
            if let Some(path) = ini::single(&mut section, "OBJECTPATH")? {
                settings.window_path = path;
            }
            if let Some(interface) = ini::single(&mut section, "INTERFACE")? {
                settings.window_interface = interface;
            }
            log_unknown("[Window]", &section);
        }

        if let Some(mut section) = parsed.remove("[Emulator]") {
            if let Some(program) = ini::single(&mut section, "PROGRAM")? {
                settings.emulator = program;
            }
            if let Some(tag) = ini::single(&mut section, "SAVETAG")? {
                settings.save_tag = tag;
            }
            log_unknown("[Emulator]", &section);
        }

        for name in parsed.keys() {
            log::debug!("ignoring unknown settings section {}", name);
        }

        Ok(settings)
    }

    /// Load settings from `path`, falling back to defaults if it does not exist
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("no settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(ParseError::from(e).into()),
        };
        Self::parse(&content)
    }
}

fn log_unknown(section: &str, entries: &ParsedSection) {
    for key in entries.keys() {
        log::debug!("ignoring unknown setting {} in {}", key, section);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] ParseError),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}
