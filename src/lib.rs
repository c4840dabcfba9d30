//! vmsd - VM session service
//!
//! A single-instance service on the D-Bus session bus that starts emulated
//! machines from machine files and dispatches operations (stop, reset,
//! pause, save, monitor commands, ...) to the running instances.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                      vmsd                        │
//! ├──────────────────────────────────────────────────┤
//! │  Session1 iface │  Dispatcher   │  Window peer   │
//! ├──────────────────────────────────────────────────┤
//! │   Registry (id -> Machine)  ◄── event queue      │
//! ├──────────────────────────────────────────────────┤
//! │           Emulator processes (monitor)           │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! A second `vmsd` process finds the instance guard held and forwards its
//! operation over the bus with [`client::Client::call`].

pub mod client;
pub mod config;
pub mod dbus;
pub mod dispatcher;
pub mod guard;
pub mod ini;
pub mod machine;
pub mod operation;
pub mod service;
pub mod signals;

pub use client::{CallOutcome, Client, ClientError};
pub use config::Settings;
pub use dispatcher::{Dispatcher, DuplicateStart, MachineInfo};
pub use machine::{MachineFile, MachineState};
pub use operation::Operation;
pub use service::{DispatcherHandle, SessionService};
