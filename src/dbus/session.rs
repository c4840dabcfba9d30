//! org.vmsd.Session1 interface
//!
//! Exported at `/`. The lowercase methods are the operations front ends call
//! by name; each one answers with a status line.

use zbus::{
    fdo, interface,
    object_server::SignalEmitter,
    Connection,
};

use super::SESSION_PATH;
use crate::dispatcher::MachineInfo;
use crate::machine::MachineState;
use crate::service::{DispatcherHandle, ServiceError};

pub struct SessionInterface {
    dispatcher: DispatcherHandle,
}

impl SessionInterface {
    pub fn new(dispatcher: DispatcherHandle) -> Self {
        Self { dispatcher }
    }

    /// Emit MachineStateChanged from the session object
    pub async fn emit_state_changed(
        connection: &Connection,
        path: &str,
        state: MachineState,
    ) -> zbus::Result<()> {
        let emitter = SignalEmitter::new(connection, SESSION_PATH)?;
        Self::machine_state_changed(&emitter, path, state.as_str()).await
    }
}

fn failed(e: ServiceError) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.vmsd.Session1")]
impl SessionInterface {
    #[zbus(name = "start")]
    async fn start(&self, path: String) -> fdo::Result<String> {
        log::info!("D-Bus start: {}", path);
        self.dispatcher.run(move |d| d.start(&path)).await.map_err(failed)
    }

    #[zbus(name = "stop")]
    async fn stop(&self, path: String) -> fdo::Result<String> {
        log::info!("D-Bus stop: {}", path);
        self.dispatcher.run(move |d| d.stop(&path)).await.map_err(failed)
    }

    #[zbus(name = "reset")]
    async fn reset(&self, path: String) -> fdo::Result<String> {
        log::info!("D-Bus reset: {}", path);
        self.dispatcher.run(move |d| d.reset(&path)).await.map_err(failed)
    }

    #[zbus(name = "pause")]
    async fn pause(&self, path: String) -> fdo::Result<String> {
        log::info!("D-Bus pause: {}", path);
        self.dispatcher.run(move |d| d.pause(&path)).await.map_err(failed)
    }

    #[zbus(name = "save")]
    async fn save(&self, path: String) -> fdo::Result<String> {
        log::info!("D-Bus save: {}", path);
        self.dispatcher.run(move |d| d.save(&path)).await.map_err(failed)
    }

    /// Show the machine's error log window
    #[zbus(name = "error")]
    async fn error(&self, path: String) -> fdo::Result<String> {
        log::info!("D-Bus error: {}", path);
        self.dispatcher.run(move |d| d.error(&path)).await.map_err(failed)
    }

    /// Show the machine's emulator control window
    #[zbus(name = "control")]
    async fn control(&self, path: String) -> fdo::Result<String> {
        log::info!("D-Bus control: {}", path);
        self.dispatcher.run(move |d| d.control(&path)).await.map_err(failed)
    }

    #[zbus(name = "status")]
    async fn status(&self, path: String) -> fdo::Result<String> {
        log::debug!("D-Bus status: {}", path);
        self.dispatcher.run(move |d| d.status(&path)).await.map_err(failed)
    }

    /// Send a raw monitor command
    #[zbus(name = "command")]
    async fn command(&self, path: String, command: String) -> fdo::Result<String> {
        log::info!("D-Bus command: {} {:?}", path, command);
        self.dispatcher
            .run(move |d| d.command(&path, &command))
            .await
            .map_err(failed)
    }

    /// Registered machines in start order
    async fn list_machines(&self) -> fdo::Result<Vec<MachineInfo>> {
        self.dispatcher.run(|d| d.list()).await.map_err(failed)
    }

    // ==================== Signals ====================

    /// Emitted after every applied state change
    #[zbus(signal)]
    async fn machine_state_changed(
        emitter: &SignalEmitter<'_>,
        path: &str,
        state: &str,
    ) -> zbus::Result<()>;

    // ==================== Properties ====================

    /// True while any machine is registered
    #[zbus(property)]
    async fn active(&self) -> bool {
        self.dispatcher.run(|d| d.is_active()).await.unwrap_or(false)
    }
}
