//! Session bus plumbing
//!
//! - `SessionInterface`: the operations, at `/` under `org.vmsd.Session1`
//! - `WindowAnnouncer`: state changes and window requests sent to the main window

mod session;
mod window;

pub use session::SessionInterface;
pub use window::{WindowAnnouncer, WindowTarget};

use zbus::{connection::Builder, Connection};

use crate::service::DispatcherHandle;

pub const SESSION_PATH: &str = "/";
pub const SESSION_INTERFACE: &str = "org.vmsd.Session1";

/// Connection that owns the service name
pub struct SessionServer {
    connection: Connection,
}

impl SessionServer {
    /// Connect to the session bus, claim `bus_name` and serve the session object
    pub async fn register(bus_name: &str, dispatcher: DispatcherHandle) -> zbus::Result<Self> {
        let connection = Builder::session()?
            .name(bus_name.to_string())?
            .serve_at(SESSION_PATH, SessionInterface::new(dispatcher))?
            .build()
            .await?;

        log::info!("Registered {} on the session bus", bus_name);
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::zvariant::ObjectPath;

    #[test]
    fn test_session_path_is_valid() {
        assert!(ObjectPath::try_from(SESSION_PATH).is_ok());
        assert!(zbus::names::InterfaceName::try_from(SESSION_INTERFACE).is_ok());
        assert!(zbus::names::WellKnownName::try_from(crate::config::DEFAULT_BUS_NAME).is_ok());
    }
}
