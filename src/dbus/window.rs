//! Main window peer
//!
//! State changes are re-announced to the main window process (and as a
//! signal on the session object). Error-log and control-window requests from
//! machines are forwarded to it as well. Everything here is fire-and-forget:
//! failures are logged and dropped.
//!
//! Announcements go through one queue drained by a single task, so they
//! leave in the order the dispatcher applied them.

use std::path::Path;
use tokio::sync::mpsc;
use zbus::Connection;

use super::SessionInterface;
use crate::client::{name_has_owner, send_no_reply, NO_SESSION_BUS};
use crate::dispatcher::StateAnnouncer;
use crate::machine::{MachineState, WindowRequest};

/// Bus address of the main window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowTarget {
    pub bus_name: String,
    pub object_path: String,
    pub interface: String,
}

type Announcement = (String, MachineState);

pub struct WindowAnnouncer {
    connection: Option<Connection>,
    target: WindowTarget,
    announcements: Option<mpsc::UnboundedSender<Announcement>>,
}

impl WindowAnnouncer {
    /// With a connection, spawns the announcement task; it ends when the
    /// announcer is dropped.
    pub fn new(connection: Option<Connection>, target: WindowTarget) -> Self {
        let announcements = connection.as_ref().map(|connection| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(forward_announcements(connection.clone(), target.clone(), rx));
            tx
        });
        Self {
            connection,
            target,
            announcements,
        }
    }

    /// Forward machine window requests until every sender is gone
    pub fn spawn_forwarder(&self, mut requests: mpsc::UnboundedReceiver<WindowRequest>) {
        let connection = self.connection.clone();
        let target = self.target.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let Some(connection) = &connection else {
                    log::warn!("{}", NO_SESSION_BUS);
                    continue;
                };
                let result = match &request {
                    WindowRequest::ShowErrorLog { path, log } => {
                        let path = path.display().to_string();
                        call_window(connection, &target, "ShowErrorLog", &(path.as_str(), log.as_str()))
                            .await
                    }
                    WindowRequest::ShowControlWindow { path } => {
                        let path = path.display().to_string();
                        call_window(connection, &target, "ShowControlWindow", &(path.as_str(),)).await
                    }
                };
                if let Err(e) = result {
                    log::warn!("Window request {:?} dropped: {}", request, e);
                }
            }
        });
    }
}

impl StateAnnouncer for WindowAnnouncer {
    fn announce(&self, path: &Path, state: MachineState) {
        let Some(announcements) = &self.announcements else {
            log::warn!("{}", NO_SESSION_BUS);
            return;
        };
        if announcements.send((path.display().to_string(), state)).is_err() {
            log::warn!("Announcement task is gone, dropping {} ({})", path.display(), state);
        }
    }
}

async fn forward_announcements(
    connection: Connection,
    target: WindowTarget,
    mut announcements: mpsc::UnboundedReceiver<Announcement>,
) {
    while let Some((path, state)) = announcements.recv().await {
        if let Err(e) = SessionInterface::emit_state_changed(&connection, &path, state).await {
            log::warn!("Failed to emit MachineStateChanged for {}: {}", path, e);
        }
        if let Err(e) =
            call_window(&connection, &target, "VmStateChanged", &(path.as_str(), state.as_str()))
                .await
        {
            log::warn!("Failed to announce {} ({}) to window: {}", path, state, e);
        }
    }
}

async fn call_window<B>(
    connection: &Connection,
    target: &WindowTarget,
    method: &str,
    body: &B,
) -> zbus::Result<()>
where
    B: serde::Serialize + zbus::zvariant::DynamicType,
{
    if !name_has_owner(connection, &target.bus_name).await? {
        log::debug!("no window owns {}, skipping {}", target.bus_name, method);
        return Ok(());
    }
    send_no_reply(
        connection,
        &target.bus_name,
        &target.object_path,
        Some(&target.interface),
        method,
        body,
    )
    .await
}
