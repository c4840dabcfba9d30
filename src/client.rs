//! Client side of the session service
//!
//! Used by a process that wants a running service instance to act on its
//! behalf. Every exported operation takes string arguments and answers with
//! a status line, so a call is just a method name plus one or two strings.

use zbus::message::{Flags, Message};
use zbus::zvariant::DynamicType;
use zbus::{proxy, proxy::CacheProperties, Connection};

use crate::dbus::{SESSION_INTERFACE, SESSION_PATH};
use crate::dispatcher::MachineInfo;

/// Printed whenever the session bus cannot be reached
pub const NO_SESSION_BUS: &str = "Cannot connect to the D-Bus session bus.\n\
    To start it, run:\n\
    \teval `dbus-launch --auto-syntax`";

#[proxy(interface = "org.vmsd.Session1", default_path = "/")]
pub trait Session {
    fn list_machines(&self) -> zbus::Result<Vec<MachineInfo>>;

    #[zbus(property)]
    fn active(&self) -> zbus::Result<bool>;

    #[zbus(signal)]
    fn machine_state_changed(&self, path: &str, state: &str) -> zbus::Result<()>;
}

/// Result of [`Client::call`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Fire-and-forget call was handed to the bus
    Sent,
    /// Reply text of a blocking call
    Reply(String),
}

pub struct Client {
    connection: Connection,
    bus_name: String,
}

impl Client {
    /// Connect to the session bus
    pub async fn connect(bus_name: &str) -> Result<Self, ClientError> {
        let connection = Connection::session()
            .await
            .map_err(ClientError::NoSessionBus)?;
        Ok(Self::with_connection(connection, bus_name))
    }

    pub fn with_connection(connection: Connection, bus_name: &str) -> Self {
        Self {
            connection,
            bus_name: bus_name.to_string(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether some process currently owns the service name
    pub async fn is_running(&self) -> Result<bool, ClientError> {
        Ok(name_has_owner(&self.connection, &self.bus_name).await?)
    }

    /// Invoke `command` on the running service.
    ///
    /// With `noblock` the call is sent without waiting for (or wanting) a
    /// reply. Otherwise the reply text or the remote error is returned.
    pub async fn call(
        &self,
        command: &str,
        args: &[String],
        noblock: bool,
    ) -> Result<CallOutcome, ClientError> {
        match args {
            [] => Err(ClientError::NoArguments(command.to_string())),
            [path] => self.invoke(command, &(path.as_str(),), noblock).await,
            [path, extra] => {
                self.invoke(command, &(path.as_str(), extra.as_str()), noblock)
                    .await
            }
            _ => Err(ClientError::TooManyArguments(command.to_string(), args.len())),
        }
    }

    async fn invoke<B>(&self, command: &str, body: &B, noblock: bool) -> Result<CallOutcome, ClientError>
    where
        B: serde::Serialize + DynamicType,
    {
        if !self.is_running().await? {
            return Err(ClientError::NotRunning(self.bus_name.clone()));
        }

        log::debug!("calling {} (noblock={})", command, noblock);

        if noblock {
            self.send(command, body).await?;
            return Ok(CallOutcome::Sent);
        }

        match self.request(command, body).await {
            Ok(text) => Ok(CallOutcome::Reply(text)),
            Err(zbus::Error::MethodError(name, detail, _)) => {
                Err(ClientError::Remote(detail.unwrap_or_else(|| name.to_string())))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Call an operation on one machine, with an optional second argument
    pub async fn call_for_machine(
        &self,
        command: &str,
        path: &str,
        extra: Option<&str>,
        noblock: bool,
    ) -> Result<CallOutcome, ClientError> {
        let mut args = vec![path.to_string()];
        args.extend(extra.map(str::to_string));
        self.call(command, &args, noblock).await
    }

    pub async fn proxy(&self) -> Result<SessionProxy<'static>, ClientError> {
        let proxy = SessionProxy::builder(&self.connection)
            .destination(self.bus_name.clone())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        Ok(proxy)
    }

    pub async fn list_machines(&self) -> Result<Vec<MachineInfo>, ClientError> {
        Ok(self.proxy().await?.list_machines().await?)
    }

    pub async fn is_active(&self) -> Result<bool, ClientError> {
        Ok(self.proxy().await?.active().await?)
    }

    async fn send<B>(&self, method: &str, body: &B) -> zbus::Result<()>
    where
        B: serde::Serialize + DynamicType,
    {
        send_no_reply(
            &self.connection,
            &self.bus_name,
            SESSION_PATH,
            Some(SESSION_INTERFACE),
            method,
            body,
        )
        .await
    }

    async fn request<B>(&self, method: &str, body: &B) -> zbus::Result<String>
    where
        B: serde::Serialize + DynamicType,
    {
        let reply = self
            .connection
            .call_method(
                Some(self.bus_name.as_str()),
                SESSION_PATH,
                Some(SESSION_INTERFACE),
                method,
                body,
            )
            .await?;
        reply.body().deserialize::<String>()
    }
}

/// Ask the bus daemon whether `name` has an owner
pub async fn name_has_owner(connection: &Connection, name: &str) -> zbus::Result<bool> {
    let reply = connection
        .call_method(
            Some("org.freedesktop.DBus"),
            "/org/freedesktop/DBus",
            Some("org.freedesktop.DBus"),
            "NameHasOwner",
            &(name,),
        )
        .await?;
    reply.body().deserialize::<bool>()
}

/// Send a method call flagged as not expecting a reply
pub async fn send_no_reply<B>(
    connection: &Connection,
    destination: &str,
    path: &str,
    interface: Option<&str>,
    method: &str,
    body: &B,
) -> zbus::Result<()>
where
    B: serde::Serialize + DynamicType,
{
    let mut builder = Message::method_call(path, method)?.destination(destination)?;
    if let Some(interface) = interface {
        builder = builder.interface(interface)?;
    }
    let message = builder.with_flags(Flags::NoReplyExpected)?.build(body)?;
    connection.send(&message).await
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(
        "Cannot connect to the D-Bus session bus: {0}\nTo start it, run:\n\teval `dbus-launch --auto-syntax`"
    )]
    NoSessionBus(#[source] zbus::Error),

    #[error("No arguments given for {0}")]
    NoArguments(String),

    #[error("{0} takes at most two arguments, got {1}")]
    TooManyArguments(String, usize),

    #[error("No service owns {0}")]
    NotRunning(String),

    #[error("Call failed: {0}")]
    Remote(String),

    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),
}
