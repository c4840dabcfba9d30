//! Session service
//!
//! One task owns the [`Dispatcher`]. Bus method calls reach it as jobs over
//! a channel; state changes reported by machines reach it over the event
//! queue. The loop is biased so every pending event is applied before the
//! next job runs.

use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use zbus::Connection;

use crate::config::{ConfigError, Settings};
use crate::dbus::{SessionServer, WindowAnnouncer, WindowTarget};
use crate::dispatcher::Dispatcher;
use crate::guard::{GuardError, InstanceGuard};
use crate::machine::{EmulatorLauncher, EventReceiver};
use crate::operation::Operation;
use crate::signals::{ServiceSignal, SignalHandler};

type Job = Box<dyn FnOnce(&mut Dispatcher) + Send>;

/// Queued jobs before callers wait
const JOB_QUEUE: usize = 64;

/// Cloneable access to the dispatcher task
#[derive(Clone)]
pub struct DispatcherHandle {
    jobs: mpsc::Sender<Job>,
}

impl DispatcherHandle {
    /// Run `f` on the dispatcher task and return its result
    pub async fn run<R, F>(&self, f: F) -> Result<R, ServiceError>
    where
        F: FnOnce(&mut Dispatcher) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |dispatcher| {
            let _ = tx.send(f(dispatcher));
        });
        self.jobs.send(job).await.map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    /// Run the operation a `vmsd` invocation was started with.
    ///
    /// If it leaves the registry empty (failed start, stop of an unknown
    /// machine, ...) a non-resident service is asked to exit.
    pub async fn run_startup(&self, operation: Operation) -> Result<String, ServiceError> {
        self.run(move |dispatcher| {
            let reply = operation.apply(dispatcher);
            dispatcher.quit_if_idle();
            reply
        })
        .await
    }
}

/// Why the dispatch loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// No machine left and not resident
    Drained,
    /// Every handle was dropped
    Closed,
    /// SIGTERM or SIGINT
    Signal(ServiceSignal),
}

pub struct DispatchLoop {
    dispatcher: Dispatcher,
    events: EventReceiver,
    jobs: mpsc::Receiver<Job>,
    quit: mpsc::UnboundedReceiver<()>,
}

impl DispatchLoop {
    pub fn new(
        dispatcher: Dispatcher,
        events: EventReceiver,
        quit: mpsc::UnboundedReceiver<()>,
    ) -> (Self, DispatcherHandle) {
        let (jobs_tx, jobs) = mpsc::channel(JOB_QUEUE);
        let dispatch = Self {
            dispatcher,
            events,
            jobs,
            quit,
        };
        (dispatch, DispatcherHandle { jobs: jobs_tx })
    }

    pub fn dispatcher(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Handle one event or one job. Returns `Some` when the loop should end.
    pub async fn step(&mut self) -> Option<Exit> {
        tokio::select! {
            biased;
            Some(event) = self.events.recv() => {
                self.dispatcher.handle_event(event);
                None
            }
            Some(()) = self.quit.recv() => Some(Exit::Drained),
            job = self.jobs.recv() => match job {
                Some(job) => {
                    job(&mut self.dispatcher);
                    None
                }
                None => Some(Exit::Closed),
            },
        }
    }

    pub async fn run(&mut self) -> Exit {
        loop {
            if let Some(exit) = self.step().await {
                return exit;
            }
        }
    }

    /// Finalize every machine still registered
    pub fn finish(mut self) {
        self.dispatcher.shutdown();
    }
}

/// An initialized session service: guard held, name owned, object exported
pub struct SessionService {
    settings: Settings,
    settings_path: Option<PathBuf>,
    server: SessionServer,
    dispatch: DispatchLoop,
    handle: DispatcherHandle,
    _guard: InstanceGuard,
}

impl SessionService {
    /// Become the session service.
    ///
    /// Returns `Ok(None)` if another instance already holds the guard; in
    /// that case nothing is registered.
    pub async fn init(
        settings: Settings,
        settings_path: Option<PathBuf>,
    ) -> Result<Option<Self>, ServiceError> {
        log::debug!("init service");

        let Some(guard) = InstanceGuard::acquire(&settings.lock_file)? else {
            log::info!(
                "Another instance holds {} (pid {:?})",
                settings.lock_file.display(),
                InstanceGuard::holder(&settings.lock_file)
            );
            return Ok(None);
        };

        let (window_tx, window_rx) = mpsc::unbounded_channel();
        let launcher = EmulatorLauncher::new(settings.emulator.clone(), settings.save_tag.clone())
            .with_window(window_tx);

        let (quit_tx, quit_rx) = mpsc::unbounded_channel();

        // The announcer needs the connection, which needs the handle, which
        // needs the dispatcher: connect first with a placeholder announcer
        // and swap in the real one once the name is owned.
        let (mut dispatcher, events) = Dispatcher::new(
            Box::new(launcher),
            Box::new(WindowAnnouncer::new(None, window_target(&settings))),
            quit_tx,
        );
        dispatcher.set_duplicate_start(settings.duplicate_start);
        dispatcher.set_resident(settings.resident);

        let (mut dispatch, handle) = DispatchLoop::new(dispatcher, events, quit_rx);

        let server = SessionServer::register(&settings.bus_name, handle.clone())
            .await
            .map_err(ServiceError::Bus)?;

        let announcer = WindowAnnouncer::new(
            Some(server.connection().clone()),
            window_target(&settings),
        );
        announcer.spawn_forwarder(window_rx);
        dispatch.dispatcher().set_announcer(Box::new(announcer));

        Ok(Some(Self {
            settings,
            settings_path,
            server,
            dispatch,
            handle,
            _guard: guard,
        }))
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    pub fn connection(&self) -> &Connection {
        self.server.connection()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Serve until the last machine powers off or a termination signal arrives
    pub async fn run(mut self) -> Result<Exit, ServiceError> {
        let mut signals = SignalHandler::new()
            .map_err(ServiceError::Signals)?
            .spawn_forwarder();

        let exit = loop {
            tokio::select! {
                Some(sig) = signals.recv() => {
                    if sig.is_termination() {
                        log::info!("Received {:?}, shutting down", sig);
                        break Exit::Signal(sig);
                    }
                    self.handle_signal(sig).await;
                }
                exit = self.dispatch.step() => {
                    if let Some(exit) = exit {
                        break exit;
                    }
                }
            }
        };

        log::info!("Service exiting ({:?})", exit);
        self.dispatch.finish();
        Ok(exit)
    }

    async fn handle_signal(&mut self, sig: ServiceSignal) {
        match sig {
            ServiceSignal::Hup => self.reload().await,
            ServiceSignal::Usr1 => {
                log::info!("Received SIGUSR1, dumping machines");
                self.dispatch.dispatcher().dump();
            }
            ServiceSignal::Term | ServiceSignal::Int => {}
        }
    }

    async fn reload(&mut self) {
        let Some(path) = self.settings_path.clone() else {
            log::info!("Received SIGHUP, no settings file to reload");
            return;
        };
        match Settings::load(&path).await {
            Ok(settings) => {
                let dispatcher = self.dispatch.dispatcher();
                dispatcher.set_duplicate_start(settings.duplicate_start);
                dispatcher.set_resident(settings.resident);
                log::info!(
                    "Reloaded {} (duplicate start: {}, resident: {})",
                    path.display(),
                    settings.duplicate_start.as_str(),
                    settings.resident
                );
                if settings.bus_name != self.settings.bus_name
                    || settings.lock_file != self.settings.lock_file
                {
                    log::warn!("Bus name and lock file changes take effect on restart");
                }
                self.settings = settings;
            }
            Err(e) => log::error!("Failed to reload {}: {}", path.display(), e),
        }
    }
}

fn window_target(settings: &Settings) -> WindowTarget {
    WindowTarget {
        bus_name: settings.window_bus_name.clone(),
        object_path: settings.window_path.clone(),
        interface: settings.window_interface.clone(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Dispatcher is not running")]
    Stopped,

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(
        "Cannot register on the D-Bus session bus: {0}\nTo start it, run:\n\teval `dbus-launch --auto-syntax`"
    )]
    Bus(#[source] zbus::Error),

    #[error("Signal setup failed: {0}")]
    Signals(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::StateAnnouncer;
    use crate::machine::{
        EventSender, Machine, MachineError, MachineEvent, MachineId, MachineLauncher, MachineState,
    };
    use std::path::Path;

    /// Starts fine and reports power-off as soon as it is stopped
    struct QuickMachine {
        id: MachineId,
        path: PathBuf,
        state: MachineState,
        events: EventSender,
    }

    impl QuickMachine {
        fn report(&mut self, state: MachineState) {
            self.state = state;
            let _ = self.events.send(MachineEvent { id: self.id, state });
        }
    }

    impl Machine for QuickMachine {
        fn config_path(&self) -> &Path {
            &self.path
        }
        fn start(&mut self) -> Result<(), MachineError> {
            self.report(MachineState::Running);
            Ok(())
        }
        fn stop(&mut self) -> Result<(), MachineError> {
            self.report(MachineState::PoweredOff);
            Ok(())
        }
        fn reset(&mut self) -> Result<(), MachineError> {
            Ok(())
        }
        fn pause(&mut self) -> Result<(), MachineError> {
            Ok(())
        }
        fn save_state(&mut self) -> Result<(), MachineError> {
            Ok(())
        }
        fn show_error_log(&mut self) -> Result<(), MachineError> {
            Ok(())
        }
        fn show_control_window(&mut self) -> Result<(), MachineError> {
            Ok(())
        }
        fn send_command(&mut self, _command: &str) -> Result<(), MachineError> {
            Ok(())
        }
        fn state(&self) -> MachineState {
            self.state
        }
    }

    struct QuickLauncher;

    impl MachineLauncher for QuickLauncher {
        fn create(
            &self,
            id: MachineId,
            path: &Path,
            events: EventSender,
        ) -> Result<Box<dyn Machine>, MachineError> {
            Ok(Box::new(QuickMachine {
                id,
                path: path.to_path_buf(),
                state: MachineState::Unknown,
                events,
            }))
        }
    }

    struct Silent;

    impl StateAnnouncer for Silent {
        fn announce(&self, _path: &Path, _state: MachineState) {}
    }

    fn dispatch_loop() -> (DispatchLoop, DispatcherHandle) {
        let (quit_tx, quit_rx) = mpsc::unbounded_channel();
        let (dispatcher, events) = Dispatcher::new(Box::new(QuickLauncher), Box::new(Silent), quit_tx);
        DispatchLoop::new(dispatcher, events, quit_rx)
    }

    #[tokio::test]
    async fn test_jobs_run_on_dispatcher() {
        let (mut dispatch, handle) = dispatch_loop();
        let task = tokio::spawn(async move { dispatch.run().await });

        let reply = handle.run(|d| d.start("/vms/vm1.vm")).await.unwrap();
        assert_eq!(reply, "VM \"/vms/vm1.vm\" got started.");
        assert!(handle.run(|d| d.is_active()).await.unwrap());

        let reply = handle.run(|d| d.stop("/vms/vm1.vm")).await.unwrap();
        assert_eq!(reply, "VM \"/vms/vm1.vm\" got stopped.");

        // The power-off event drains the registry and ends the loop
        assert_eq!(task.await.unwrap(), Exit::Drained);
        assert!(matches!(
            handle.run(|d| d.is_active()).await,
            Err(ServiceError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_events_applied_before_next_job() {
        let (mut dispatch, handle) = dispatch_loop();
        dispatch.dispatcher().set_resident(true);
        let task = tokio::spawn(async move { dispatch.run().await });

        handle.run(|d| d.start("/vms/a.vm")).await.unwrap();
        handle.run(|d| d.start("/vms/b.vm")).await.unwrap();
        handle.run(|d| d.stop("/vms/a.vm")).await.unwrap();

        // The power-off queued by the stop is applied before this job
        let list = handle.run(|d| d.list()).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].path, "/vms/b.vm");

        drop(handle);
        assert_eq!(task.await.unwrap(), Exit::Closed);
    }
}
