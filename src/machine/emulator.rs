//! Emulator-backed machine handle
//!
//! Spawns the emulator with its monitor on stdin (QEMU `-monitor stdio`
//! style) and drives it with one command per line. The emulator exiting is
//! reported as a power-off.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    EventSender, Machine, MachineError, MachineEvent, MachineFile, MachineId, MachineLauncher,
    MachineState,
};

/// Stderr lines kept per machine
const ERROR_LOG_LINES: usize = 200;

/// Requests a handle routes to the main window process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowRequest {
    ShowErrorLog { path: PathBuf, log: String },
    ShowControlWindow { path: PathBuf },
}

/// Builds [`EmulatorMachine`]s from machine files
pub struct EmulatorLauncher {
    default_program: String,
    default_save_tag: String,
    window: Option<mpsc::UnboundedSender<WindowRequest>>,
}

impl EmulatorLauncher {
    pub fn new(default_program: impl Into<String>, default_save_tag: impl Into<String>) -> Self {
        Self {
            default_program: default_program.into(),
            default_save_tag: default_save_tag.into(),
            window: None,
        }
    }

    /// Route error-log and control-window requests to `window`
    pub fn with_window(mut self, window: mpsc::UnboundedSender<WindowRequest>) -> Self {
        self.window = Some(window);
        self
    }
}

impl MachineLauncher for EmulatorLauncher {
    fn create(
        &self,
        id: MachineId,
        path: &Path,
        events: EventSender,
    ) -> Result<Box<dyn Machine>, MachineError> {
        let file = MachineFile::load(path)
            .map_err(|e| MachineError::Load(path.display().to_string(), e))?;

        let program = file
            .emulator
            .clone()
            .unwrap_or_else(|| self.default_program.clone());
        if program.is_empty() {
            return Err(MachineError::NoEmulator(path.display().to_string()));
        }
        let save_tag = file
            .save_tag
            .clone()
            .unwrap_or_else(|| self.default_save_tag.clone());

        Ok(Box::new(EmulatorMachine::new(
            id,
            file,
            program,
            save_tag,
            events,
            self.window.clone(),
        )))
    }
}

pub struct EmulatorMachine {
    id: MachineId,
    file: MachineFile,
    program: String,
    save_tag: String,
    state: Arc<watch::Sender<MachineState>>,
    events: EventSender,
    window: Option<mpsc::UnboundedSender<WindowRequest>>,
    /// Lines queued for the emulator's stdin
    monitor: Option<mpsc::UnboundedSender<String>>,
    error_log: Arc<Mutex<VecDeque<String>>>,
    stop_requested: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EmulatorMachine {
    pub fn new(
        id: MachineId,
        file: MachineFile,
        program: String,
        save_tag: String,
        events: EventSender,
        window: Option<mpsc::UnboundedSender<WindowRequest>>,
    ) -> Self {
        let (state, _) = watch::channel(MachineState::Unknown);
        Self {
            id,
            file,
            program,
            save_tag,
            state: Arc::new(state),
            events,
            window,
            monitor: None,
            error_log: Arc::new(Mutex::new(VecDeque::new())),
            stop_requested: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.file.name
    }

    /// Captured emulator stderr, oldest line first
    pub fn error_log(&self) -> String {
        let log = self.error_log.lock().unwrap_or_else(PoisonError::into_inner);
        log.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    fn require_live(&self) -> Result<(), MachineError> {
        let state = *self.state.borrow();
        if state.is_live() {
            Ok(())
        } else {
            Err(MachineError::NotRunning(state))
        }
    }

    fn monitor_command(&self, line: &str) -> Result<(), MachineError> {
        self.require_live()?;
        log::debug!("{} monitor <- {}", self.file.name, line);
        self.monitor
            .as_ref()
            .ok_or(MachineError::MonitorClosed)?
            .send(line.to_string())
            .map_err(|_| MachineError::MonitorClosed)
    }

    fn window_request(&self, request: WindowRequest, what: &'static str) -> Result<(), MachineError> {
        self.window
            .as_ref()
            .ok_or(MachineError::NoWindow(what))?
            .send(request)
            .map_err(|_| MachineError::NoWindow(what))
    }
}

/// Move to `next` if legal and report it
fn transition(
    state: &watch::Sender<MachineState>,
    events: &EventSender,
    id: MachineId,
    next: MachineState,
) {
    let current = *state.borrow();
    if !current.can_become(next) {
        log::debug!("{} ignoring transition {} -> {}", id, current, next);
        return;
    }
    state.send_replace(next);
    if events.send(MachineEvent { id, state: next }).is_err() {
        log::debug!("{} event queue closed, dropping {}", id, next);
    }
}

impl Machine for EmulatorMachine {
    fn config_path(&self) -> &Path {
        &self.file.path
    }

    fn start(&mut self) -> Result<(), MachineError> {
        let state = *self.state.borrow();
        if state != MachineState::Unknown {
            return Err(MachineError::AlreadyStarted);
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.file.arguments)
            .envs(self.file.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(wd) = &self.file.working_directory {
            cmd.current_dir(wd);
        }

        let mut child = cmd.spawn()?;
        log::info!(
            "{} started {} (pid {})",
            self.file.name,
            self.program,
            child.id().unwrap_or(0)
        );

        let name = self.file.name.clone();

        if let Some(mut stdin) = child.stdin.take() {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let name = name.clone();
            self.tasks.push(tokio::spawn(async move {
                while let Some(mut line) = rx.recv().await {
                    line.push('\n');
                    let written = match stdin.write_all(line.as_bytes()).await {
                        Ok(()) => stdin.flush().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        log::warn!("{} monitor write failed: {}", name, e);
                        break;
                    }
                }
            }));
            self.monitor = Some(tx);
        }

        if let Some(stdout) = child.stdout.take() {
            let name = name.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("{} monitor -> {}", name, line);
                }
            }));
        }

        if let Some(stderr) = child.stderr.take() {
            let name = name.clone();
            let error_log = Arc::clone(&self.error_log);
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("{} stderr: {}", name, line);
                    let mut log = error_log.lock().unwrap_or_else(PoisonError::into_inner);
                    if log.len() == ERROR_LOG_LINES {
                        log.pop_front();
                    }
                    log.push_back(line);
                }
            }));
        }

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let stop_requested = Arc::clone(&self.stop_requested);
        let id = self.id;
        self.tasks.push(tokio::spawn(async move {
            let status = child.wait().await;
            match status {
                Ok(status) if !status.success() && !stop_requested.load(Ordering::SeqCst) => {
                    log::warn!("{} emulator exited unexpectedly: {}", name, status);
                    transition(&state, &events, id, MachineState::Error);
                }
                Ok(status) => log::info!("{} emulator exited: {}", name, status),
                Err(e) => {
                    log::error!("{} failed to wait for emulator: {}", name, e);
                    transition(&state, &events, id, MachineState::Error);
                }
            }
            transition(&state, &events, id, MachineState::PoweredOff);
        }));

        transition(&self.state, &self.events, self.id, MachineState::Running);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), MachineError> {
        self.require_live()?;
        self.stop_requested.store(true, Ordering::SeqCst);
        self.monitor_command("quit")
    }

    fn reset(&mut self) -> Result<(), MachineError> {
        self.monitor_command("system_reset")
    }

    fn pause(&mut self) -> Result<(), MachineError> {
        let (line, next) = match *self.state.borrow() {
            MachineState::Running => ("stop", MachineState::Paused),
            MachineState::Paused => ("cont", MachineState::Running),
            other => return Err(MachineError::NotRunning(other)),
        };
        self.monitor_command(line)?;
        transition(&self.state, &self.events, self.id, next);
        Ok(())
    }

    fn save_state(&mut self) -> Result<(), MachineError> {
        let line = format!("savevm {}", self.save_tag);
        self.monitor_command(&line)
    }

    fn show_error_log(&mut self) -> Result<(), MachineError> {
        let request = WindowRequest::ShowErrorLog {
            path: self.file.path.clone(),
            log: self.error_log(),
        };
        self.window_request(request, "error log")
    }

    fn show_control_window(&mut self) -> Result<(), MachineError> {
        let request = WindowRequest::ShowControlWindow {
            path: self.file.path.clone(),
        };
        self.window_request(request, "control window")
    }

    fn send_command(&mut self, command: &str) -> Result<(), MachineError> {
        self.monitor_command(command)
    }

    fn state(&self) -> MachineState {
        *self.state.borrow()
    }
}

impl Drop for EmulatorMachine {
    fn drop(&mut self) {
        // Aborting the waiter drops the child, which kills a still-running emulator
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(window: Option<mpsc::UnboundedSender<WindowRequest>>) -> EmulatorMachine {
        let file = MachineFile::parse(Path::new("/vms/t.vm"), "[Machine]\nName=t\n").unwrap();
        let (events, _rx) = mpsc::unbounded_channel();
        EmulatorMachine::new(
            MachineId(1),
            file,
            "/bin/true".into(),
            "vmsd".into(),
            events,
            window,
        )
    }

    #[test]
    fn test_commands_require_running() {
        let mut vm = machine(None);
        assert_eq!(vm.state(), MachineState::Unknown);
        assert!(matches!(vm.stop(), Err(MachineError::NotRunning(MachineState::Unknown))));
        assert!(matches!(vm.reset(), Err(MachineError::NotRunning(_))));
        assert!(matches!(vm.pause(), Err(MachineError::NotRunning(_))));
        assert!(matches!(vm.save_state(), Err(MachineError::NotRunning(_))));
        assert!(matches!(vm.send_command("info status"), Err(MachineError::NotRunning(_))));
    }

    #[test]
    fn test_window_requests_need_window() {
        let mut vm = machine(None);
        assert!(matches!(vm.show_error_log(), Err(MachineError::NoWindow("error log"))));
        assert!(matches!(
            vm.show_control_window(),
            Err(MachineError::NoWindow("control window"))
        ));
    }

    #[test]
    fn test_window_requests_are_routed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut vm = machine(Some(tx));
        vm.show_control_window().unwrap();
        vm.show_error_log().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            WindowRequest::ShowControlWindow { path: PathBuf::from("/vms/t.vm") }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            WindowRequest::ShowErrorLog { path: PathBuf::from("/vms/t.vm"), log: String::new() }
        );
    }

    #[test]
    fn test_launcher_reports_missing_file() {
        let launcher = EmulatorLauncher::new("qemu-system-x86_64", "vmsd");
        let (events, _rx) = mpsc::unbounded_channel();
        let result = launcher.create(MachineId(1), Path::new("/nonexistent/vmsd/x.vm"), events);
        assert!(matches!(result, Err(MachineError::Load(..))));
    }
}
