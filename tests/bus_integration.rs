//! Session bus round trips
//!
//! Each test owns a unique bus name and lock file. Tests return early when
//! no session bus is reachable (CI containers usually have none).

use futures_lite::StreamExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use zbus::{interface, proxy::CacheProperties, Connection};

use vmsd::client::SessionProxy;
use vmsd::config::{DEFAULT_WINDOW_INTERFACE, DEFAULT_WINDOW_PATH};
use vmsd::dbus::{WindowAnnouncer, WindowTarget};
use vmsd::dispatcher::StateAnnouncer;
use vmsd::{CallOutcome, Client, ClientError, MachineState, SessionService, Settings};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

const MONITOR_SCRIPT: &str = r#"
while read line; do
  case "$line" in
    quit) exit 0 ;;
  esac
done
"#;

fn unique_test_dir() -> (PathBuf, u32) {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/tmp/vmsd-bus-test-{}-{}", std::process::id(), id));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    (dir, id)
}

async fn session_bus() -> Option<Connection> {
    match Connection::session().await {
        Ok(conn) => Some(conn),
        Err(e) => {
            eprintln!("skipping: no session bus ({})", e);
            None
        }
    }
}

fn test_settings(dir: &Path, id: u32) -> Settings {
    Settings {
        bus_name: format!("org.vmsd.Test.p{}.t{}", std::process::id(), id),
        resident: true,
        lock_file: dir.join("vmsd.lock"),
        window_bus_name: format!("org.vmsd.TestWindow.p{}.t{}", std::process::id(), id),
        ..Settings::default()
    }
}

/// Stands in for the main window and records every call it receives
struct FakeWindow {
    calls: mpsc::UnboundedSender<String>,
}

#[interface(name = "org.vmsd.MainWindow")]
impl FakeWindow {
    async fn vm_state_changed(&self, path: String, state: String) {
        let _ = self.calls.send(format!("VmStateChanged {} {}", path, state));
    }

    async fn show_error_log(&self, path: String, _log: String) {
        let _ = self.calls.send(format!("ShowErrorLog {}", path));
    }

    async fn show_control_window(&self, path: String) {
        let _ = self.calls.send(format!("ShowControlWindow {}", path));
    }
}

async fn serve_window(name: &str) -> (Connection, mpsc::UnboundedReceiver<String>) {
    let (calls, rx) = mpsc::unbounded_channel();
    let conn = zbus::connection::Builder::session()
        .unwrap()
        .name(name.to_string())
        .unwrap()
        .serve_at(DEFAULT_WINDOW_PATH, FakeWindow { calls })
        .unwrap()
        .build()
        .await
        .unwrap();
    assert_eq!(DEFAULT_WINDOW_INTERFACE, "org.vmsd.MainWindow");
    (conn, rx)
}

/// Read window calls into `seen` until `expected` shows up
async fn wait_for_call(
    calls: &mut mpsc::UnboundedReceiver<String>,
    seen: &mut Vec<String>,
    expected: &str,
) {
    if seen.iter().any(|c| c == expected) {
        return;
    }
    let found = timeout(Duration::from_secs(5), async {
        while let Some(call) = calls.recv().await {
            let done = call == expected;
            seen.push(call);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(found, Ok(true), "window never got {:?}, saw {:?}", expected, seen);
}

fn write_vm(dir: &Path) -> String {
    let script = dir.join("monitor.sh");
    fs::write(&script, MONITOR_SCRIPT).unwrap();
    let vm = dir.join("vm1.vm");
    fs::write(
        &vm,
        format!("[Machine]\nEmulator=/bin/sh\nArguments={}\n", script.display()),
    )
    .unwrap();
    vm.display().to_string()
}

#[tokio::test]
async fn test_call_unknown_machine() {
    let Some(conn) = session_bus().await else {
        return;
    };
    let (dir, id) = unique_test_dir();
    let settings = test_settings(&dir, id);
    let bus_name = settings.bus_name.clone();

    let service = assert_ok!(SessionService::init(settings.clone(), None).await)
        .expect("guard should be free");
    tokio::spawn(service.run());

    // A second instance finds the guard held
    let second = assert_ok!(SessionService::init(settings, None).await);
    assert!(second.is_none());

    let client = Client::with_connection(conn, &bus_name);
    assert!(assert_ok!(client.is_running().await));

    let args = vec!["/nonexistent/vm2.vm".to_string()];
    let reply = assert_ok!(client.call("status", &args, false).await);
    assert_eq!(
        reply,
        CallOutcome::Reply("Could not show state of VM \"/nonexistent/vm2.vm\".".into())
    );

    let sent = assert_ok!(client.call("stop", &args, true).await);
    assert_eq!(sent, CallOutcome::Sent);

    assert!(assert_ok!(client.list_machines().await).is_empty());
    assert!(!assert_ok!(client.is_active().await));

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_call_argument_checks() {
    let Some(conn) = session_bus().await else {
        return;
    };
    let client = Client::with_connection(conn, "org.vmsd.Test.NobodyHome");

    let err = assert_err!(client.call("status", &[], false).await);
    assert!(matches!(err, ClientError::NoArguments(_)));

    let args = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let err = assert_err!(client.call("command", &args, false).await);
    assert!(matches!(err, ClientError::TooManyArguments(_, 3)));

    let err = assert_err!(client.call("status", &["a".to_string()], false).await);
    assert!(matches!(err, ClientError::NotRunning(_)));
}

#[tokio::test]
async fn test_start_and_stop_over_bus() {
    let Some(conn) = session_bus().await else {
        return;
    };
    let (dir, id) = unique_test_dir();
    let settings = test_settings(&dir, id);
    let bus_name = settings.bus_name.clone();
    let vm = write_vm(&dir);

    let service = assert_ok!(SessionService::init(settings, None).await)
        .expect("guard should be free");
    tokio::spawn(service.run());

    let client = Client::with_connection(conn, &bus_name);
    let proxy = assert_ok!(client.proxy().await);
    let mut changes = assert_ok!(proxy.receive_machine_state_changed().await);

    let reply = assert_ok!(client.call_for_machine("start", &vm, None, false).await);
    assert_eq!(reply, CallOutcome::Reply(format!("VM \"{}\" got started.", vm)));

    let machines = assert_ok!(client.list_machines().await);
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].path, vm);
    assert!(assert_ok!(client.is_active().await));

    let reply = assert_ok!(client.call_for_machine("status", &vm, None, false).await);
    assert_eq!(reply, CallOutcome::Reply("VM state:  Running.".into()));

    let reply = assert_ok!(client.call_for_machine("stop", &vm, None, false).await);
    assert_eq!(reply, CallOutcome::Reply(format!("VM \"{}\" got stopped.", vm)));

    // Wait for the power-off to be applied and announced
    let powered_off = timeout(Duration::from_secs(5), async {
        while let Some(signal) = changes.next().await {
            let args = signal.args().unwrap();
            if *args.path() == vm && *args.state() == "powered-off" {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(powered_off, Ok(true));

    assert!(assert_ok!(client.list_machines().await).is_empty());

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_window_receives_announcements_and_requests() {
    let Some(conn) = session_bus().await else {
        return;
    };
    let (dir, id) = unique_test_dir();
    let settings = test_settings(&dir, id);
    let bus_name = settings.bus_name.clone();
    let vm = write_vm(&dir);

    let (_window, mut calls) = serve_window(&settings.window_bus_name).await;

    let service = assert_ok!(SessionService::init(settings, None).await)
        .expect("guard should be free");
    tokio::spawn(service.run());

    let client = Client::with_connection(conn, &bus_name);
    let mut seen = Vec::new();

    assert_ok!(client.call_for_machine("start", &vm, None, false).await);
    wait_for_call(&mut calls, &mut seen, &format!("VmStateChanged {} running", vm)).await;

    let reply = assert_ok!(client.call_for_machine("control", &vm, None, false).await);
    assert_eq!(
        reply,
        CallOutcome::Reply(format!("VM control window of \"{}\" got shown.", vm))
    );
    wait_for_call(&mut calls, &mut seen, &format!("ShowControlWindow {}", vm)).await;

    let reply = assert_ok!(client.call_for_machine("error", &vm, None, false).await);
    assert_eq!(
        reply,
        CallOutcome::Reply(format!("VM error log window of \"{}\" got shown.", vm))
    );
    wait_for_call(&mut calls, &mut seen, &format!("ShowErrorLog {}", vm)).await;

    // Fire-and-forget on a live machine still takes effect
    let sent = assert_ok!(client.call_for_machine("pause", &vm, None, true).await);
    assert_eq!(sent, CallOutcome::Sent);
    wait_for_call(&mut calls, &mut seen, &format!("VmStateChanged {} paused", vm)).await;

    assert_ok!(client.call_for_machine("stop", &vm, None, false).await);
    wait_for_call(&mut calls, &mut seen, &format!("VmStateChanged {} powered-off", vm)).await;

    let states: Vec<&str> = seen
        .iter()
        .filter_map(|c| c.strip_prefix("VmStateChanged "))
        .filter_map(|c| c.strip_prefix(vm.as_str()))
        .map(str::trim)
        .collect();
    assert_eq!(states, vec!["running", "paused", "powered-off"]);

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_remote_error_is_surfaced() {
    let Some(conn) = session_bus().await else {
        return;
    };
    let (dir, id) = unique_test_dir();
    let settings = test_settings(&dir, id);
    let bus_name = settings.bus_name.clone();

    let service = assert_ok!(SessionService::init(settings, None).await)
        .expect("guard should be free");
    tokio::spawn(service.run());

    let client = Client::with_connection(conn, &bus_name);
    let args = vec!["/nonexistent/vm1.vm".to_string()];
    let err = assert_err!(client.call("bogus", &args, false).await);
    match err {
        ClientError::Remote(text) => assert!(!text.is_empty()),
        other => panic!("expected a remote error, got {:?}", other),
    }

    // The same call without waiting never sees the error
    let sent = assert_ok!(client.call("bogus", &args, true).await);
    assert_eq!(sent, CallOutcome::Sent);

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_announcements_keep_order() {
    let Some(listener) = session_bus().await else {
        return;
    };
    let source = assert_ok!(Connection::session().await);
    let sender = source.unique_name().expect("connected").to_string();

    let proxy = assert_ok!(
        assert_ok!(SessionProxy::builder(&listener).destination(sender))
            .cache_properties(CacheProperties::No)
            .build()
            .await
    );
    let mut changes = assert_ok!(proxy.receive_machine_state_changed().await);

    let announcer = WindowAnnouncer::new(
        Some(source.clone()),
        WindowTarget {
            bus_name: format!("org.vmsd.TestWindow.p{}.nobody", std::process::id()),
            object_path: DEFAULT_WINDOW_PATH.to_string(),
            interface: DEFAULT_WINDOW_INTERFACE.to_string(),
        },
    );

    // An unexpected exit reports Error then PoweredOff
    let mut expected = Vec::new();
    for i in 0..100 {
        let path = format!("/vms/vm{}.vm", i);
        for state in [MachineState::Error, MachineState::PoweredOff] {
            announcer.announce(Path::new(&path), state);
            expected.push((path.clone(), state.as_str().to_string()));
        }
    }

    let received = timeout(Duration::from_secs(30), async {
        let mut received = Vec::new();
        while received.len() < expected.len() {
            let Some(signal) = changes.next().await else {
                break;
            };
            let args = signal.args().unwrap();
            received.push((args.path().to_string(), args.state().to_string()));
        }
        received
    })
    .await
    .expect("timed out waiting for announcements");

    assert_eq!(received, expected);
}
