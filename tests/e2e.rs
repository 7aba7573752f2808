//! End-to-end tests for the rgbkbd daemon core
//!
//! These tests drive the real device table, scheduler and command FIFOs:
//! - Device attach and control-directory exposure
//! - Command ingestion and tick ordering
//! - Fault handling and hotplug
//! - Effects running over the FIFO interface
//! - Shutdown under lock contention
//!
//! USB and uinput are replaced by scripted collaborators so no hardware or
//! privileges are needed.

use rgbkbd_common::Argb;
use rgbkbd_e2e::{keyboard, TestDaemon};
use rgbkbdd::device::{Features, UsbCommand, ROOT_SLOT};
use rgbkbdd::keymap::KeyEvent;
use rgbkbdd::shutdown::{quiesce, ShutdownCoordinator, SHUTDOWN_SIGNALS};
use rgbkbdd::Layout;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn daemon() -> (TempDir, TestDaemon) {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let daemon = TestDaemon::new(&temp_dir.path().join("rgbkbd"));
    (temp_dir, daemon)
}

#[test]
fn test_attach_exposes_control_directory() {
    let (_temp, d) = daemon();
    let slot = d.plug(keyboard("/dev/hidraw3", "ABC123", 0x0120)).unwrap();
    assert_eq!(slot, 1);

    let dir = d.node_dir(slot);
    assert_eq!(fs::read_to_string(dir.join("model")).unwrap(), "Corsair K95 RGB\n");
    assert_eq!(fs::read_to_string(dir.join("serial")).unwrap(), "ABC123\n");
    assert_eq!(fs::read_to_string(dir.join("fwversion")).unwrap(), "0120\n");
    assert_eq!(fs::read_to_string(dir.join("features")).unwrap(), "rgb bind notify\n");
    assert!(dir.join("cmd").exists());

    let root = d.node_dir(ROOT_SLOT);
    assert_eq!(fs::read_to_string(root.join("pid")).unwrap().trim(), std::process::id().to_string());
}

#[test]
fn test_fifo_command_waits_for_next_tick() {
    let (_temp, mut d) = daemon();
    let slot = d.plug(keyboard("/dev/hidraw0", "A", 0x0100)).unwrap();
    d.settle(slot);

    d.send(slot, "rgb all:0000ff");
    d.tick(1);
    let queued_tick = d.scheduler.tick_count();
    assert!(d.usb.sent_to(slot).iter().all(|s| s.tick < queued_tick));

    d.tick(1);
    let last = d.usb.sent_to(slot).pop().unwrap();
    assert_eq!(last.tick, queued_tick + 1);
    let UsbCommand::Colors(colors) = last.command else {
        panic!("expected a color frame, got {:?}", last.command);
    };
    assert!(colors.iter().all(|c| *c == Argb::opaque(0, 0, 255)));
}

#[test]
fn test_commands_for_two_devices_in_one_pass() {
    let (_temp, mut d) = daemon();
    let first = d.plug(keyboard("/dev/hidraw0", "A", 0x0100)).unwrap();
    let second = d.plug(keyboard("/dev/hidraw1", "B", 0x0100)).unwrap();
    d.settle(first);
    d.settle(second);

    d.send(first, "rgb off");
    d.send(second, "rgb 0:ff0000");
    d.tick(1);
    assert!(!d.table.slot(first).lock().lighting.enabled);
    assert_eq!(d.table.slot(second).lock().lighting.base[0], Argb::opaque(255, 0, 0));
}

#[test]
fn test_unrecoverable_fault_disconnects_and_replug_reattaches() {
    let (_temp, mut d) = daemon();
    let info = keyboard("/dev/hidraw5", "FAULTY", 0x0100);
    let slot = d.plug(info.clone()).unwrap();
    d.usb.break_device(&info.devnode, false);
    d.tick(1);

    {
        let rec = d.table.slot(slot).lock();
        assert!(!rec.is_connected());
        assert!(rec.is_idle());
        assert!(rec.fifo.is_none());
    }
    assert!(!d.node_dir(slot).exists());
    let events = d.events();
    let tail: Vec<&str> = events.iter().rev().take(3).rev().map(String::as_str).collect();
    assert_eq!(tail, vec!["reset 1", "stop 1", "close 1"]);

    // the slot is free again for the next attach
    let again = d.plug(keyboard("/dev/hidraw6", "REPLACED", 0x0100)).unwrap();
    assert_eq!(again, slot);
    assert!(d.node_dir(slot).join("cmd").exists());
}

#[test]
fn test_recoverable_fault_keeps_device() {
    let (_temp, mut d) = daemon();
    let info = keyboard("/dev/hidraw2", "FLAKY", 0x0100);
    let slot = d.plug(info.clone()).unwrap();
    d.usb.break_device(&info.devnode, true);
    d.tick(1);
    assert!(d.table.slot(slot).lock().is_connected());
    assert!(d.usb.sent_to(slot).is_empty());
    d.settle(slot);
    assert_eq!(d.usb.sent_to(slot).len(), 2);
}

#[test]
fn test_root_admin_commands() {
    let (_temp, mut d) = daemon();
    let slot = d.plug(keyboard("/dev/hidraw0", "A", 0x0100)).unwrap();

    // admin commands are ignored on device records
    d.send(slot, "fps 5");
    d.tick(1);
    assert_eq!(d.globals.fps(), 30);

    d.send(ROOT_SLOT, "fps 500");
    d.send(ROOT_SLOT, "layout de");
    d.send(ROOT_SLOT, "feature bind off");
    d.send(ROOT_SLOT, "launch rockets");
    d.tick(1);
    assert_eq!(d.globals.fps(), 60);
    assert_eq!(d.globals.layout(), Layout::De);
    assert!(!d.globals.features_mask().contains(Features::BIND));

    d.send(slot, "bind on");
    d.tick(1);
    assert!(!d.table.slot(slot).lock().features.contains(Features::BIND));
}

#[test]
fn test_effect_driven_over_fifo() {
    let (_temp, mut d) = daemon();
    let slot = d.plug(keyboard("/dev/hidraw0", "A", 0x0120)).unwrap();
    d.settle(slot);

    d.send(slot, "rgb all:000000");
    d.send(slot, "effect Pinwheel");
    d.send(slot, "preset rainbow");
    d.send(slot, "param length 25");
    d.send(slot, "start");
    let t0 = Instant::now();
    d.scheduler.tick_at(t0);
    {
        let rec = d.table.slot(slot).lock();
        let animation = rec.animation.as_ref().unwrap();
        assert!(animation.is_running());
        assert_eq!(animation.duration(), 2.0);
    }

    let before = d.usb.sent_to(slot).len();
    for step in 1..=6 {
        let now = t0 + Duration::from_millis(100 * step);
        d.scheduler.tick_at(now);
        d.scheduler.tick_at(now + Duration::from_millis(1));
    }
    let frames: Vec<Vec<Argb>> = d.usb.sent_to(slot)[before..]
        .iter()
        .filter_map(|sent| match &sent.command {
            UsbCommand::Colors(colors) => Some(colors.clone()),
            _ => None,
        })
        .collect();
    // the static black frame, then one animated frame per step
    assert_eq!(frames.len(), 7);
    let animated = &frames[1..];
    assert!(animated.iter().all(|f| f.iter().any(|c| *c != Argb::opaque(0, 0, 0))));
    assert!(animated.iter().all(|f| f.iter().any(|c| *c == Argb::opaque(0, 0, 0))));
    assert_ne!(animated[0], animated[animated.len() - 1]);

    d.send(slot, "stop");
    d.tick(3);
    let UsbCommand::Colors(last) = d.usb.sent_to(slot).pop().unwrap().command else {
        panic!("expected a color frame");
    };
    assert!(last.iter().all(|c| *c == Argb::opaque(0, 0, 0)));
}

#[test]
fn test_indicator_changes_reach_device() {
    let (_temp, mut d) = daemon();
    let slot = d.plug(keyboard("/dev/hidraw0", "A", 0x0100)).unwrap();
    let first = d.usb.sent_to(slot);
    assert!(first.is_empty());
    d.settle(slot);
    assert_eq!(d.usb.sent_to(slot)[0].command, UsbCommand::Indicators(0));

    d.indicators.leds.store(0x03, Ordering::SeqCst);
    d.tick(2);
    assert_eq!(d.usb.sent_to(slot).last().unwrap().command, UsbCommand::Indicators(0x03));
    let count = d.usb.sent_to(slot).len();
    d.tick(3);
    assert_eq!(d.usb.sent_to(slot).len(), count);
}

#[test]
fn test_typed_keys_follow_bind_setting() {
    let (_temp, mut d) = daemon();
    let slot = d.plug(keyboard("/dev/hidraw0", "A", 0x0100)).unwrap();
    let keys = |d: &TestDaemon| -> Vec<String> { d.events().into_iter().filter(|e| e.starts_with("key ")).collect() };

    d.usb.type_keys(slot, &[KeyEvent::down(42), KeyEvent::down(30), KeyEvent::up(30), KeyEvent::up(42)]);
    d.tick(1);
    assert_eq!(
        keys(&d),
        vec![
            format!("key {} 42 down", slot),
            format!("key {} 30 down", slot),
            format!("key {} 30 up", slot),
            format!("key {} 42 up", slot),
        ]
    );

    d.send(slot, "bind off");
    d.tick(1);
    d.usb.type_keys(slot, &[KeyEvent::down(31), KeyEvent::up(31)]);
    d.tick(1);
    assert_eq!(keys(&d).len(), 4);
}

#[test]
fn test_shutdown_reverts_devices_and_removes_nodes() {
    let (_temp, d) = daemon();
    let a = d.plug(keyboard("/dev/hidraw0", "A", 0x0100)).unwrap();
    let b = d.plug(keyboard("/dev/hidraw1", "B", 0x0100)).unwrap();

    let coordinator = ShutdownCoordinator::new(d.running.clone());
    assert!(coordinator.begin(SHUTDOWN_SIGNALS[0]));
    assert!(!d.running.load(Ordering::Acquire));
    assert!(coordinator.is_shutting_down());
    assert!(!coordinator.begin(SHUTDOWN_SIGNALS[1]));

    quiesce(&d.table, &d.collab, Duration::from_secs(1));
    let events = d.events();
    for slot in [a, b] {
        let stop = events.iter().position(|e| *e == format!("stop {}", slot)).unwrap();
        let revert = events.iter().position(|e| *e == format!("revert {}", slot)).unwrap();
        let close = events.iter().position(|e| *e == format!("close {}", slot)).unwrap();
        assert!(stop < revert && revert < close);
        assert!(!d.node_dir(slot).exists());
    }
    assert_eq!(events.last().map(String::as_str), Some("deinit"));
    assert!(!d.node_dir(ROOT_SLOT).exists());
}

#[test]
fn test_shutdown_finishes_while_scheduler_is_wedged() {
    let (_temp, d) = daemon();
    let slot = d.plug(keyboard("/dev/hidraw0", "A", 0x0100)).unwrap();

    let table = d.table.clone();
    let wedged = Arc::new(AtomicBool::new(true));
    let hold = wedged.clone();
    let (tx, rx) = std::sync::mpsc::channel();
    let holder = thread::spawn(move || {
        let _table = table.lock();
        let _rec = table.slot(slot).lock();
        tx.send(()).unwrap();
        while hold.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }
    });
    rx.recv().unwrap();

    let started = Instant::now();
    quiesce(&d.table, &d.collab, Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(2));
    // the locked device still goes back to hardware mode
    let events = d.events();
    let stop = events.iter().position(|e| *e == format!("stop {}", slot)).unwrap();
    let revert = events.iter().position(|e| *e == format!("revert {}", slot)).unwrap();
    let close = events.iter().position(|e| *e == format!("close {}", slot)).unwrap();
    assert!(stop < revert && revert < close);
    assert!(!d.node_dir(slot).exists());
    assert_eq!(events.last().map(String::as_str), Some("deinit"));

    wedged.store(false, Ordering::Release);
    holder.join().unwrap();
}
