//! Scripted collaborators and a wired-up daemon core for end-to-end tests.
//!
//! Everything except the USB wire and uinput is real: the device table,
//! the scheduler, the dispatcher and the control directories (created under
//! a caller-supplied prefix).

use parking_lot::Mutex;
use rgbkbdd::command::Dispatcher;
use rgbkbdd::config::Globals;
use rgbkbdd::device::{DeviceManager, DeviceRecord, DeviceTable, UsbCommand};
use rgbkbdd::devnode::FsDevNode;
use rgbkbdd::injector::{queue_indicators, IndicatorSource, InputError, InputSink};
use rgbkbdd::keymap::KeyEvent;
use rgbkbdd::scheduler::Scheduler;
use rgbkbdd::usb::{Dequeue, UsbBackend, UsbDeviceInfo, UsbError};
use rgbkbdd::{Collaborators, EffectRegistry};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Collaborator calls in the order they happened
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// A packet that made it onto the (pretend) wire
#[derive(Debug, Clone, PartialEq)]
pub struct Sent {
    pub slot: usize,
    pub tick: u64,
    pub command: UsbCommand,
}

/// USB backend whose devices and failures are scripted by the test
#[derive(Default)]
pub struct ScriptedUsb {
    events: EventLog,
    plugged: Mutex<Vec<UsbDeviceInfo>>,
    broken: Mutex<HashSet<PathBuf>>,
    unresettable: AtomicBool,
    sent: Mutex<Vec<Sent>>,
    keys: Mutex<HashMap<usize, Vec<KeyEvent>>>,
}

impl ScriptedUsb {
    pub fn plug(&self, info: UsbDeviceInfo) {
        self.plugged.lock().push(info);
    }

    /// Every transfer to the device at `devnode` fails from now on
    pub fn break_device(&self, devnode: &Path, resettable: bool) {
        self.broken.lock().insert(devnode.to_path_buf());
        self.unresettable.store(!resettable, Ordering::SeqCst);
    }

    /// Queue key transitions as if typed on the device in `slot`
    pub fn type_keys(&self, slot: usize, events: &[KeyEvent]) {
        self.keys.lock().entry(slot).or_default().extend_from_slice(events);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, slot: usize) -> Vec<Sent> {
        self.sent().into_iter().filter(|s| s.slot == slot).collect()
    }

    fn is_broken(&self, rec: &DeviceRecord) -> bool {
        rec.devnode.as_ref().is_some_and(|node| self.broken.lock().contains(node))
    }
}

impl UsbBackend for ScriptedUsb {
    fn subsystem_init(&self) -> Result<(), UsbError> {
        self.events.lock().push("init".to_string());
        Ok(())
    }

    fn subsystem_deinit(&self) {
        self.events.lock().push("deinit".to_string());
    }

    fn discover(&self) -> Vec<UsbDeviceInfo> {
        std::mem::take(&mut *self.plugged.lock())
    }

    fn open(&self, rec: &mut DeviceRecord) -> Result<(), UsbError> {
        self.events.lock().push(format!("open {}", rec.slot));
        Ok(())
    }

    fn dequeue(&self, rec: &mut DeviceRecord, tick: u64) -> Dequeue {
        let Some(queued) = rec.pop_ready(tick) else {
            return Dequeue::Empty;
        };
        if self.is_broken(rec) {
            rec.requeue(queued);
            return Dequeue::Error;
        }
        self.sent.lock().push(Sent { slot: rec.slot, tick, command: queued.command });
        Dequeue::Sent
    }

    fn try_reset(&self, rec: &mut DeviceRecord) -> Result<(), UsbError> {
        self.events.lock().push(format!("reset {}", rec.slot));
        if self.unresettable.load(Ordering::SeqCst) {
            return Err(UsbError::NotOpen(rec.slot));
        }
        if let Some(node) = &rec.devnode {
            self.broken.lock().remove(node);
        }
        Ok(())
    }

    fn poll_keys(&self, rec: &mut DeviceRecord) -> Vec<KeyEvent> {
        self.keys.lock().remove(&rec.slot).unwrap_or_default()
    }

    fn close_slot(&self, slot: usize) {
        self.events.lock().push(format!("close {}", slot));
    }

    fn revert_slot(&self, slot: usize) {
        self.events.lock().push(format!("revert {}", slot));
    }
}

/// Input sink that records key output and teardown
pub struct RecordingInput {
    events: EventLog,
}

impl InputSink for RecordingInput {
    fn open(&self, _rec: &DeviceRecord) -> Result<(), InputError> {
        Ok(())
    }

    fn key(&self, rec: &DeviceRecord, code: u16, pressed: bool) -> Result<(), InputError> {
        let state = if pressed { "down" } else { "up" };
        self.events.lock().push(format!("key {} {} {}", rec.slot, code, state));
        Ok(())
    }

    fn stop_emission_slot(&self, slot: usize) {
        self.events.lock().push(format!("stop {}", slot));
    }
}

/// Indicator state set directly by the test
#[derive(Default)]
pub struct FixedIndicators {
    pub leds: AtomicU8,
}

impl IndicatorSource for FixedIndicators {
    fn sync(&self, rec: &mut DeviceRecord, force: bool) {
        if !rec.is_root() {
            queue_indicators(rec, self.leds.load(Ordering::SeqCst), force);
        }
    }
}

/// The daemon core wired to scripted collaborators
pub struct TestDaemon {
    pub table: Arc<DeviceTable>,
    pub globals: Arc<Globals>,
    pub collab: Collaborators,
    pub usb: Arc<ScriptedUsb>,
    pub indicators: Arc<FixedIndicators>,
    pub nodes: Arc<FsDevNode>,
    pub manager: Arc<DeviceManager>,
    pub scheduler: Scheduler,
    pub running: Arc<AtomicBool>,
    pub events: EventLog,
}

impl TestDaemon {
    /// Control directories are created as `<prefix><slot>`
    pub fn new(prefix: &Path) -> Self {
        let events = EventLog::default();
        let usb = Arc::new(ScriptedUsb { events: events.clone(), ..ScriptedUsb::default() });
        let indicators = Arc::new(FixedIndicators::default());
        let nodes = Arc::new(FsDevNode::new(prefix, None));
        let collab = Collaborators {
            usb: usb.clone(),
            input: Arc::new(RecordingInput { events: events.clone() }),
            indicators: indicators.clone(),
            nodes: nodes.clone(),
        };
        let globals = Arc::new(Globals::default());
        let table = Arc::new(DeviceTable::new(globals.features_mask()));
        let manager = Arc::new(DeviceManager::new(table.clone(), collab.clone(), globals.clone()));
        manager.init_root();
        let running = Arc::new(AtomicBool::new(true));
        let scheduler = Scheduler::new(
            table.clone(),
            globals.clone(),
            collab.clone(),
            Dispatcher::new(EffectRegistry::builtin()),
            running.clone(),
        );
        Self { table, globals, collab, usb, indicators, nodes, manager, scheduler, running, events }
    }

    /// Plug a device in and run discovery; returns its slot
    pub fn plug(&self, info: UsbDeviceInfo) -> Option<usize> {
        let devnode = info.devnode.clone();
        self.usb.plug(info);
        self.manager.scan();
        (1..self.table.len()).find(|slot| {
            let rec = self.table.slot(*slot).lock();
            rec.is_connected() && rec.devnode.as_ref() == Some(&devnode)
        })
    }

    pub fn node_dir(&self, slot: usize) -> PathBuf {
        self.nodes.dir(slot)
    }

    /// Write one command line into a record's FIFO
    pub fn send(&self, slot: usize, line: &str) {
        let mut fifo = self.writer(slot);
        writeln!(fifo, "{}", line).unwrap();
    }

    pub fn writer(&self, slot: usize) -> File {
        OpenOptions::new().write(true).open(self.node_dir(slot).join("cmd")).unwrap()
    }

    pub fn tick(&mut self, count: usize) {
        for _ in 0..count {
            self.scheduler.tick();
        }
    }

    /// Tick until the slot's queue is empty
    pub fn settle(&mut self, slot: usize) {
        for _ in 0..64 {
            if self.table.slot(slot).lock().is_idle() {
                return;
            }
            self.scheduler.tick();
        }
        panic!("slot {} never went idle", slot);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

/// A keyboard as enumeration would report it
pub fn keyboard(devnode: &str, serial: &str, fw_version: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        devnode: PathBuf::from(devnode),
        vendor: 0x1b1c,
        product: 0x1b11,
        serial: serial.to_string(),
        name: "Corsair K95 RGB".to_string(),
        fw_version,
    }
}
