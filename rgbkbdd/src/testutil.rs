//! Scripted collaborators for unit tests

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::Globals;
use crate::device::{ConnectionStatus, DeviceRecord, DeviceTable, Features, UsbCommand};
use crate::devnode::FsDevNode;
use crate::injector::{queue_indicators, IndicatorSource, InputError, InputSink};
use crate::keymap::KeyEvent;
use crate::usb::{Dequeue, UsbBackend, UsbDeviceInfo, UsbError};
use crate::Collaborators;

pub type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
pub struct MockUsb {
    log: Log,
    plugged: Mutex<Vec<UsbDeviceInfo>>,
    fail_open: AtomicBool,
    fail_reset: AtomicBool,
    failing: Mutex<HashSet<usize>>,
    sent: Mutex<Vec<(usize, u64, UsbCommand)>>,
    keys: Mutex<HashMap<usize, Vec<KeyEvent>>>,
}

impl MockUsb {
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    /// Make every transfer to `slot` fail until a reset succeeds
    pub fn fail_sends(&self, slot: usize) {
        self.failing.lock().insert(slot);
    }

    pub fn plug(&self, info: UsbDeviceInfo) {
        self.plugged.lock().push(info);
    }

    /// Key transitions the next `poll_keys` for `slot` returns
    pub fn press(&self, slot: usize, events: &[KeyEvent]) {
        self.keys.lock().entry(slot).or_default().extend_from_slice(events);
    }

    /// (slot, tick, command) for every successful transfer
    pub fn sent(&self) -> Vec<(usize, u64, UsbCommand)> {
        self.sent.lock().clone()
    }
}

impl UsbBackend for MockUsb {
    fn subsystem_init(&self) -> Result<(), UsbError> {
        Ok(())
    }

    fn subsystem_deinit(&self) {
        self.log.lock().push("deinit".to_string());
    }

    fn discover(&self) -> Vec<UsbDeviceInfo> {
        std::mem::take(&mut *self.plugged.lock())
    }

    fn open(&self, _rec: &mut DeviceRecord) -> Result<(), UsbError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(UsbError::NoDevnode);
        }
        Ok(())
    }

    fn dequeue(&self, rec: &mut DeviceRecord, tick: u64) -> Dequeue {
        let Some(queued) = rec.pop_ready(tick) else {
            return Dequeue::Empty;
        };
        if self.failing.lock().contains(&rec.slot) {
            rec.requeue(queued);
            return Dequeue::Error;
        }
        self.sent.lock().push((rec.slot, tick, queued.command));
        Dequeue::Sent
    }

    fn try_reset(&self, rec: &mut DeviceRecord) -> Result<(), UsbError> {
        self.log.lock().push(format!("reset {}", rec.slot));
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(UsbError::NotOpen(rec.slot));
        }
        self.failing.lock().remove(&rec.slot);
        Ok(())
    }

    fn poll_keys(&self, rec: &mut DeviceRecord) -> Vec<KeyEvent> {
        self.keys.lock().remove(&rec.slot).unwrap_or_default()
    }

    fn close_slot(&self, slot: usize) {
        self.log.lock().push(format!("close {}", slot));
    }

    fn revert_slot(&self, slot: usize) {
        self.log.lock().push(format!("revert {}", slot));
    }
}

pub struct MockInput {
    log: Log,
}

impl InputSink for MockInput {
    fn open(&self, _rec: &DeviceRecord) -> Result<(), InputError> {
        Ok(())
    }

    fn key(&self, rec: &DeviceRecord, code: u16, pressed: bool) -> Result<(), InputError> {
        let state = if pressed { "down" } else { "up" };
        self.log.lock().push(format!("key {} {} {}", rec.slot, code, state));
        Ok(())
    }

    fn stop_emission_slot(&self, slot: usize) {
        self.log.lock().push(format!("stop {}", slot));
    }
}

/// Reports a fixed LED state
#[derive(Default)]
pub struct MockIndicators {
    pub leds: AtomicU8,
}

impl IndicatorSource for MockIndicators {
    fn sync(&self, rec: &mut DeviceRecord, force: bool) {
        if !rec.is_root() {
            queue_indicators(rec, self.leds.load(Ordering::SeqCst), force);
        }
    }
}

pub struct Fixture {
    pub table: Arc<DeviceTable>,
    pub globals: Arc<Globals>,
    pub collab: Collaborators,
    pub usb: Arc<MockUsb>,
    pub indicators: Arc<MockIndicators>,
    pub nodes: Arc<FsDevNode>,
    pub log: Log,
    pub dir: TempDir,
}

impl Fixture {
    pub fn node_dir(&self, slot: usize) -> PathBuf {
        self.nodes.dir(slot)
    }

    /// Writer end of a record's command FIFO
    pub fn writer(&self, slot: usize) -> File {
        OpenOptions::new().write(true).open(self.node_dir(slot).join("cmd")).unwrap()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

pub fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let log = Log::default();
    let usb = Arc::new(MockUsb { log: log.clone(), ..MockUsb::default() });
    let indicators = Arc::new(MockIndicators::default());
    let nodes = Arc::new(FsDevNode::new(dir.path().join("kb"), None));
    let collab = Collaborators {
        usb: usb.clone(),
        input: Arc::new(MockInput { log: log.clone() }),
        indicators: indicators.clone(),
        nodes: nodes.clone(),
    };
    let globals = Arc::new(Globals::default());
    let table = Arc::new(DeviceTable::new(globals.features_mask()));
    Fixture { table, globals, collab, usb, indicators, nodes, log, dir }
}

pub fn device_info(devnode: &str, fw_version: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        devnode: PathBuf::from(devnode),
        vendor: 0x1b1c,
        product: 0x1b13,
        serial: "0123456789ABCDEF".to_string(),
        name: "Test Keyboard".to_string(),
        fw_version,
    }
}

/// Connected record with an empty queue and no node
pub fn connected_record(slot: usize) -> DeviceRecord {
    let mut rec = DeviceRecord::new(slot);
    rec.assign(&device_info("/dev/hidraw9", 0x0100), Features::ALL);
    rec.status = ConnectionStatus::Connected;
    rec
}
