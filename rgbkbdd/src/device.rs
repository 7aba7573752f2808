use parking_lot::{Mutex, MutexGuard};
use rgbkbd_common::{tracing, Argb, Key};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::animation::Animation;
use crate::config::Globals;
use crate::devnode::CommandFifo;
use crate::usb::UsbDeviceInfo;
use crate::Collaborators;

/// Number of slots in the device table, root included
pub const DEV_MAX: usize = 9;

/// Slot of the root/control record
pub const ROOT_SLOT: usize = 0;

/// Firmware from this version on accepts finer packet pacing
pub const FW_V120: u16 = 0x0120;

/// Device capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Features(u32);

impl Features {
    pub const NONE: Self = Self(0);
    pub const NOTIFY: Self = Self(1 << 0);
    pub const BIND: Self = Self(1 << 1);
    pub const RGB: Self = Self(1 << 2);
    pub const ALL: Self = Self(0b111);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersect(self, mask: Self) -> Self {
        Self(self.0 & mask.0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn set(&mut self, flag: Self, on: bool) {
        if on {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [(Self::RGB, "rgb"), (Self::BIND, "bind"), (Self::NOTIFY, "notify")];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

/// Outbound command awaiting transmission
#[derive(Debug, Clone, PartialEq)]
pub enum UsbCommand {
    /// Hand lighting and input to the driver
    SoftwareMode,
    /// Return the device to its native input mode
    HardwareMode,
    /// One full frame of key colors, in geometry order
    Colors(Vec<Argb>),
    /// Num/Caps/Scroll lock LED bits
    Indicators(u8),
}

/// Queue entry stamped with the tick it was created in
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub tick: u64,
    pub command: UsbCommand,
}

/// Physical key layout handed to effects
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Geometry {
    pub width: f64,
    pub height: f64,
    pub positions: Vec<(f64, f64)>,
}

impl Geometry {
    /// Regular grid of `cols` x `rows` keys spaced `pitch` apart, positions at key centers
    pub fn grid(cols: u32, rows: u32, pitch: f64) -> Self {
        let positions = (0..rows)
            .flat_map(|row| (0..cols).map(move |col| (col, row)))
            .map(|(col, row)| ((f64::from(col) + 0.5) * pitch, (f64::from(row) + 0.5) * pitch))
            .collect();
        Self {
            width: f64::from(cols) * pitch,
            height: f64::from(rows) * pitch,
            positions,
        }
    }

    /// Full-size board approximation; per-model keymaps live outside the daemon core
    pub fn keyboard() -> Self {
        Self::grid(22, 6, 12.0)
    }

    pub fn key_count(&self) -> usize {
        self.positions.len()
    }
}

/// Static lighting state underneath any running animation
#[derive(Debug, Clone, PartialEq)]
pub struct Lighting {
    pub enabled: bool,
    pub base: Vec<Argb>,
}

impl Lighting {
    pub fn new(keys: usize) -> Self {
        Self {
            enabled: true,
            base: vec![Argb::opaque(255, 255, 255); keys],
        }
    }

    /// Colors to send: animation keys composited over the base colors,
    /// everything dark while lighting is off
    pub fn frame(&self, keys: Option<&[Key]>) -> Vec<Argb> {
        if !self.enabled {
            return vec![Argb::opaque(0, 0, 0); self.base.len()];
        }
        self.base
            .iter()
            .enumerate()
            .map(|(i, base)| match keys.and_then(|k| k.get(i)) {
                Some(key) => {
                    let a = f64::from(key.a) / 255.0;
                    let mix = |top: u8, bottom: u8| (f64::from(top) * a + f64::from(bottom) * (1.0 - a)).round() as u8;
                    Argb::opaque(mix(key.r, base.r), mix(key.g, base.g), mix(key.b, base.b))
                }
                None => *base,
            })
            .collect()
    }
}

/// State of one device table slot
pub struct DeviceRecord {
    pub slot: usize,
    pub status: ConnectionStatus,
    /// -1 for the root record
    pub model: i32,
    pub features: Features,
    /// 0 until the device reports it
    pub fw_version: u16,
    pub vendor: u16,
    pub product: u16,
    pub serial: String,
    pub name: String,
    /// Transport node the USB backend opened
    pub devnode: Option<PathBuf>,
    /// Directory exposing this record to userspace
    pub node: Option<PathBuf>,
    pub fifo: Option<CommandFifo>,
    pub geometry: Geometry,
    pub lighting: Lighting,
    pub animation: Option<Animation>,
    /// Last indicator state queued to the device
    pub indicators: Option<u8>,
    queue: VecDeque<QueuedCommand>,
    tick: u64,
}

impl DeviceRecord {
    /// An empty, disconnected slot
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            status: ConnectionStatus::Disconnected,
            model: 0,
            features: Features::NONE,
            fw_version: 0,
            vendor: 0,
            product: 0,
            serial: String::new(),
            name: String::new(),
            devnode: None,
            node: None,
            fifo: None,
            geometry: Geometry::default(),
            lighting: Lighting::new(0),
            animation: None,
            indicators: None,
            queue: VecDeque::new(),
            tick: 0,
        }
    }

    /// The control record: always present, no physical model
    pub fn root(features_mask: Features) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            model: -1,
            features: Features::NOTIFY.intersect(features_mask),
            name: "root".to_string(),
            ..Self::new(ROOT_SLOT)
        }
    }

    pub fn is_root(&self) -> bool {
        self.slot == ROOT_SLOT
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Fill in identity and layout for a newly attached device
    pub fn assign(&mut self, info: &UsbDeviceInfo, features_mask: Features) {
        self.model = i32::from(info.product);
        self.vendor = info.vendor;
        self.product = info.product;
        self.serial = info.serial.clone();
        self.name = info.name.clone();
        self.fw_version = info.fw_version;
        self.devnode = Some(info.devnode.clone());
        self.features = Features::ALL.intersect(features_mask);
        self.geometry = Geometry::keyboard();
        self.lighting = Lighting::new(self.geometry.key_count());
    }

    /// Tick number stamped onto commands queued from now on
    pub fn set_tick(&mut self, tick: u64) {
        self.tick = tick;
    }

    pub fn enqueue(&mut self, command: UsbCommand) {
        self.queue.push_back(QueuedCommand { tick: self.tick, command });
    }

    /// Oldest command queued before `tick`
    pub fn pop_ready(&mut self, tick: u64) -> Option<QueuedCommand> {
        if self.queue.front().is_some_and(|c| c.tick < tick) {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Put a command back at the head of the queue after a failed send
    pub fn requeue(&mut self, command: QueuedCommand) {
        self.queue.push_front(command);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn queued(&self) -> impl Iterator<Item = &UsbCommand> {
        self.queue.iter().map(|c| &c.command)
    }

    /// Return the slot to its empty state. The slot number (and the mutex
    /// around the record) stay as they are.
    pub fn reset(&mut self) {
        *self = Self::new(self.slot);
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return write!(f, "root controller");
        }
        write!(f, "{} (VID: {:04X}, PID: {:04X}, slot {})", self.name, self.vendor, self.product, self.slot)
    }
}

/// Fixed set of device records plus the lock guarding passes over them
pub struct DeviceTable {
    table: Mutex<()>,
    records: Vec<Mutex<DeviceRecord>>,
    closed: AtomicBool,
}

impl DeviceTable {
    pub fn new(features_mask: Features) -> Self {
        let records = (0..DEV_MAX)
            .map(|slot| {
                if slot == ROOT_SLOT {
                    Mutex::new(DeviceRecord::root(features_mask))
                } else {
                    Mutex::new(DeviceRecord::new(slot))
                }
            })
            .collect();
        Self { table: Mutex::new(()), records, closed: AtomicBool::new(false) }
    }

    /// Refuse further attaches. Set once shutdown starts.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take the table lock for a structural pass
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.table.lock()
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        self.table.try_lock_for(timeout)
    }

    pub fn slot(&self, slot: usize) -> &Mutex<DeviceRecord> {
        &self.records[slot]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Collaborators {
    /// Tear down a record after close or an unrecoverable fault
    pub fn close(&self, rec: &mut DeviceRecord) {
        info!("Closing {}", rec);
        self.input.stop_emission(rec);
        self.usb.close(rec);
        self.nodes.remove(rec);
        rec.reset();
    }
}

/// Attaches discovered devices to free table slots
pub struct DeviceManager {
    table: Arc<DeviceTable>,
    collab: Collaborators,
    globals: Arc<Globals>,
}

impl DeviceManager {
    pub fn new(table: Arc<DeviceTable>, collab: Collaborators, globals: Arc<Globals>) -> Self {
        Self { table, collab, globals }
    }

    /// Expose the root controller node
    pub fn init_root(&self) {
        let _table = self.table.lock();
        let mut root = self.table.slot(ROOT_SLOT).lock();
        match self.collab.nodes.create(&mut root) {
            Ok(fifo) => {
                root.fifo = Some(fifo);
                if let Some(node) = &root.node {
                    info!("Root controller ready at {}", node.display());
                }
            }
            Err(e) => warn!("Failed to create root controller node: {}", e),
        }
    }

    /// Attach every newly discovered device; returns how many were attached
    pub fn scan(&self) -> usize {
        self.collab
            .usb
            .discover()
            .into_iter()
            .filter_map(|info| self.attach(&info))
            .count()
    }

    /// Open a device into the first free slot
    pub fn attach(&self, info: &UsbDeviceInfo) -> Option<usize> {
        let _table = self.table.lock();
        if self.table.is_closed() {
            debug!("Shutting down, not attaching {}", info.devnode.display());
            return None;
        }
        for slot in (ROOT_SLOT + 1)..self.table.len() {
            let mut rec = self.table.slot(slot).lock();
            if rec.is_connected() {
                continue;
            }
            return self.open_record(&mut rec, info).then_some(slot);
        }
        warn!("No free slot for {} at {}", info.name, info.devnode.display());
        None
    }

    fn open_record(&self, rec: &mut DeviceRecord, info: &UsbDeviceInfo) -> bool {
        rec.assign(info, self.globals.features_mask());
        if let Err(e) = self.collab.usb.open(rec) {
            warn!("Failed to open {}: {}", info.devnode.display(), e);
            rec.reset();
            return false;
        }
        rec.status = ConnectionStatus::Connected;

        if let Err(e) = self.collab.input.open(rec) {
            warn!("No virtual input for {}: {}", rec, e);
        }
        match self.collab.nodes.create(rec) {
            Ok(fifo) => rec.fifo = Some(fifo),
            Err(e) => warn!("Failed to create device node for {}: {}", rec, e),
        }
        self.collab.indicators.sync(rec, true);
        let base = rec.lighting.frame(None);
        rec.enqueue(UsbCommand::Colors(base));

        info!("Attached {} firmware {:04x} [{}]", rec, rec.fw_version, rec.features);
        true
    }

    /// Poll for new devices until `running` clears
    pub fn spawn_hotplug(self: Arc<Self>, interval: Duration, running: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new().name("hotplug".to_string()).spawn(move || {
            while running.load(Ordering::Acquire) {
                let attached = self.scan();
                if attached > 0 {
                    debug!("Hotplug attached {} device(s)", attached);
                }
                thread::sleep(interval);
            }
        })
    }
}
