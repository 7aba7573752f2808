//! USB transport.
//!
//! The scheduler only sees the [`UsbBackend`] trait:
//! - `discover` reports devices not seen before
//! - `dequeue` sends at most one ready command per call
//! - `try_reset` gives a faulted device one chance to recover
//! - `poll_keys` drains pending input reports as key transitions
//!
//! [`HidrawUsb`] is the hidraw implementation found through udev.

use parking_lot::Mutex;
use rgbkbd_common::{tracing, Argb};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{DeviceRecord, UsbCommand};
use crate::keymap::{BootDecoder, KeyEvent};

/// Size of every output report
pub const REPORT_LEN: usize = 64;

/// Corsair, the only vendor whose protocol the report encoder speaks
pub const DEFAULT_VENDORS: &[u16] = &[0x1b1c];

const COLOR_CHUNK: usize = REPORT_LEN - 4;

/// Input reports read per device per tick
const MAX_INPUT_REPORTS: usize = 32;

#[derive(Error, Debug)]
pub enum UsbError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("slot {0} has no open handle")]
    NotOpen(usize),

    #[error("record has no transport node")]
    NoDevnode,
}

/// Outcome of one `dequeue` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dequeue {
    /// One command went out
    Sent,
    /// Nothing was ready
    Empty,
    /// The transfer failed; the command is back at the head of the queue
    Error,
}

/// Identity of a device found during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub devnode: PathBuf,
    pub vendor: u16,
    pub product: u16,
    pub serial: String,
    pub name: String,
    pub fw_version: u16,
}

pub trait UsbBackend: Send + Sync {
    fn subsystem_init(&self) -> Result<(), UsbError>;
    fn subsystem_deinit(&self);
    /// Devices that appeared since the last call
    fn discover(&self) -> Vec<UsbDeviceInfo>;
    fn open(&self, rec: &mut DeviceRecord) -> Result<(), UsbError>;
    /// Send the oldest command queued before `tick`
    fn dequeue(&self, rec: &mut DeviceRecord, tick: u64) -> Dequeue;
    fn try_reset(&self, rec: &mut DeviceRecord) -> Result<(), UsbError>;
    /// Key transitions reported since the last poll
    fn poll_keys(&self, rec: &mut DeviceRecord) -> Vec<KeyEvent>;
    fn close(&self, rec: &mut DeviceRecord) {
        self.close_slot(rec.slot);
    }
    /// Hand the device back to its native mode
    fn revert(&self, rec: &mut DeviceRecord) {
        self.revert_slot(rec.slot);
    }
    /// Close the handle held for `slot`. Needs no access to the record, so
    /// shutdown can use it while the record is locked elsewhere.
    fn close_slot(&self, slot: usize);
    /// Revert whatever device is open in `slot`; a no-op for an empty slot
    fn revert_slot(&self, slot: usize);
}

/// Encode a command as output reports
pub fn encode(command: &UsbCommand) -> Vec<[u8; REPORT_LEN]> {
    match command {
        UsbCommand::SoftwareMode => vec![control(&[0x07, 0x04, 0x02])],
        UsbCommand::HardwareMode => vec![control(&[0x07, 0x04, 0x01])],
        UsbCommand::Indicators(leds) => vec![control(&[0x07, 0x05, 0x01, *leds])],
        UsbCommand::Colors(colors) => encode_colors(colors),
    }
}

fn control(bytes: &[u8]) -> [u8; REPORT_LEN] {
    let mut report = [0u8; REPORT_LEN];
    report[..bytes.len()].copy_from_slice(bytes);
    report
}

/// One plane per channel, split into data reports, each plane followed by a commit
fn encode_colors(colors: &[Argb]) -> Vec<[u8; REPORT_LEN]> {
    let planes: [fn(&Argb) -> u8; 3] = [|c| c.r, |c| c.g, |c| c.b];
    let mut reports = Vec::new();
    for (channel, plane) in planes.iter().enumerate() {
        let bytes: Vec<u8> = colors.iter().map(|c| plane(c)).collect();
        for (seq, chunk) in bytes.chunks(COLOR_CHUNK).enumerate() {
            let mut report = control(&[0x7f, seq as u8 + 1, chunk.len() as u8, 0x00]);
            report[4..4 + chunk.len()].copy_from_slice(chunk);
            reports.push(report);
        }
        reports.push(control(&[0x07, 0x28, channel as u8 + 1, 0x03, 0x01, 0x00]));
    }
    reports
}

/// hidraw transport over udev enumeration
pub struct HidrawUsb {
    vendors: Vec<u16>,
    handles: Mutex<HashMap<usize, File>>,
    decoders: Mutex<HashMap<usize, BootDecoder>>,
    /// Nodes already reported; pruned when a node disappears
    known: Mutex<HashSet<PathBuf>>,
}

impl HidrawUsb {
    pub fn new(vendors: Vec<u16>) -> Self {
        Self {
            vendors,
            handles: Mutex::new(HashMap::new()),
            decoders: Mutex::new(HashMap::new()),
            known: Mutex::new(HashSet::new()),
        }
    }

    fn enumerate(&self) -> io::Result<Vec<UsbDeviceInfo>> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem("hidraw")?;
        let mut candidates = Vec::new();
        for device in enumerator.scan_devices()? {
            let Some(devnode) = device.devnode().map(PathBuf::from) else {
                continue;
            };
            let Some(usb) = device.parent_with_subsystem_devtype("usb", "usb_device")? else {
                continue;
            };
            let attr = |name: &str| usb.attribute_value(name).map(|v| v.to_string_lossy().trim().to_string());
            let hex = |name: &str| attr(name).and_then(|v| u16::from_str_radix(&v, 16).ok());
            let (Some(vendor), Some(product)) = (hex("idVendor"), hex("idProduct")) else {
                continue;
            };
            if !self.vendors.contains(&vendor) {
                continue;
            }
            let info = UsbDeviceInfo {
                devnode,
                vendor,
                product,
                serial: attr("serial").unwrap_or_default(),
                name: attr("product").unwrap_or_else(|| format!("{:04x}:{:04x}", vendor, product)),
                fw_version: hex("bcdDevice").unwrap_or(0),
            };
            candidates.push((usb.syspath().to_path_buf(), info));
        }
        Ok(one_per_device(candidates))
    }

    fn open_node(rec: &DeviceRecord) -> Result<File, UsbError> {
        let path = rec.devnode.as_ref().ok_or(UsbError::NoDevnode)?;
        Ok(OpenOptions::new().read(true).write(true).custom_flags(libc::O_NONBLOCK).open(path)?)
    }

    fn send(&self, slot: usize, command: &UsbCommand) -> Result<(), UsbError> {
        let mut handles = self.handles.lock();
        let file = handles.get_mut(&slot).ok_or(UsbError::NotOpen(slot))?;
        for report in encode(command) {
            file.write_all(&report)?;
        }
        Ok(())
    }
}

impl UsbBackend for HidrawUsb {
    fn subsystem_init(&self) -> Result<(), UsbError> {
        udev::Enumerator::new()?;
        info!("USB subsystem ready, watching vendors {:04x?}", self.vendors);
        Ok(())
    }

    fn subsystem_deinit(&self) {
        self.handles.lock().clear();
        self.known.lock().clear();
        debug!("USB subsystem shut down");
    }

    fn discover(&self) -> Vec<UsbDeviceInfo> {
        let present = match self.enumerate() {
            Ok(present) => present,
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                return Vec::new();
            }
        };
        let mut known = self.known.lock();
        known.retain(|node| present.iter().any(|info| &info.devnode == node));
        present.into_iter().filter(|info| known.insert(info.devnode.clone())).collect()
    }

    fn open(&self, rec: &mut DeviceRecord) -> Result<(), UsbError> {
        let mut file = Self::open_node(rec)?;
        file.write_all(&control(&[0x07, 0x04, 0x02]))?;
        self.handles.lock().insert(rec.slot, file);
        Ok(())
    }

    fn dequeue(&self, rec: &mut DeviceRecord, tick: u64) -> Dequeue {
        let Some(queued) = rec.pop_ready(tick) else {
            return Dequeue::Empty;
        };
        match self.send(rec.slot, &queued.command) {
            Ok(()) => Dequeue::Sent,
            Err(e) => {
                warn!("Transfer to {} failed: {}", rec, e);
                rec.requeue(queued);
                Dequeue::Error
            }
        }
    }

    fn try_reset(&self, rec: &mut DeviceRecord) -> Result<(), UsbError> {
        self.handles.lock().remove(&rec.slot);
        self.decoders.lock().remove(&rec.slot);
        let file = Self::open_node(rec)?;
        self.handles.lock().insert(rec.slot, file);
        info!("Reset {}", rec);
        Ok(())
    }

    fn poll_keys(&self, rec: &mut DeviceRecord) -> Vec<KeyEvent> {
        let mut handles = self.handles.lock();
        let Some(file) = handles.get_mut(&rec.slot) else {
            return Vec::new();
        };
        let mut decoders = self.decoders.lock();
        let decoder = decoders.entry(rec.slot).or_default();
        let mut events = Vec::new();
        let mut buf = [0u8; REPORT_LEN];
        for _ in 0..MAX_INPUT_REPORTS {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => events.extend(decoder.feed(&buf[..n])),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Input read from {} failed: {}", rec, e);
                    break;
                }
            }
        }
        events
    }

    fn close_slot(&self, slot: usize) {
        self.handles.lock().remove(&slot);
        self.decoders.lock().remove(&slot);
    }

    fn revert_slot(&self, slot: usize) {
        match self.send(slot, &UsbCommand::HardwareMode) {
            Ok(()) => debug!("Slot {} back in hardware mode", slot),
            Err(UsbError::NotOpen(_)) => {}
            Err(e) => warn!("Failed to revert slot {} to hardware mode: {}", slot, e),
        }
    }
}

/// Keep one hidraw node per physical device: a keyboard exposes one node
/// per HID interface, all under the same `usb_device` parent. The lowest
/// numbered node wins.
fn one_per_device(mut candidates: Vec<(PathBuf, UsbDeviceInfo)>) -> Vec<UsbDeviceInfo> {
    candidates.sort_by(|(_, a), (_, b)| node_order(&a.devnode).cmp(&node_order(&b.devnode)));
    let mut parents = HashSet::new();
    candidates
        .into_iter()
        .filter(|(parent, _)| parents.insert(parent.clone()))
        .map(|(_, info)| info)
        .collect()
}

/// Sort key putting `hidraw2` before `hidraw10`
fn node_order(devnode: &Path) -> (usize, &Path) {
    (devnode.as_os_str().len(), devnode)
}
