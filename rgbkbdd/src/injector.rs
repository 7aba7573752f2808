use parking_lot::Mutex;
use rgbkbd_common::tracing;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{DeviceRecord, UsbCommand};

// Linux input event constants
const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_LED: u16 = 0x11;
const SYN_REPORT: u16 = 0x00;

// LED codes
const LED_NUML: u16 = 0x00;
const LED_CAPSL: u16 = 0x01;
const LED_SCROLLL: u16 = 0x02;

// uinput ioctl constants
const UI_SET_EVBIT: libc::c_ulong = 0x40045564; // _IOW('U', 100, int)
const UI_SET_KEYBIT: libc::c_ulong = 0x40045565; // _IOW('U', 101, int)
const UI_SET_LEDBIT: libc::c_ulong = 0x40045569; // _IOW('U', 105, int)
const UI_DEV_CREATE: libc::c_ulong = 0x5501; // _IO('U', 1)
const UI_DEV_DESTROY: libc::c_ulong = 0x5502; // _IO('U', 2)

/// Linux input_event structure
#[repr(C)]
#[derive(Clone, Copy)]
struct InputEvent {
    time: libc::timeval,
    type_: u16,
    code: u16,
    value: i32,
}

/// uinput_user_dev structure for device setup
#[repr(C)]
struct UinputUserDev {
    name: [u8; 80],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; 64],
    absmin: [i32; 64],
    absfuzz: [i32; 64],
    absflat: [i32; 64],
}

#[repr(C)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("uinput ioctl {0} failed: {1}")]
    Ioctl(&'static str, io::Error),

    #[error("slot {0} has no virtual keyboard")]
    NotOpen(usize),
}

/// Virtual input device fed by a physical keyboard
pub trait InputSink: Send + Sync {
    fn open(&self, rec: &DeviceRecord) -> Result<(), InputError>;
    fn key(&self, rec: &DeviceRecord, code: u16, pressed: bool) -> Result<(), InputError>;
    /// Release anything held and tear the virtual device down
    fn stop_emission(&self, rec: &DeviceRecord) {
        self.stop_emission_slot(rec.slot);
    }
    /// Same as `stop_emission`, addressed by slot alone
    fn stop_emission_slot(&self, slot: usize);
}

/// Source of Num/Caps/Scroll lock state
pub trait IndicatorSource: Send + Sync {
    /// Queue an indicator update when the state changed, or always if `force`
    fn sync(&self, rec: &mut DeviceRecord, force: bool);
}

/// Keys currently pressed on a virtual keyboard
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeldKeys(BTreeSet<u16>);

impl HeldKeys {
    /// Returns false if the key was already down
    pub fn press(&mut self, code: u16) -> bool {
        self.0.insert(code)
    }

    pub fn release(&mut self, code: u16) -> bool {
        self.0.remove(&code)
    }

    pub fn drain(&mut self) -> Vec<u16> {
        mem::take(&mut self.0).into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Fold one LED event into an indicator bitmask
pub fn apply_led(leds: u8, code: u16, value: i32) -> u8 {
    let bit = match code {
        LED_NUML => 0x01,
        LED_CAPSL => 0x02,
        LED_SCROLLL => 0x04,
        _ => return leds,
    };
    if value != 0 {
        leds | bit
    } else {
        leds & !bit
    }
}

struct VirtualKeyboard {
    file: File,
    held: HeldKeys,
    leds: u8,
}

impl VirtualKeyboard {
    fn create(rec: &DeviceRecord) -> Result<Self, InputError> {
        let file = OpenOptions::new().read(true).write(true).custom_flags(libc::O_NONBLOCK).open("/dev/uinput")?;
        let fd = file.as_raw_fd();

        let ioctl = |name: &'static str, request: libc::c_ulong, arg: libc::c_int| {
            // SAFETY: fd is an open uinput descriptor and every request takes an int
            if unsafe { libc::ioctl(fd, request as _, arg) } < 0 {
                Err(InputError::Ioctl(name, io::Error::last_os_error()))
            } else {
                Ok(())
            }
        };

        ioctl("UI_SET_EVBIT", UI_SET_EVBIT, EV_KEY as libc::c_int)?;
        ioctl("UI_SET_EVBIT", UI_SET_EVBIT, EV_SYN as libc::c_int)?;
        ioctl("UI_SET_EVBIT", UI_SET_EVBIT, EV_LED as libc::c_int)?;
        for key in 1..256 {
            if let Err(e) = ioctl("UI_SET_KEYBIT", UI_SET_KEYBIT, key) {
                warn!("{} for key {}", e, key);
            }
        }
        for led in [LED_NUML, LED_CAPSL, LED_SCROLLL] {
            ioctl("UI_SET_LEDBIT", UI_SET_LEDBIT, led as libc::c_int)?;
        }

        // SAFETY: all-zero is a valid uinput_user_dev
        let mut dev: UinputUserDev = unsafe { mem::zeroed() };
        let name = format!("rgbkbd: {}", rec.name);
        let len = name.len().min(dev.name.len() - 1);
        dev.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        dev.id.bustype = 0x03; // BUS_USB
        dev.id.vendor = rec.vendor;
        dev.id.product = rec.product;
        dev.id.version = rec.fw_version;

        // SAFETY: UinputUserDev is repr(C) plain data
        let bytes = unsafe {
            std::slice::from_raw_parts(&dev as *const UinputUserDev as *const u8, mem::size_of::<UinputUserDev>())
        };
        (&file).write_all(bytes)?;
        // SAFETY: as above; UI_DEV_CREATE takes no argument
        if unsafe { libc::ioctl(fd, UI_DEV_CREATE as _) } < 0 {
            return Err(InputError::Ioctl("UI_DEV_CREATE", io::Error::last_os_error()));
        }

        info!("Created virtual keyboard {}", name);
        Ok(Self { file, held: HeldKeys::default(), leds: 0 })
    }

    fn write_event(&self, type_: u16, code: u16, value: i32) -> io::Result<()> {
        // SAFETY: all-zero is a valid input_event
        let mut event: InputEvent = unsafe { mem::zeroed() };
        // SAFETY: event.time is a valid timeval to fill in
        unsafe {
            libc::gettimeofday(&mut event.time, std::ptr::null_mut());
        }
        event.type_ = type_;
        event.code = code;
        event.value = value;
        // SAFETY: InputEvent is repr(C) plain data
        let bytes = unsafe {
            std::slice::from_raw_parts(&event as *const InputEvent as *const u8, mem::size_of::<InputEvent>())
        };
        (&self.file).write_all(bytes)
    }

    fn emit_key(&self, code: u16, pressed: bool) -> io::Result<()> {
        self.write_event(EV_KEY, code, i32::from(pressed))?;
        self.write_event(EV_SYN, SYN_REPORT, 0)
    }

    /// Drain pending LED events written back by the input layer
    fn poll_leds(&mut self) -> u8 {
        let mut buf = [0u8; mem::size_of::<InputEvent>()];
        loop {
            match (&self.file).read(&mut buf) {
                Ok(n) if n == buf.len() => {
                    // SAFETY: buf holds exactly one input_event
                    let event: InputEvent = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const InputEvent) };
                    if event.type_ == EV_LED {
                        self.leds = apply_led(self.leds, event.code, event.value);
                    }
                }
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() != ErrorKind::WouldBlock {
                        debug!("LED read failed: {}", e);
                    }
                    break;
                }
            }
        }
        self.leds
    }

    fn destroy(mut self) {
        for code in self.held.drain() {
            if let Err(e) = self.emit_key(code, false) {
                warn!("Failed to release key {}: {}", code, e);
            }
        }
        // SAFETY: fd is still open; the device was created on it
        if unsafe { libc::ioctl(self.file.as_raw_fd(), UI_DEV_DESTROY as _) } < 0 {
            warn!("Failed to destroy virtual keyboard: {}", io::Error::last_os_error());
        }
    }
}

/// uinput-backed input sink and indicator source, one virtual keyboard per slot
#[derive(Default)]
pub struct UinputInjector {
    devices: Mutex<HashMap<usize, VirtualKeyboard>>,
}

impl UinputInjector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputSink for UinputInjector {
    fn open(&self, rec: &DeviceRecord) -> Result<(), InputError> {
        let keyboard = VirtualKeyboard::create(rec)?;
        if let Some(old) = self.devices.lock().insert(rec.slot, keyboard) {
            old.destroy();
        }
        Ok(())
    }

    fn key(&self, rec: &DeviceRecord, code: u16, pressed: bool) -> Result<(), InputError> {
        let mut devices = self.devices.lock();
        let keyboard = devices.get_mut(&rec.slot).ok_or(InputError::NotOpen(rec.slot))?;
        let changed = if pressed { keyboard.held.press(code) } else { keyboard.held.release(code) };
        if changed {
            keyboard.emit_key(code, pressed)?;
        }
        Ok(())
    }

    fn stop_emission_slot(&self, slot: usize) {
        if let Some(keyboard) = self.devices.lock().remove(&slot) {
            keyboard.destroy();
            debug!("Stopped input for slot {}", slot);
        }
    }
}

impl IndicatorSource for UinputInjector {
    fn sync(&self, rec: &mut DeviceRecord, force: bool) {
        if rec.is_root() {
            return;
        }
        let leds = match self.devices.lock().get_mut(&rec.slot) {
            Some(keyboard) => keyboard.poll_leds(),
            None => rec.indicators.unwrap_or(0),
        };
        queue_indicators(rec, leds, force);
    }
}

/// Queue `leds` unless the device already shows them
pub fn queue_indicators(rec: &mut DeviceRecord, leds: u8, force: bool) {
    if force || rec.indicators != Some(leds) {
        rec.enqueue(UsbCommand::Indicators(leds));
        rec.indicators = Some(leds);
    }
}
