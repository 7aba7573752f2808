//! Keyboard input reports to Linux key codes.
//!
//! Devices report key state as 8-byte boot-protocol reports: a modifier
//! bitmap, a reserved byte and up to six HID usages. [`BootDecoder`] keeps
//! the last report and turns each new one into press/release transitions.

/// Length of a boot-protocol keyboard report
pub const BOOT_REPORT_LEN: usize = 8;

/// Usage a device sends in every key slot when too many keys are down
const ROLLOVER: u8 = 0x01;

/// LEFTCTRL LEFTSHIFT LEFTALT LEFTMETA RIGHTCTRL RIGHTSHIFT RIGHTALT RIGHTMETA
const MODIFIERS: [u16; 8] = [29, 42, 56, 125, 97, 54, 100, 126];

/// Linux key codes for usages 0x04..=0x65
const USAGES: [u16; 0x62] = [
    // a..z
    30, 48, 46, 32, 18, 33, 34, 35, 23, 36, 37, 38, 50, 49, 24, 25, 16, 19, 31, 20, 22, 47, 17, 45, 21, 44,
    // 1..0
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11,
    // enter esc backspace tab space - = [ ] \ # ; ' ` , . / capslock
    28, 1, 14, 15, 57, 12, 13, 26, 27, 43, 43, 39, 40, 41, 51, 52, 53, 58,
    // F1..F12
    59, 60, 61, 62, 63, 64, 65, 66, 67, 68, 87, 88,
    // sysrq scrolllock pause insert home pageup delete end pagedown right left down up
    99, 70, 119, 110, 102, 104, 111, 107, 109, 106, 105, 108, 103,
    // numlock kpslash kpasterisk kpminus kpplus kpenter
    69, 98, 55, 74, 78, 96,
    // kp1..kp9 kp0 kpdot
    79, 80, 81, 75, 76, 77, 71, 72, 73, 82, 83,
    // 102nd compose
    86, 127,
];

/// Linux key code for a HID keyboard usage
pub fn usage_to_code(usage: u8) -> Option<u16> {
    let index = usage.checked_sub(0x04)?;
    USAGES.get(usize::from(index)).copied()
}

/// One key transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub code: u16,
    pub pressed: bool,
}

impl KeyEvent {
    pub fn down(code: u16) -> Self {
        Self { code, pressed: true }
    }

    pub fn up(code: u16) -> Self {
        Self { code, pressed: false }
    }
}

/// Tracks the last boot report of one device
#[derive(Debug, Default, Clone)]
pub struct BootDecoder {
    last: [u8; BOOT_REPORT_LEN],
}

impl BootDecoder {
    /// Transitions implied by `report`, releases first. Short reports and
    /// rollover reports change nothing.
    pub fn feed(&mut self, report: &[u8]) -> Vec<KeyEvent> {
        let Some(next) = report.get(..BOOT_REPORT_LEN) else {
            return Vec::new();
        };
        if next[2..].contains(&ROLLOVER) {
            return Vec::new();
        }

        let prev = self.last;
        let mut released = Vec::new();
        let mut pressed = Vec::new();
        for (bit, code) in MODIFIERS.iter().enumerate() {
            let was = prev[0] & (1 << bit) != 0;
            let is = next[0] & (1 << bit) != 0;
            if was && !is {
                released.push(KeyEvent::up(*code));
            } else if is && !was {
                pressed.push(KeyEvent::down(*code));
            }
        }
        for usage in &prev[2..] {
            if *usage != 0 && !next[2..].contains(usage) {
                released.extend(usage_to_code(*usage).map(KeyEvent::up));
            }
        }
        for usage in &next[2..] {
            if *usage != 0 && !prev[2..].contains(usage) {
                pressed.extend(usage_to_code(*usage).map(KeyEvent::down));
            }
        }

        self.last.copy_from_slice(next);
        released.extend(pressed);
        released
    }

    /// Forget held state, e.g. after the device was reopened
    pub fn clear(&mut self) {
        self.last = [0; BOOT_REPORT_LEN];
    }
}
