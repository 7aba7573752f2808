//! The tick loop.
//!
//! Every tick visits each connected slot in order under the table lock:
//! 1. send at most one queued packet (not for root); an unrecoverable
//!    transfer fault closes the record. Key presses read from the device
//!    go to its virtual keyboard while BIND is on.
//! 2. if the queue is now empty, read every FIFO in the table and render a
//!    due animation frame
//! 3. sync the indicator LEDs (not for root)
//!
//! Commands queued during tick N are stamped N and are only sent from
//! tick N + 1 on.

use rgbkbd_common::tracing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::command::Dispatcher;
use crate::config::Globals;
use crate::device::{DeviceRecord, DeviceTable, Features, UsbCommand, FW_V120};
use crate::pacing;
use crate::usb::Dequeue;
use crate::Collaborators;

pub struct Scheduler {
    table: Arc<DeviceTable>,
    globals: Arc<Globals>,
    collab: Collaborators,
    dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
    tick: u64,
}

impl Scheduler {
    pub fn new(
        table: Arc<DeviceTable>,
        globals: Arc<Globals>,
        collab: Collaborators,
        dispatcher: Dispatcher,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self { table, globals, collab, dispatcher, running, tick: 0 }
    }

    /// Ticks completed so far
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Run ticks until shutdown begins
    pub fn run(&mut self) {
        info!("Scheduler running at {} fps", self.globals.fps());
        while self.running.load(Ordering::Acquire) {
            let start = pacing::monotonic_now();
            let v120 = self.tick();
            let deadline = pacing::next_deadline(start, pacing::monotonic_now(), self.globals.fps(), v120);
            pacing::sleep_until(deadline);
        }
        info!("Scheduler stopped after {} ticks", self.tick);
    }

    pub fn tick(&mut self) -> bool {
        self.tick_at(Instant::now())
    }

    /// One pass over the table. Returns whether any connected device runs
    /// firmware that takes the faster pacing.
    pub fn tick_at(&mut self, now: Instant) -> bool {
        self.tick += 1;
        let tick = self.tick;
        let fps = self.globals.fps();
        let mut v120 = false;

        let _table = self.table.lock();
        for slot in 0..self.table.len() {
            let mut rec = self.table.slot(slot).lock();
            if !rec.is_connected() {
                continue;
            }
            rec.set_tick(tick);

            if !rec.is_root() {
                if self.collab.usb.dequeue(&mut rec, tick) == Dequeue::Error {
                    if let Err(e) = self.collab.usb.try_reset(&mut rec) {
                        error!("{} stopped responding ({}), disconnecting", *rec, e);
                        self.collab.close(&mut rec);
                        continue;
                    }
                }
                v120 |= rec.fw_version >= FW_V120;
                self.forward_keys(&mut rec);
            }

            if rec.is_idle() {
                self.read_fifos(slot, &mut rec, tick, now);
                render(&mut rec, fps, now);
            }

            if !rec.is_root() {
                self.collab.indicators.sync(&mut rec, false);
            }
        }
        v120
    }

    /// Pass key transitions on to the virtual keyboard. Reports are drained
    /// either way so a later `bind on` does not replay stale presses.
    fn forward_keys(&self, rec: &mut DeviceRecord) {
        let events = self.collab.usb.poll_keys(rec);
        if !rec.features.contains(Features::BIND) {
            return;
        }
        for event in events {
            if let Err(e) = self.collab.input.key(rec, event.code, event.pressed) {
                debug!("Dropped key {} from {}: {}", event.code, rec, e);
            }
        }
    }

    /// Apply pending commands from every FIFO in the table. `current` is the
    /// record already locked by the caller.
    fn read_fifos(&self, current_slot: usize, current: &mut DeviceRecord, tick: u64, now: Instant) {
        for slot in 0..self.table.len() {
            if slot == current_slot {
                self.dispatcher.poll_fifo(current, &self.globals, now);
                continue;
            }
            let mut other = self.table.slot(slot).lock();
            if other.fifo.is_none() {
                continue;
            }
            other.set_tick(tick);
            self.dispatcher.poll_fifo(&mut other, &self.globals, now);
        }
    }
}

/// Queue the next animation frame if one is owed
fn render(rec: &mut DeviceRecord, fps: u32, now: Instant) {
    if rec.is_root() || !rec.lighting.enabled {
        return;
    }
    let Some(animation) = rec.animation.as_mut() else {
        return;
    };
    if !animation.due(now, fps) {
        return;
    }
    let keys = animation.render(now);
    let colors = rec.lighting.frame(keys);
    rec.enqueue(UsbCommand::Colors(colors));
}
