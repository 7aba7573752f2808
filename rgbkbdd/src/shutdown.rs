//! Signal handling and bounded-time shutdown.
//!
//! All signals are blocked in every thread; a dedicated thread waits for
//! SIGTERM, SIGINT or SIGQUIT. The first one stops the scheduler and runs
//! [`quiesce`] on a worker thread, later ones are logged and ignored. Locks
//! are taken with a timeout so a wedged thread cannot hold the daemon up.

use nix::sys::signal::{SigSet, Signal};
use rgbkbd_common::tracing;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::device::{DeviceTable, ROOT_SLOT};
use crate::Collaborators;

/// How long shutdown waits for each lock
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Signals that begin a shutdown
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT];

pub struct ShutdownCoordinator {
    started: AtomicBool,
    running: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    /// `running` is the flag the scheduler and hotplug loops watch
    pub fn new(running: Arc<AtomicBool>) -> Self {
        Self { started: AtomicBool::new(false), running }
    }

    /// Record a shutdown signal. Only the first call returns true.
    pub fn begin(&self, signal: Signal) -> bool {
        if self.started.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            info!("Ignoring signal {} (already shutting down)", signal);
            return false;
        }
        info!("Caught signal {}, shutting down", signal);
        self.running.store(false, Ordering::Release);
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// Return every connected device to hardware mode and remove the control
/// directories. A record still locked after `timeout` is released through
/// its slot number without touching the record.
pub fn quiesce(table: &DeviceTable, collab: &Collaborators, timeout: Duration) {
    table.close();
    let guard = table.try_lock_for(timeout);
    if guard.is_none() {
        warn!("Device table still locked after {:?}, continuing without it", timeout);
    }

    for slot in (ROOT_SLOT + 1)..table.len() {
        let Some(mut rec) = table.slot(slot).try_lock_for(timeout) else {
            warn!("Slot {} still locked after {:?}, releasing it by slot", slot, timeout);
            collab.input.stop_emission_slot(slot);
            collab.usb.revert_slot(slot);
            collab.usb.close_slot(slot);
            collab.nodes.remove_slot(slot);
            continue;
        };
        if !rec.is_connected() {
            continue;
        }
        info!("Returning {} to hardware mode", *rec);
        collab.input.stop_emission(&rec);
        collab.usb.revert(&mut rec);
        collab.usb.close(&mut rec);
        collab.nodes.remove(&mut rec);
        rec.reset();
    }

    match table.slot(ROOT_SLOT).try_lock_for(timeout) {
        Some(mut root) => collab.nodes.remove(&mut root),
        None => {
            warn!("Root controller still locked after {:?}, removing its node anyway", timeout);
            collab.nodes.remove_slot(ROOT_SLOT);
        }
    }

    collab.usb.subsystem_deinit();
    drop(guard);
}

/// Block every signal in the calling thread; threads spawned afterwards inherit the mask
pub fn block_signals() -> nix::Result<()> {
    SigSet::all().thread_block()
}

/// Wait for shutdown signals on a dedicated thread. The first one runs
/// [`quiesce`] and exits the process.
pub fn spawn_signal_thread(
    coordinator: Arc<ShutdownCoordinator>,
    table: Arc<DeviceTable>,
    collab: Collaborators,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("signals".to_string()).spawn(move || {
        let mut set = SigSet::empty();
        for signal in SHUTDOWN_SIGNALS {
            set.add(signal);
        }
        loop {
            let signal = match set.wait() {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Waiting for signals failed: {}", e);
                    return;
                }
            };
            if !coordinator.begin(signal) {
                continue;
            }
            let table = table.clone();
            let collab = collab.clone();
            let worker = thread::Builder::new().name("shutdown".to_string()).spawn(move || {
                quiesce(&table, &collab, LOCK_TIMEOUT);
                info!("Shutdown complete");
                std::process::exit(0);
            });
            if let Err(e) = worker {
                error!("Failed to start shutdown worker: {}", e);
                std::process::exit(1);
            }
        }
    })
}
