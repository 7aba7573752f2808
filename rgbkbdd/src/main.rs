//! rgbkbd Daemon - Main Entry Point
//!
//! This is the privileged system daemon responsible for:
//! - Discovering keyboards and exposing a control directory for each
//! - Running the tick loop that feeds them packets
//! - Returning devices to hardware mode on SIGTERM, SIGINT or SIGQUIT

use clap::Parser;
use rgbkbd_common::tracing;
use rgbkbdd::command::Dispatcher;
use rgbkbdd::config::{Cli, ConfigManager, ConfigSource, Globals};
use rgbkbdd::device::{DeviceManager, DeviceTable};
use rgbkbdd::devnode::FsDevNode;
use rgbkbdd::injector::UinputInjector;
use rgbkbdd::scheduler::Scheduler;
use rgbkbdd::shutdown::{self, ShutdownCoordinator};
use rgbkbdd::usb::HidrawUsb;
use rgbkbdd::{security, Collaborators, DaemonError, EffectRegistry};
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    let mut config_manager = ConfigManager::new(&cli.config);
    let loaded = config_manager.load_config();
    config_manager.apply_cli(&cli);

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config_manager.config().daemon.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    info!("Starting rgbkbd daemon v{}", env!("CARGO_PKG_VERSION"));
    match loaded {
        Ok(source @ ConfigSource::File(_)) => info!("Configuration {}", source),
        Ok(source @ ConfigSource::Defaults(_)) => warn!("Configuration {}", source),
        Err(e) => warn!("{}; using defaults", e),
    }

    match run(&cli, &config_manager) {
        Ok(()) => {}
        Err(e @ (DaemonError::AlreadyRunning { .. } | DaemonError::NotRoot)) => {
            error!("{}", e);
            process::exit(0);
        }
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

fn run(cli: &Cli, config_manager: &ConfigManager) -> Result<(), DaemonError> {
    let config = config_manager.config();
    let nodes = Arc::new(FsDevNode::new(&config.daemon.devpath, config.devices.gid));

    security::check_singleton(&nodes.pid_path())?;
    if !security::is_root() {
        if !cli.nonroot {
            return Err(DaemonError::NotRoot);
        }
        warn!("Running without root privileges; device access will probably fail");
    }

    let layout = config_manager.layout();
    info!("Default layout: {}", layout);
    let globals = Arc::new(Globals::new(config_manager.fps(), config_manager.features_mask(), layout));
    let table = Arc::new(DeviceTable::new(globals.features_mask()));

    let injector = Arc::new(UinputInjector::new());
    let collab = Collaborators {
        usb: Arc::new(HidrawUsb::new(config.devices.vendors.clone())),
        input: injector.clone(),
        indicators: injector,
        nodes,
    };
    let manager = Arc::new(DeviceManager::new(table.clone(), collab.clone(), globals.clone()));
    manager.init_root();

    // Threads spawned from here on inherit the blocked mask
    shutdown::block_signals()?;
    let running = Arc::new(AtomicBool::new(true));
    let coordinator = Arc::new(ShutdownCoordinator::new(running.clone()));
    shutdown::spawn_signal_thread(coordinator, table.clone(), collab.clone())?;

    if let Err(e) = collab.usb.subsystem_init() {
        shutdown::quiesce(&table, &collab, shutdown::LOCK_TIMEOUT);
        return Err(e.into());
    }

    info!("Found {} device(s)", manager.scan());
    let interval = Duration::from_millis(config.devices.hotplug_interval_ms);
    manager.spawn_hotplug(interval, running.clone())?;

    let dispatcher = Dispatcher::new(EffectRegistry::builtin());
    let mut scheduler = Scheduler::new(table, globals, collab, dispatcher, running);
    scheduler.run();

    // The shutdown worker exits the process once devices are released
    loop {
        thread::park();
    }
}
