use rustop::opts;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod dali_commands;
mod dali_emulator;
mod dali_manager;
mod dali_server;
mod device_names;
mod devices;
mod group;
mod hasseb;
mod lamp;
mod mqtt;
mod normalize;
mod outbox;
mod scanner;
mod tridonic;

use crate::config::{Config, DaliDriverKind};
use crate::dali_emulator::DaliEmulator;
use crate::dali_manager::{DaliDriver, DaliManager};
use crate::dali_server::DaliServer;
use crate::device_names::DeviceNames;
use crate::hasseb::Hasseb;
use crate::mqtt::{Backoff, MqttBridge, SessionEnd};
use crate::tridonic::Tridonic;

#[tokio::main]
async fn main() {
    let (args, _) = opts! {
        synopsis "DALI to MQTT bridge";
        opt config:String = String::from("config.yaml"), desc: "Configuration filename (config.yaml)";
        opt mqtt:Option<String>, desc: "Override the MQTT broker from the configuration";
    }
    .parse_or_exit();

    println!("Loading configuration from {config_filename}", config_filename = args.config);

    let mut config = Config::load(Path::new(&args.config)).expect("Error loading configuration");
    if let Some(mqtt_server) = args.mqtt {
        config.mqtt_server = mqtt_server;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.env_filter_directive())),
        )
        .with_ansi(config.log_color)
        .init();

    info!("Started: {}", get_version());

    let mut device_names = DeviceNames::load(Path::new(&config.devices_names_file))
        .expect("Error loading device names file - fix or remove it");

    let mut driver: Box<dyn DaliDriver> = match config.dali_driver {
        DaliDriverKind::Hasseb => Hasseb::try_new(Path::new(&config.dali_device)),
        DaliDriverKind::Tridonic => Tridonic::try_new(Path::new(&config.dali_device)),
        DaliDriverKind::DaliServer => DaliServer::try_new(&config.dali_server_address),
        DaliDriverKind::Dummy => DaliEmulator::try_new(config.dali_lamps as usize),
    }
    .expect("Error when initializing DALI driver - is the interface connected?");

    let mut dali_manager = DaliManager::new(driver.as_mut());
    let mut backoff = Backoff::new(
        Duration::from_secs(config.min_backoff_time),
        config.max_retries,
    );

    loop {
        let mut bridge = MqttBridge::new(&config, &mut dali_manager, &mut device_names);

        match bridge.run().await {
            Ok(SessionEnd::Rescan) => {
                backoff.reset();
                info!("Rebuilding from a fresh bus scan");
            }
            Err(e) => {
                if bridge.connected() {
                    backoff.reset();
                }
                error!("MQTT session failed: {:?}", e);

                match backoff.next_delay() {
                    Some(delay) => {
                        info!(
                            "Reconnecting in {:?} (attempt {} of {})",
                            delay,
                            backoff.retries(),
                            config.max_retries
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!("Maximum retries ({}) reached - giving up", config.max_retries);
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}

pub fn get_version() -> String {
    format!(
        "dali2mqtt: {} (built at {})",
        built_info::PKG_VERSION,
        built_info::BUILT_TIME_UTC
    )
}
// Include the generated-file as a separate module
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
