extern crate chrono;
extern crate log;
extern crate log4rs;
extern crate ctrlc;
extern crate clap;


use std::sync::mpsc::{Sender, Receiver};
use std::sync::{mpsc, Arc};
use std::sync::atomic::Ordering;
use std::thread;

use serde::{Serialize, Deserialize};

use std::process::exit;

use clap::App;
use std::fs::File;
use std::io::Read;

mod record;
mod alert;
mod database;
mod mqtt;
mod pipeline;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Configuration {
    mqtt_connection_parameters: mqtt::MqttParams,
    republish_parameters: mqtt::RepublishParams,
    database_parameters: database::DatabaseParameters,
    thresholds: alert::Thresholds,
    #[serde(default)]
    require_device_id: bool
}

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from(cli_yaml).get_matches();
    let configuration_path = matches.value_of("config")
        .unwrap_or("resources/envlogd.yml");

    match log4rs::init_file("resources/log.yml", Default::default()) {
        Ok(_) => {},
        Err(err) => {
            eprintln!("Could not create logger from yaml configuration: {}", err);
            exit(-100);
        }
    };

    let mut configuration_file = match File::open(configuration_path) {
        Ok(file) => file,
        Err(err) => {
            log::error!(target: "envlogd", "Cannot open the configuration file \'{}\': \'{}\'", configuration_path, err);
            return;
        }
    };

    let mut configuration_string = String::new();
    match configuration_file.read_to_string(&mut configuration_string) {
        Ok(_) => {},
        Err(err) => {
            log::error!(target: "envlogd", "Cannot read the configuration from file: \'{}\'", err);
            return;
        }
    };

    let configuration = match serde_yaml::from_str::<Configuration>(configuration_string.as_str()) {
        Ok(res) => res,
        Err(err) => {
            log::error!(target: "envlogd", "Cannot deserialize the configuration: \'{}\'", err);
            return;
        }
    };

    let thresholds = &configuration.thresholds;
    log::info!(target: "envlogd",
               "Alert thresholds: temperature {:.1} to {:.1} °C, pressure {:.1} to {:.1} hPa, humidity {} to {} %",
               thresholds.temp_min, thresholds.temp_max,
               thresholds.press_min, thresholds.press_max,
               thresholds.hum_min, thresholds.hum_max);

    let (tx, rx): (Sender<record::Reading>, Receiver<record::Reading>) = mpsc::channel();

    let terminate_programm = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let terminate_main_thread = Arc::clone(&terminate_programm);
    let terminate_mqtt_thread = Arc::clone(&terminate_programm);
    let terminate_pipeline_thread = Arc::clone(&terminate_programm);

    let parse_options = record::ParseOptions {
        require_device_id: configuration.require_device_id
    };
    let mqtt_configuration = configuration.mqtt_connection_parameters.clone();
    let subscriber_thread = match thread::Builder::new()
        .name("mqtt".to_string())
        .spawn(move || {
            mqtt::subscriber_thread(tx, terminate_mqtt_thread, mqtt_configuration, parse_options)
        }) {
        Ok(subscriber_handle) => subscriber_handle,
        Err(err) => {
            log::error!(target: "envlogd", "Cannot start the mqtt subscriber thread: \'{}\'", err);
            exit(201);
        }
    };

    let database_configuration = configuration.database_parameters.clone();
    let threshold_configuration = configuration.thresholds.clone();
    let republish_mqtt_configuration = configuration.mqtt_connection_parameters.clone();
    let republish_configuration = configuration.republish_parameters.clone();
    let pipeline_thread = match thread::Builder::new()
        .name("pipeline".to_string())
        .spawn(move || {
            pipeline::pipeline_thread(rx,
                                      terminate_pipeline_thread,
                                      database_configuration,
                                      threshold_configuration,
                                      republish_mqtt_configuration,
                                      republish_configuration)
        }) {
        Ok(pipeline_handle) => pipeline_handle,
        Err(err) => {
            log::error!(target: "envlogd", "Cannot start the pipeline thread: \'{}\'", err);
            exit(202);
        }
    };

    ctrlc::set_handler(move || {
        log::info!(target: "envlogd", "Termination signal received!");
        terminate_main_thread.store(true, Ordering::SeqCst);
    }).expect("Error setting Ctrl-C handler");

    let broker_escalated = match subscriber_thread.join() {
        Ok(escalated) => {
            log::debug!(target: "envlogd", "Joined mqtt subscriber thread!");
            escalated
        },
        Err(_) => {
            log::error!(target: "envlogd", "Could not join the mqtt subscriber thread!");
            exit(301);
        }
    };
    let store_failed = match pipeline_thread.join() {
        Ok(failed) => {
            log::debug!(target: "envlogd", "Joined pipeline thread!");
            failed
        },
        Err(_) => {
            log::error!(target: "envlogd", "Could not join the pipeline thread!");
            exit(301);
        }
    };

    if broker_escalated {
        log::error!(target: "envlogd", "Exiting after repeated broker connection failures!");
        exit(401);
    }
    if store_failed {
        log::error!(target: "envlogd", "Exiting after a fatal measurement database failure!");
        exit(402);
    }

    log::info!(target: "envlogd", "Exiting");
    exit(0);
}
