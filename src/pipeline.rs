//! Module for the per-reading pipeline thread. Drains the validated
//! readings coming from the subscriber thread and runs each one through
//! alert evaluation, durable storage and republishing, in that order.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time;

use crate::alert::{AlertEngine, Direction, Thresholds};
use crate::database::{DatabaseParameters, MeasurementStore};
use crate::mqtt::{MqttParams, PublishError, Republisher, RepublishParams};
use crate::record::Reading;

/// Runs one reading through alert evaluation, storage and the supplied
/// republish action, in that order.
///
/// A failed insert drops the reading before the republish action is
/// ever invoked, so nothing unpersisted reaches the outbound channel. A
/// failed republish only logs; the row stays in place.
fn process_reading<F>(
    engine: &mut AlertEngine,
    store: &MeasurementStore,
    reading: &Reading,
    republish: F,
) where
    F: FnOnce(&Reading, &str) -> Result<(), PublishError>,
{
    for event in engine.evaluate(reading) {
        match event.direction {
            Direction::Low | Direction::High => {
                log::warn!(target: "envlogd::alert", "ALERT {}: {} = {:.1} (threshold {:.1})", event.direction, event.metric, event.value, event.threshold)
            }
            Direction::Normal => {
                log::info!(target: "envlogd::alert", "ALERT {}: {} = {:.1} back inside threshold {:.1}", event.direction, event.metric, event.value, event.threshold)
            }
        };
    }

    let canonical_timestamp = reading.canonical_timestamp();

    match store.insert(reading, &canonical_timestamp) {
        Ok(id) => {
            log::debug!(target: "envlogd::db", "Stored reading {} at \'{}\'!", id, canonical_timestamp);
        }
        Err(err) => {
            // Do not republish a reading that was never persisted.
            log::error!(target: "envlogd::db", "Database insert failed, dropping reading: \'{}\'", err);
            return;
        }
    };

    match republish(reading, &canonical_timestamp) {
        Ok(_) => {
            log::trace!(target: "envlogd::mqtt", "Republished reading at \'{}\'!", canonical_timestamp)
        }
        Err(err) => {
            log::warn!(target: "envlogd::mqtt", "Could not republish reading, it remains stored: \'{}\'", err)
        }
    };
}

/// Thread function for the processing pipeline.
///
/// Owns the alert engine, the measurement store and the republisher for
/// the process lifetime. Per reading: evaluate alerts, insert, then
/// republish the enriched copy. A failed insert drops the reading before
/// the republish step so nothing unpersisted is ever republished; a
/// failed republish leaves the row in place.
///
/// A store that cannot be opened or initialized is fatal: the thread
/// raises `thread_finish` and returns `true` so the caller exits
/// non-zero.
pub fn pipeline_thread(
    rx: Receiver<Reading>,
    thread_finish: Arc<AtomicBool>,
    database_parameters: DatabaseParameters,
    thresholds: Thresholds,
    mqtt_parameters: MqttParams,
    republish_parameters: RepublishParams,
) -> bool {
    let mut store = match MeasurementStore::open(&database_parameters) {
        Ok(store) => store,
        Err(err) => {
            log::error!(target: "envlogd::db", "Could not open measurement database \'{}\': \'{}\'", database_parameters.path, err);
            thread_finish.store(true, Ordering::SeqCst);
            return true;
        }
    };
    match store.initialize() {
        Ok(_) => {
            log::info!(target: "envlogd::db", "Measurement database ready at \'{}\'!", database_parameters.path)
        }
        Err(err) => {
            log::error!(target: "envlogd::db", "Could not initialize measurement database: \'{}\'", err);
            thread_finish.store(true, Ordering::SeqCst);
            return true;
        }
    };

    let mut engine = AlertEngine::new(thresholds);

    let mut republisher = match Republisher::new(&mqtt_parameters, &republish_parameters) {
        Ok(republisher) => Some(republisher),
        Err(err) => {
            // Storage keeps working without the outbound channel.
            log::error!(target: "envlogd::mqtt", "Could not create republish client: \'{}\'", err);
            None
        }
    };

    let timeout = time::Duration::from_millis(100);

    while !thread_finish.load(Ordering::SeqCst) {
        let reading = match rx.recv_timeout(timeout) {
            Ok(reading) => reading,
            Err(RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!(target: "envlogd::pipeline", "Subscriber channel closed, shutting down pipeline!");
                break;
            }
        };

        process_reading(&mut engine, &store, &reading, |reading, timestamp| {
            match republisher.as_mut() {
                Some(republisher) => republisher.republish(reading, timestamp),
                None => Err(PublishError::ChannelUnavailable(String::from(
                    "republish client was never created",
                ))),
            }
        });
    }

    if let Some(republisher) = republisher.as_mut() {
        republisher.disconnect();
    }
    match store.close() {
        Ok(_) => log::debug!(target: "envlogd::db", "Closed measurement database!"),
        Err(err) => {
            log::error!(target: "envlogd::db", "Could not close measurement database: \'{}\'", err)
        }
    };
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rusqlite::Connection;

    fn thresholds() -> Thresholds {
        Thresholds {
            temp_min: 10.0,
            temp_max: 30.0,
            press_min: 950.0,
            press_max: 1050.0,
            hum_min: 30,
            hum_max: 70,
        }
    }

    fn reading(temperature: f64) -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            device_id: None,
            temperature,
            pressure: 1000.0,
            humidity: 50.0,
            luminosity: None,
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> (MeasurementStore, String) {
        let path = dir
            .path()
            .join("mesures.db")
            .to_str()
            .unwrap()
            .to_string();
        let store = MeasurementStore::open(&DatabaseParameters { path: path.clone() }).unwrap();
        store.initialize().unwrap();
        (store, path)
    }

    #[test]
    fn failed_insert_never_reaches_the_republish_step() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, _) = open_store(&dir);
        // A closed store makes every insert fail.
        store.close().unwrap();

        let mut engine = AlertEngine::new(thresholds());
        let mut republished = 0;
        process_reading(&mut engine, &store, &reading(20.0), |_, _| {
            republished += 1;
            Ok(())
        });

        assert_eq!(republished, 0);
    }

    #[test]
    fn failed_republish_leaves_the_row_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, path) = open_store(&dir);

        let mut engine = AlertEngine::new(thresholds());
        process_reading(&mut engine, &store, &reading(20.0), |_, _| {
            Err(PublishError::ChannelUnavailable(String::from(
                "broker offline",
            )))
        });
        store.close().unwrap();

        let count: i64 = Connection::open(&path)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM mesures;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn republish_receives_the_stored_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, path) = open_store(&dir);

        let mut engine = AlertEngine::new(thresholds());
        let mut published_timestamp = None;
        process_reading(&mut engine, &store, &reading(20.0), |_, timestamp| {
            published_timestamp = Some(timestamp.to_string());
            Ok(())
        });
        store.close().unwrap();

        let stored_timestamp: String = Connection::open(&path)
            .unwrap()
            .query_row("SELECT timestamp FROM mesures WHERE id = 1;", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(stored_timestamp, "2024-03-01 12:00:00");
        assert_eq!(published_timestamp.as_deref(), Some("2024-03-01 12:00:00"));
    }
}
