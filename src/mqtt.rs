//! Module for the MQTT side of the daemon: the inbound subscription that
//! feeds the pipeline, the outbound republisher, and the two liveness
//! mechanisms that guard the subscription (sensor watchdog and broker
//! reconnect policy).
extern crate paho_mqtt as mqtt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use std::time;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record;
use crate::record::{ParseOptions, Reading};

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the mqtt connection.
pub struct MqttParams {
    /// The hostname or ip address of the mqtt broker.
    pub address: String,
    /// The port of the mqtt broker.
    pub port: u32,
    /// Enable tls encryption.
    pub tls_enable: bool,
    /// Optional TLS parameters for the mqtt connection.
    pub tls_params: Option<MqttTlsParams>,
    /// Topic to subscribe to for environmental data.
    pub env_topic: String,
    /// The QoS to use for the subscription.
    pub qos: i32,
    /// Keepalive interval for the broker session in seconds.
    pub keepalive_secs: u64,
    /// Raise a liveness alert when no sensor message arrived for this
    /// many seconds.
    pub watchdog_timeout_secs: u64,
    /// Wait between reconnect attempts after a lost broker connection.
    pub reconnect_interval_secs: u64,
    /// Consecutive failed reconnect attempts before the daemon gives up
    /// and exits so the service manager can restart it.
    pub max_reconnect_failures: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// TLS parameters required for MQTT with TLS.
pub struct MqttTlsParams {
    /// The path to the CA certificate for TLS encryption.
    pub ca_path: String,
    /// The path to the certificate to use for TLS encryption.
    pub cert_path: String,
    /// The path to the key to use for TLS encryption.
    pub key_path: String,
    /// The password for the ssl private key.
    pub key_pass: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the outbound republish channel.
pub struct RepublishParams {
    /// Topic the enriched readings are published on. Must differ from
    /// the subscription topic.
    pub topic: String,
    /// The QoS to use for outbound messages.
    pub qos: i32,
}

/// Errors raised while republishing an enriched reading.
///
/// Republishing is best-effort: the reading is already durable when any
/// of these occur, so the caller logs and moves on.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The outbound broker connection is down and could not be restored
    /// within the client timeout.
    #[error("outbound channel unavailable: {0}")]
    ChannelUnavailable(String),
    /// The enriched payload could not be encoded.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of a failed reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Try again after the retry interval.
    Retry,
    /// Too many consecutive failures, terminate the process.
    Escalate,
}

/// Spaces repeated attempts at an unavailable resource by a fixed
/// interval. Both broker connections use this so an outage costs one
/// bounded attempt per interval, never one per loop tick or reading.
struct RetryPacer {
    interval: Duration,
    last_attempt: Option<Instant>,
}

impl RetryPacer {
    fn new(interval: Duration) -> RetryPacer {
        RetryPacer {
            interval,
            last_attempt: None,
        }
    }

    /// Whether an attempt is due. Records the attempt time when it
    /// returns true, so attempts are spaced by the interval.
    fn due(&mut self, now: Instant) -> bool {
        match self.last_attempt {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                self.last_attempt = Some(now);
                true
            }
        }
    }

    fn reset(&mut self) {
        self.last_attempt = None;
    }
}

/// Spaces reconnect attempts and escalates after a run of consecutive
/// failures. A single success resets the run.
pub struct ReconnectPolicy {
    pacer: RetryPacer,
    max_failures: u32,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(retry_interval: Duration, max_failures: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            pacer: RetryPacer::new(retry_interval),
            max_failures,
            failures: 0,
        }
    }

    /// Whether a reconnect attempt is due; see [`RetryPacer::due`].
    pub fn should_attempt(&mut self, now: Instant) -> bool {
        self.pacer.due(now)
    }

    pub fn record_failure(&mut self) -> FailureAction {
        self.failures += 1;
        if self.failures >= self.max_failures {
            FailureAction::Escalate
        } else {
            FailureAction::Retry
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.pacer.reset();
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Edge-triggered liveness check over the inbound message stream.
///
/// A silent sensor (dead node, stuck firmware, wrong topic) produces no
/// broker-level error, so elapsed time since the last parsed message is
/// the only signal.
pub struct Watchdog {
    timeout: Duration,
    last_message: Instant,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Watchdog {
        Watchdog {
            timeout,
            last_message: Instant::now(),
        }
    }

    /// Records a successfully parsed message.
    pub fn notify(&mut self) {
        self.notify_at(Instant::now());
    }

    fn notify_at(&mut self, now: Instant) {
        self.last_message = now;
    }

    /// Returns true when the timeout expired since the last message.
    /// The reference point is then reset, so one timeout episode raises
    /// exactly one alert instead of one per poll tick.
    pub fn check(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_message) > self.timeout {
            self.last_message = now;
            true
        } else {
            false
        }
    }
}

fn broker_uri(params: &MqttParams) -> String {
    match params.tls_enable {
        true => format!("ssl://{}:{}", params.address, params.port),
        false => format!("tcp://{}:{}", params.address, params.port),
    }
}

fn epoch_seconds() -> u64 {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => n.as_secs(),
        Err(_) => 0,
    }
}

/// Builds fresh connect options; they are rebuilt for every attempt.
fn connect_options(params: &MqttParams) -> Result<mqtt::ConnectOptions, String> {
    match params.tls_enable {
        true => {
            let tls_params = match &params.tls_params {
                Some(tls_params) => tls_params,
                None => return Err(String::from("TLS enabled but no TLS parameters specified")),
            };

            let ssl_options = match &tls_params.key_pass {
                Some(key_pass) => mqtt::SslOptionsBuilder::new()
                    .trust_store(tls_params.ca_path.as_ref())
                    .key_store(tls_params.cert_path.as_ref())
                    .private_key(tls_params.key_path.as_ref())
                    .private_key_password(key_pass.as_ref())
                    .finalize(),
                None => mqtt::SslOptionsBuilder::new()
                    .trust_store(tls_params.ca_path.as_ref())
                    .key_store(tls_params.cert_path.as_ref())
                    .private_key(tls_params.key_path.as_ref())
                    .finalize(),
            };
            Ok(mqtt::ConnectOptionsBuilder::new()
                .connect_timeout(time::Duration::from_millis(4000))
                .keep_alive_interval(time::Duration::from_secs(params.keepalive_secs))
                .ssl_options(ssl_options)
                .finalize())
        }
        false => Ok(mqtt::ConnectOptionsBuilder::new()
            .connect_timeout(time::Duration::from_millis(4000))
            .keep_alive_interval(time::Duration::from_secs(params.keepalive_secs))
            .finalize()),
    }
}

/// Outbound MQTT client that mirrors every stored reading, enriched with
/// its canonical timestamp, onto a second topic.
///
/// Holds its own broker connection so a republish hiccup never disturbs
/// the inbound subscription.
pub struct Republisher {
    client: mqtt::Client,
    mqtt_params: MqttParams,
    topic: String,
    qos: i32,
    connected: bool,
    pacer: RetryPacer,
}

impl Republisher {
    /// Creates the outbound client and attempts a first connect. A
    /// failed connect is not fatal; the next `republish` retries.
    pub fn new(
        mqtt_params: &MqttParams,
        params: &RepublishParams,
    ) -> Result<Republisher, PublishError> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(broker_uri(mqtt_params))
            .client_id(format!("envlogd-pub-{}", epoch_seconds()))
            .finalize();

        let mut client = match mqtt::Client::new(create_opts) {
            Ok(client) => client,
            Err(err) => return Err(PublishError::ChannelUnavailable(format!("{}", err))),
        };
        client.set_timeout(std::time::Duration::from_millis(4000));

        let mut republisher = Republisher {
            client,
            mqtt_params: mqtt_params.clone(),
            topic: params.topic.clone(),
            qos: params.qos,
            connected: false,
            pacer: RetryPacer::new(Duration::from_secs(mqtt_params.reconnect_interval_secs)),
        };
        republisher.connect();
        Ok(republisher)
    }

    fn connect(&mut self) -> bool {
        let options = match connect_options(&self.mqtt_params) {
            Ok(options) => options,
            Err(err) => {
                log::error!(target: "envlogd::mqtt", "Invalid republish connection options: \'{}\'", err);
                return false;
            }
        };
        match self.client.connect(options) {
            Ok(_) => {
                log::info!(target: "envlogd::mqtt", "Republish client connected to topic \'{}\'!", self.topic);
                self.connected = true;
                self.pacer.reset();
            }
            Err(err) => {
                log::warn!(target: "envlogd::mqtt", "Republish client could not connect: \'{}\'", err);
                self.connected = false;
            }
        }
        self.connected
    }

    /// Publishes the enriched copy of an already-stored reading.
    ///
    /// A failure here leaves the database row untouched.
    pub fn republish(
        &mut self,
        reading: &Reading,
        canonical_timestamp: &str,
    ) -> Result<(), PublishError> {
        if !self.connected {
            // The blocking connect attempt is paced by the retry
            // interval; readings arriving in between fail fast.
            if !self.pacer.due(Instant::now()) {
                return Err(PublishError::ChannelUnavailable(String::from(
                    "republish client is not connected, next retry not due yet",
                )));
            }
            if !self.connect() {
                return Err(PublishError::ChannelUnavailable(String::from(
                    "republish client is not connected",
                )));
            }
        }

        let payload = serde_json::to_vec(&reading.enrich(canonical_timestamp))?;
        let message = mqtt::Message::new(self.topic.as_str(), payload, self.qos);
        match self.client.publish(message) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.connected = false;
                Err(PublishError::ChannelUnavailable(format!("{}", err)))
            }
        }
    }

    /// Drops the outbound connection. Called on shutdown.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        match self.client.disconnect(Option::None) {
            Ok(_) => log::info!(target: "envlogd::mqtt", "Republish client disconnected!"),
            Err(err) => {
                log::warn!(target: "envlogd::mqtt", "Republish client could not disconnect: \'{}\'", err)
            }
        }
        self.connected = false;
    }
}

fn subscribe(client: &mqtt::Client, params: &MqttParams) -> bool {
    match client.subscribe(params.env_topic.as_ref(), params.qos) {
        Ok(_) => {
            log::debug!(target: "envlogd::mqtt", "Subscribed to topic \'{}\' with qos {}!", params.env_topic, params.qos);
            true
        }
        Err(err) => {
            log::error!(target: "envlogd::mqtt", "Unable to subscribe to topic \'{}\': \'{}\'", params.env_topic, err);
            false
        }
    }
}

/// Thread function for the inbound MQTT subscription.
///
/// Parses every message on the environmental topic and forwards the
/// validated readings to the pipeline thread. Malformed messages are
/// dropped and logged, never fatal. Runs the sensor watchdog and the
/// broker reconnect policy on the receive ticks.
///
/// Runs until `thread_finish` is set or the reconnect policy escalates.
/// Returns `true` on escalation so the caller can exit non-zero and let
/// the service manager restart the daemon.
pub fn subscriber_thread(
    tx: Sender<Reading>,
    thread_finish: Arc<AtomicBool>,
    params: MqttParams,
    parse_options: ParseOptions,
) -> bool {
    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(broker_uri(&params))
        .client_id(format!("envlogd-sub-{}", epoch_seconds()))
        .finalize();

    let mut mqtt_client = match mqtt::Client::new(create_opts) {
        Ok(client) => client,
        Err(err) => {
            log::error!(target: "envlogd::mqtt", "Could not create mqtt client: \'{}\'!", err);
            thread_finish.store(true, Ordering::SeqCst);
            return true;
        }
    };
    mqtt_client.set_timeout(std::time::Duration::from_millis(4000));

    // Consuming must start before the first connect so no message
    // between connect and subscribe is lost.
    let receiver_queue = mqtt_client.start_consuming();

    let mut policy = ReconnectPolicy::new(
        Duration::from_secs(params.reconnect_interval_secs),
        params.max_reconnect_failures,
    );
    let mut watchdog = Watchdog::new(Duration::from_secs(params.watchdog_timeout_secs));

    // Option building only fails on inconsistent TLS configuration,
    // which no amount of retrying will fix.
    if let Err(err) = connect_options(&params) {
        log::error!(target: "envlogd::mqtt", "Invalid mqtt connection options: \'{}\'", err);
        thread_finish.store(true, Ordering::SeqCst);
        return true;
    }

    let mut connected = false;
    let mut ever_connected = false;
    if let Ok(options) = connect_options(&params) {
        match mqtt_client.connect(options) {
            Ok(_) => {
                log::info!(target: "envlogd::mqtt", "Mqtt client connected to \'{}\'!", broker_uri(&params));
                ever_connected = true;
                connected = subscribe(&mqtt_client, &params);
            }
            Err(err) => match policy.record_failure() {
                FailureAction::Retry => {
                    log::warn!(target: "envlogd::mqtt", "Initial broker connection failed, retrying: \'{}\'", err);
                }
                FailureAction::Escalate => {
                    log::error!(target: "envlogd::mqtt", "Giving up after {} consecutive failed connects: \'{}\'", policy.failures(), err);
                    thread_finish.store(true, Ordering::SeqCst);
                    return true;
                }
            },
        }
    }

    let timeout = time::Duration::from_millis(100);

    while !thread_finish.load(Ordering::SeqCst) {
        match receiver_queue.recv_timeout(timeout) {
            Ok(Some(message)) => {
                if message.retained() {
                    // Not interested in any retained messages.
                } else {
                    match record::parse(message.payload(), Utc::now(), &parse_options) {
                        Ok(reading) => {
                            watchdog.notify();
                            match tx.send(reading) {
                                Ok(_) => {
                                    log::trace!(target: "envlogd::mqtt", "Sent reading to pipeline thread!")
                                }
                                Err(err) => {
                                    log::error!(target: "envlogd::mqtt", "Could not send reading to pipeline thread: \'{}\'", err);
                                    thread_finish.store(true, Ordering::SeqCst);
                                    break;
                                }
                            }
                        }
                        Err(err) => {
                            log::warn!(target: "envlogd::mqtt", "Dropped message on topic \'{}\': \'{}\'", params.env_topic, err);
                        }
                    }
                }
            }
            Ok(None) => {
                if connected {
                    log::warn!(target: "envlogd::mqtt", "Broker connection lost!");
                }
                connected = false;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::error!(target: "envlogd::mqtt", "Mqtt consumer queue closed unexpectedly!");
                thread_finish.store(true, Ordering::SeqCst);
                break;
            }
        };

        if !connected && policy.should_attempt(Instant::now()) {
            // A client that never reached the broker has no session to
            // resume, so it needs a full connect instead of a reconnect.
            let attempt = match ever_connected {
                true => mqtt_client.reconnect(),
                false => match connect_options(&params) {
                    Ok(options) => mqtt_client.connect(options),
                    Err(err) => {
                        log::error!(target: "envlogd::mqtt", "Invalid mqtt connection options: \'{}\'", err);
                        thread_finish.store(true, Ordering::SeqCst);
                        return true;
                    }
                },
            };
            match attempt {
                Ok(_) => {
                    log::info!(target: "envlogd::mqtt", "Mqtt client reconnected!");
                    policy.record_success();
                    ever_connected = true;
                    connected = subscribe(&mqtt_client, &params);
                }
                Err(err) => {
                    match policy.record_failure() {
                        FailureAction::Retry => {
                            log::warn!(target: "envlogd::mqtt", "Reconnect attempt {} failed: \'{}\'", policy.failures(), err);
                        }
                        FailureAction::Escalate => {
                            log::error!(target: "envlogd::mqtt", "Giving up after {} consecutive failed reconnects: \'{}\'", policy.failures(), err);
                            thread_finish.store(true, Ordering::SeqCst);
                            return true;
                        }
                    };
                }
            }
        }

        if watchdog.check(Instant::now()) {
            log::error!(target: "envlogd::watchdog", "No sensor data on topic \'{}\' for more than {}s!", params.env_topic, params.watchdog_timeout_secs);
        }
    }

    if connected {
        match mqtt_client.disconnect(Option::None) {
            Ok(_) => log::info!(target: "envlogd::mqtt", "Disconnected from mqtt broker!"),
            Err(err) => {
                log::error!(target: "envlogd::mqtt", "Could not disconnect from mqtt broker: \'{}\'", err)
            }
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn watchdog_alerts_once_per_timeout_episode() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_secs(60));
        watchdog.notify_at(start);

        // Polled every 10s; only the first expired poll alerts.
        assert!(!watchdog.check(start + 10 * SECOND));
        assert!(!watchdog.check(start + 60 * SECOND));
        assert!(watchdog.check(start + 70 * SECOND));
        assert!(!watchdog.check(start + 80 * SECOND));
        assert!(!watchdog.check(start + 120 * SECOND));

        // Still silent a full timeout later: a new episode.
        assert!(watchdog.check(start + 131 * SECOND));
    }

    #[test]
    fn watchdog_stays_quiet_while_messages_flow() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_secs(60));
        watchdog.notify_at(start);

        for tick in 1..20 {
            watchdog.notify_at(start + (tick * 30) * SECOND);
            assert!(!watchdog.check(start + (tick * 30 + 10) * SECOND));
        }
    }

    #[test]
    fn reconnect_success_resets_the_failure_run() {
        let start = Instant::now();
        let mut policy = ReconnectPolicy::new(Duration::from_secs(10), 3);

        assert!(policy.should_attempt(start));
        assert_eq!(policy.record_failure(), FailureAction::Retry);
        assert!(policy.should_attempt(start + 10 * SECOND));
        assert_eq!(policy.record_failure(), FailureAction::Retry);
        assert!(policy.should_attempt(start + 20 * SECOND));
        policy.record_success();

        assert_eq!(policy.failures(), 0);
    }

    #[test]
    fn reconnect_escalates_at_max_consecutive_failures() {
        let start = Instant::now();
        let mut policy = ReconnectPolicy::new(Duration::from_secs(10), 3);

        let mut actions = Vec::new();
        for attempt in 0..3 {
            assert!(policy.should_attempt(start + (attempt * 10) * SECOND));
            actions.push(policy.record_failure());
        }

        assert_eq!(
            actions,
            vec![
                FailureAction::Retry,
                FailureAction::Retry,
                FailureAction::Escalate
            ]
        );
    }

    #[test]
    fn reconnect_attempts_are_spaced_by_the_retry_interval() {
        let start = Instant::now();
        let mut policy = ReconnectPolicy::new(Duration::from_secs(10), 3);

        assert!(policy.should_attempt(start));
        policy.record_failure();

        // Loop ticks every 100ms must not turn into a tight retry loop.
        assert!(!policy.should_attempt(start + 1 * SECOND));
        assert!(!policy.should_attempt(start + 9 * SECOND));
        assert!(policy.should_attempt(start + 10 * SECOND));
    }

    #[test]
    fn escalation_honors_a_limit_of_one() {
        // Every failed attempt, the initial connect included, must
        // consult the returned action.
        let mut policy = ReconnectPolicy::new(Duration::from_secs(10), 1);
        assert_eq!(policy.record_failure(), FailureAction::Escalate);
    }

    #[test]
    fn outbound_retries_are_paced_by_the_interval() {
        let start = Instant::now();
        let mut pacer = RetryPacer::new(Duration::from_secs(10));

        // One bounded attempt per interval, however many readings
        // arrive in between.
        assert!(pacer.due(start));
        assert!(!pacer.due(start + 1 * SECOND));
        assert!(!pacer.due(start + 9 * SECOND));
        assert!(pacer.due(start + 10 * SECOND));

        // A successful connect clears the spacing.
        pacer.reset();
        assert!(pacer.due(start + 11 * SECOND));
    }

    #[test]
    fn broker_uri_reflects_tls_setting() {
        let mut params = MqttParams {
            address: String::from("localhost"),
            port: 1883,
            tls_enable: false,
            tls_params: None,
            env_topic: String::from("esp32/data"),
            qos: 1,
            keepalive_secs: 6,
            watchdog_timeout_secs: 60,
            reconnect_interval_secs: 10,
            max_reconnect_failures: 3,
        };
        assert_eq!(broker_uri(&params), "tcp://localhost:1883");
        params.tls_enable = true;
        params.port = 8883;
        assert_eq!(broker_uri(&params), "ssl://localhost:8883");
    }
}
