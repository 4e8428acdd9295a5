//! Poll orchestrator for one Sinapsi Alfa device
//!
//! A poll cycle runs: liveness probe, identity acquisition (once), scoped
//! connection, ordered batch reads, decode/derive, atomic publication of the
//! new state map. Errors anywhere fail the whole cycle; the previously
//! published values stay intact.

use crate::config::{DeviceConfig, host_valid};
use crate::error::{AlfaError, Result};
use crate::logging::{LogContext, get_logger_with_context};
use crate::modbus::{AlfaModbusClient, decode_u16, decode_u32};
use crate::registers::{
    Measure, REGISTER_BATCHES, RegisterKind, SENSOR_CATALOG, SensorDefinition, SensorMap,
};
use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

/// Device vendor, published with the state
pub const MANUFACTURER: &str = "Sinapsi";
/// Device model, published with the state
pub const MODEL: &str = "Alfa";

/// Raw disconnect-timer value meaning "not applicable"
pub const INVALID_DISCONNECT_VALUE: i64 = 65535;
/// Event timestamps above this ceiling mean "no event"
pub const MAX_EVENT_VALUE: i64 = 4_294_967_294;

/// Attempts for MAC-address detection before the synthetic fallback
const MAX_MAC_ATTEMPTS: u32 = 5;
/// Cap on the MAC-detection backoff delay
const MAC_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// A published sensor value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorValue {
    /// Scaled measurement (kW / kWh), two decimals
    Number(f64),
    /// Unscaled register value
    Integer(i64),
    /// Formatted value (time band, event timestamp)
    Text(String),
    /// Sentinel for "no value" (e.g. no event recorded)
    None,
}

impl SensorValue {
    /// Numeric view, for derived-value arithmetic
    fn as_f64(&self) -> f64 {
        match self {
            SensorValue::Number(v) => *v,
            SensorValue::Integer(v) => *v as f64,
            _ => 0.0,
        }
    }
}

/// Latest decoded state of one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceState {
    /// Display name from the configuration
    pub name: String,
    /// Unique id: MAC address or host-port fallback
    pub serial: String,
    /// Device vendor
    pub manufacturer: &'static str,
    /// Device model
    pub model: &'static str,
    /// Latest value per sensor key
    pub values: HashMap<&'static str, SensorValue>,
}

impl DeviceState {
    /// Fresh state with zeroed values for every register-backed sensor, so
    /// consumers always see the complete key set
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            serial: String::new(),
            manufacturer: MANUFACTURER,
            model: MODEL,
            values: seeded_values(),
        }
    }

    /// JSON snapshot for diagnostics and logging
    pub fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn seeded_values() -> HashMap<&'static str, SensorValue> {
    SENSOR_CATALOG
        .iter()
        .filter(|def| def.kind != RegisterKind::Derived)
        .map(|def| (def.key, SensorValue::Number(0.0)))
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Apply unit scaling: power/energy arrive as W/Wh and are published as
/// kW/kWh with two decimals; everything else truncates to integer
pub fn process_value(raw: f64, def: &SensorDefinition) -> SensorValue {
    match def.measure {
        Measure::Power | Measure::Energy => SensorValue::Number(round2(raw / 1000.0)),
        Measure::None => SensorValue::Integer(raw as i64),
    }
}

/// Convert a unix timestamp (UTC) to an ISO-8601 string with the local
/// timezone offset
pub fn unix_timestamp_to_iso8601_local(timestamp: i64) -> Option<String> {
    DateTime::from_timestamp(timestamp, 0)
        .map(|utc| utc.with_timezone(&Local).to_rfc3339_opts(SecondsFormat::Secs, false))
}

/// Per-sensor special cases, keyed by sensor identity:
/// - disconnect timer: sentinel 65535 means "not applicable", published as 0
/// - event timestamp: values above the ceiling mean "no event"; otherwise
///   the raw epoch seconds (offset by the disconnect timer) become a
///   local-timezone ISO-8601 string
/// - current time band: formatted as `F<value>`
pub fn apply_special_rules(
    key: &str,
    value: SensorValue,
    decoded: &HashMap<&'static str, SensorValue>,
) -> SensorValue {
    match (key, &value) {
        ("tempo_residuo_distacco", SensorValue::Integer(v)) if *v == INVALID_DISCONNECT_VALUE => {
            SensorValue::Integer(0)
        }
        ("data_evento", SensorValue::Integer(v)) => {
            if *v > MAX_EVENT_VALUE {
                SensorValue::None
            } else {
                let offset = decoded
                    .get("tempo_residuo_distacco")
                    .map(SensorValue::as_f64)
                    .unwrap_or(0.0) as i64;
                match unix_timestamp_to_iso8601_local(*v + offset) {
                    Some(formatted) => SensorValue::Text(formatted),
                    None => SensorValue::None,
                }
            }
        }
        ("fascia_oraria_attuale", SensorValue::Integer(v)) => SensorValue::Text(format!("F{}", v)),
        _ => value,
    }
}

/// Compute the four derived consumption values from the base measurements.
/// Runs after every batch of a cycle has been decoded.
pub fn calculate_derived(values: &mut HashMap<&'static str, SensorValue>) {
    let get = |values: &HashMap<&'static str, SensorValue>, key: &str| {
        values.get(key).map(SensorValue::as_f64).unwrap_or(0.0)
    };

    let self_consumed_power =
        round2(get(values, "potenza_prodotta") - get(values, "potenza_immessa"));
    let consumed_power = round2(self_consumed_power + get(values, "potenza_prelevata"));
    values.insert("potenza_auto_consumata", SensorValue::Number(self_consumed_power));
    values.insert("potenza_consumata", SensorValue::Number(consumed_power));

    let self_consumed_energy =
        round2(get(values, "energia_prodotta") - get(values, "energia_immessa"));
    let consumed_energy = round2(self_consumed_energy + get(values, "energia_prelevata"));
    values.insert("energia_auto_consumata", SensorValue::Number(self_consumed_energy));
    values.insert("energia_consumata", SensorValue::Number(consumed_energy));
}

/// A pollable device: the seam between the scheduler and the device client
#[async_trait]
pub trait PollableDevice: Send {
    /// Run one full poll cycle and return the refreshed state
    async fn poll(&mut self) -> Result<DeviceState>;

    /// Display name of the device
    fn name(&self) -> &str;

    /// Device host
    fn host(&self) -> &str;

    /// Device port
    fn port(&self) -> u16;
}

/// Poll orchestrator for one configured Alfa device
pub struct AlfaClient {
    name: String,
    host: String,
    port: u16,
    skip_mac_detection: bool,
    modbus: AlfaModbusClient,
    sensor_map: SensorMap,
    uid: Option<String>,
    state: DeviceState,
    logger: crate::logging::StructuredLogger,
}

impl AlfaClient {
    /// Create a new client. Construction-time validation rejects invalid
    /// host/port outright; these are configuration bugs, never retried.
    pub fn new(config: &DeviceConfig, sensor_map: SensorMap) -> Result<Self> {
        if !host_valid(&config.host) {
            return Err(AlfaError::validation(
                "host",
                "Host must be a valid IP address or hostname",
            ));
        }
        if config.port == 0 {
            return Err(AlfaError::validation(
                "port",
                "Port must be between 1 and 65535",
            ));
        }
        if config.name.is_empty() {
            return Err(AlfaError::validation("name", "Name cannot be empty"));
        }

        let modbus = AlfaModbusClient::new(
            &config.host,
            config.port,
            config.slave_id,
            Duration::from_secs(config.timeout_s),
        );

        Ok(Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            skip_mac_detection: config.skip_mac_detection,
            modbus,
            sensor_map,
            uid: None,
            state: DeviceState::new(&config.name),
            logger: get_logger_with_context(LogContext::new("client").with_device(&config.name)),
        })
    }

    /// Unique id, once established
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Latest published state
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Connection health of the underlying Modbus client
    pub fn health(&self) -> &crate::modbus::ConnectionHealth {
        self.modbus.health()
    }

    fn synthetic_uid(&self) -> String {
        format!("{}-{}", self.host, self.port)
    }

    /// Establish the device identity once per client lifetime: MAC address
    /// when detection is enabled and succeeds, host-port fallback otherwise.
    async fn ensure_identity(&mut self) {
        if self.uid.is_some() {
            return;
        }

        let uid = if self.skip_mac_detection {
            self.logger.debug("MAC detection skipped by configuration");
            self.synthetic_uid()
        } else {
            match self.detect_mac_address().await {
                Some(mac) => mac,
                None => {
                    self.logger
                        .warn("MAC address not found, falling back to host-port id");
                    self.synthetic_uid()
                }
            }
        };

        self.logger.info(&format!("Device identity established: {}", uid));
        self.state.serial = uid.clone();
        self.uid = Some(uid);
    }

    /// Look up the device MAC address from the kernel ARP table with bounded
    /// exponential backoff and jitter. The probe beforehand refreshes the
    /// ARP entry for hosts on the local segment.
    async fn detect_mac_address(&self) -> Option<String> {
        for attempt in 0..MAX_MAC_ATTEMPTS {
            if attempt == 0 || attempt % 3 == 0 {
                let reachable = self.modbus.probe().await;
                self.logger.debug(&format!(
                    "MAC detection port check attempt {}: {}",
                    attempt + 1,
                    if reachable { "ok" } else { "failed" }
                ));
            }

            match lookup_mac(&self.host).await {
                Some(mac) => {
                    self.logger
                        .debug(&format!("MAC found on attempt {}: {}", attempt + 1, mac));
                    return Some(mac);
                }
                None if attempt + 1 < MAX_MAC_ATTEMPTS => {
                    let exponential = Duration::from_secs(1 << attempt);
                    let jitter = Duration::from_millis((rand::random::<f64>() * 1000.0) as u64);
                    let delay = (exponential + jitter).min(MAC_BACKOFF_CAP);
                    self.logger.debug(&format!(
                        "MAC attempt {} failed, retrying in {:?}",
                        attempt + 1,
                        delay
                    ));
                    sleep(delay).await;
                }
                None => {}
            }
        }
        None
    }

    /// Read every batch in fixed order and decode into a fresh value map.
    /// The caller owns connection teardown.
    async fn read_cycle(&mut self) -> Result<HashMap<&'static str, SensorValue>> {
        let mut batches: Vec<Vec<u16>> = Vec::with_capacity(REGISTER_BATCHES.len());
        for batch in &REGISTER_BATCHES {
            batches.push(self.modbus.read_batch(batch.start, batch.count).await?);
        }

        let mut values = seeded_values();
        for def in SENSOR_CATALOG
            .iter()
            .filter(|def| def.kind != RegisterKind::Derived)
        {
            let slot = self.sensor_map.get(def.key).ok_or_else(|| {
                AlfaError::modbus(format!("sensor '{}' missing from register map", def.key))
            })?;
            let raw = match slot.kind {
                RegisterKind::Uint16 => decode_u16(&batches[slot.batch], slot.offset)? as f64,
                RegisterKind::Uint32 => decode_u32(&batches[slot.batch], slot.offset)? as f64,
                RegisterKind::Derived => continue,
            };
            let processed = process_value(raw, def);
            let value = apply_special_rules(def.key, processed, &values);
            self.logger
                .trace(&format!("Decoded {}: {:?}", def.key, value));
            values.insert(def.key, value);
        }

        calculate_derived(&mut values);
        Ok(values)
    }
}

#[async_trait]
impl PollableDevice for AlfaClient {
    /// One full poll cycle: probe, identity, connect, batch reads, decode,
    /// derive, publish. The connection is closed on every exit path, and the
    /// published state is replaced atomically only on success.
    async fn poll(&mut self) -> Result<DeviceState> {
        self.modbus.begin_cycle();

        if !self.modbus.probe().await {
            self.modbus.health_mut().healthy = false;
            return Err(AlfaError::connection(format!(
                "device not reachable at {}:{}",
                self.host, self.port
            )));
        }

        self.ensure_identity().await;

        self.modbus.connect().await?;
        let result = self.read_cycle().await;
        self.modbus.disconnect().await;

        let values = result?;
        self.state.values = values;
        self.modbus.mark_cycle_success();
        self.logger.debug(&format!(
            "Poll cycle complete for {} ({} values)",
            self.name,
            self.state.values.len()
        ));
        Ok(self.state.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// Resolve a host's MAC address from `/proc/net/arp`
async fn lookup_mac(host: &str) -> Option<String> {
    let ip = resolve_ipv4(host).await?;
    let table = tokio::fs::read_to_string("/proc/net/arp").await.ok()?;

    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let entry_ip = fields.next()?;
        let mac = fields.nth(2)?;
        if entry_ip == ip && mac != "00:00:00:00:00:00" {
            return Some(mac.replace(':', "").to_uppercase());
        }
    }
    None
}

/// Resolve a hostname to a dotted IPv4 string
async fn resolve_ipv4(host: &str) -> Option<String> {
    if let Ok(addr) = host.parse::<std::net::IpAddr>() {
        return Some(addr.to_string());
    }
    let mut addrs = tokio::net::lookup_host((host, 0u16)).await.ok()?;
    addrs
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{REGISTER_BATCHES, SENSOR_CATALOG, build_sensor_map};

    fn def(key: &str) -> &'static SensorDefinition {
        SENSOR_CATALOG
            .iter()
            .find(|d| d.key == key)
            .unwrap_or_else(|| panic!("unknown sensor {key}"))
    }

    #[test]
    fn power_and_energy_scale_to_kilo_units() {
        assert_eq!(
            process_value(1500.0, def("potenza_prelevata")),
            SensorValue::Number(1.5)
        );
        assert_eq!(
            process_value(1234.0, def("energia_prelevata")),
            SensorValue::Number(1.23)
        );
    }

    #[test]
    fn unscaled_values_truncate_to_integer() {
        assert_eq!(
            process_value(3.9, def("fascia_oraria_attuale")),
            SensorValue::Integer(3)
        );
    }

    #[test]
    fn disconnect_timer_sentinel_maps_to_zero() {
        let decoded = HashMap::new();
        let value = apply_special_rules(
            "tempo_residuo_distacco",
            SensorValue::Integer(INVALID_DISCONNECT_VALUE),
            &decoded,
        );
        assert_eq!(value, SensorValue::Integer(0));

        let value =
            apply_special_rules("tempo_residuo_distacco", SensorValue::Integer(120), &decoded);
        assert_eq!(value, SensorValue::Integer(120));
    }

    #[test]
    fn event_timestamp_above_ceiling_is_none() {
        let decoded = HashMap::new();
        let value = apply_special_rules(
            "data_evento",
            SensorValue::Integer(MAX_EVENT_VALUE + 1),
            &decoded,
        );
        assert_eq!(value, SensorValue::None);
    }

    #[test]
    fn event_timestamp_is_offset_by_disconnect_timer_and_formatted() {
        let mut decoded = HashMap::new();
        decoded.insert("tempo_residuo_distacco", SensorValue::Integer(60));
        let value = apply_special_rules("data_evento", SensorValue::Integer(1_739_238_005), &decoded);
        match value {
            SensorValue::Text(s) => {
                // Local-tz ISO-8601 of 1739238005 + 60
                let parsed = DateTime::parse_from_rfc3339(&s).unwrap();
                assert_eq!(parsed.timestamp(), 1_739_238_065);
            }
            other => panic!("expected formatted timestamp, got {:?}", other),
        }
    }

    #[test]
    fn time_band_is_formatted_with_prefix() {
        let decoded = HashMap::new();
        let value = apply_special_rules("fascia_oraria_attuale", SensorValue::Integer(3), &decoded);
        assert_eq!(value, SensorValue::Text("F3".to_string()));
    }

    #[test]
    fn derived_power_values() {
        let mut values = HashMap::new();
        values.insert("potenza_prelevata", SensorValue::Number(1.5));
        values.insert("potenza_immessa", SensorValue::Number(0.5));
        values.insert("potenza_prodotta", SensorValue::Number(2.0));
        values.insert("energia_prelevata", SensorValue::Number(1000.0));
        values.insert("energia_immessa", SensorValue::Number(200.0));
        values.insert("energia_prodotta", SensorValue::Number(500.0));

        calculate_derived(&mut values);

        assert_eq!(values["potenza_auto_consumata"], SensorValue::Number(1.5));
        assert_eq!(values["potenza_consumata"], SensorValue::Number(3.0));
        assert_eq!(values["energia_auto_consumata"], SensorValue::Number(300.0));
        assert_eq!(values["energia_consumata"], SensorValue::Number(1300.0));
    }

    #[test]
    fn state_is_seeded_with_all_register_backed_keys() {
        let state = DeviceState::new("Alfa");
        assert_eq!(state.values.len(), 23);
        assert_eq!(state.values["potenza_prelevata"], SensorValue::Number(0.0));
        assert!(!state.values.contains_key("potenza_consumata"));
        assert_eq!(state.manufacturer, "Sinapsi");
        assert_eq!(state.model, "Alfa");
    }

    #[test]
    fn client_construction_validates_inputs() {
        let map = build_sensor_map(&SENSOR_CATALOG, &REGISTER_BATCHES).unwrap();
        let mut config = DeviceConfig::default();
        config.host = "bad host".to_string();
        assert!(AlfaClient::new(&config, map.clone()).is_err());

        let mut config = DeviceConfig::default();
        config.port = 0;
        assert!(AlfaClient::new(&config, map.clone()).is_err());

        let config = DeviceConfig::default();
        let client = AlfaClient::new(&config, map).unwrap();
        assert_eq!(client.name(), "Alfa");
        assert_eq!(client.synthetic_uid(), "192.168.1.100-502");
        assert!(client.uid().is_none());
    }

    #[test]
    fn snapshot_serializes_sentinel_as_null() {
        let mut state = DeviceState::new("Alfa");
        state.values.insert("data_evento", SensorValue::None);
        let json = state.snapshot().unwrap();
        assert!(json["values"]["data_evento"].is_null());
        assert_eq!(json["manufacturer"], "Sinapsi");
    }
}
