//! Sensor catalog and register layout for the Sinapsi Alfa
//!
//! The Alfa exposes its measurements as 16-bit holding registers, with 32-bit
//! values stored big-endian across two consecutive registers. The catalog
//! below lists every published sensor; the batch table groups the registers
//! into contiguous windows so a poll cycle needs one wire request per window
//! instead of one per sensor. Batch order is fixed: the device mis-orders
//! responses when reads interleave.

use crate::error::{AlfaError, Result};
use std::collections::HashMap;

/// Register width/type of a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Single holding register
    Uint16,
    /// Two consecutive registers, big-endian composite
    Uint32,
    /// No register; computed from other sensors after decode
    Derived,
}

/// Measurement kind, used for unit scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    /// Device reports W, published as kW
    Power,
    /// Device reports Wh, published as kWh
    Energy,
    /// Raw value, truncated to integer
    None,
}

/// One entry of the static sensor catalog
#[derive(Debug, Clone, Copy)]
pub struct SensorDefinition {
    /// Unique sensor key
    pub key: &'static str,
    /// Human-readable name
    pub name: &'static str,
    /// Register width/type
    pub kind: RegisterKind,
    /// Measurement kind
    pub measure: Measure,
    /// Register address; `None` for derived sensors
    pub address: Option<u16>,
}

const fn sensor(
    key: &'static str,
    name: &'static str,
    kind: RegisterKind,
    measure: Measure,
    address: Option<u16>,
) -> SensorDefinition {
    SensorDefinition {
        key,
        name,
        kind,
        measure,
        address,
    }
}

/// Full sensor catalog: 23 register-backed sensors plus 4 derived ones
pub const SENSOR_CATALOG: [SensorDefinition; 27] = [
    sensor(
        "potenza_prelevata",
        "Potenza Prelevata",
        RegisterKind::Uint16,
        Measure::Power,
        Some(2),
    ),
    sensor(
        "potenza_prelevata_media_15m",
        "Potenza Prelevata Media 15m",
        RegisterKind::Uint16,
        Measure::Power,
        Some(9),
    ),
    sensor(
        "potenza_immessa",
        "Potenza Immessa",
        RegisterKind::Uint16,
        Measure::Power,
        Some(12),
    ),
    sensor(
        "potenza_immessa_media_15m",
        "Potenza Immessa Media 15m",
        RegisterKind::Uint16,
        Measure::Power,
        Some(19),
    ),
    sensor(
        "potenza_prodotta",
        "Potenza Prodotta",
        RegisterKind::Uint16,
        Measure::Power,
        Some(921),
    ),
    sensor(
        "energia_prelevata",
        "Energia Prelevata",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(5),
    ),
    sensor(
        "energia_immessa",
        "Energia Immessa",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(15),
    ),
    sensor(
        "energia_prodotta",
        "Energia Prodotta",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(924),
    ),
    sensor(
        "energia_prelevata_giornaliera_f1",
        "Energia Prelevata Giornaliera F1",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(30),
    ),
    sensor(
        "energia_prelevata_giornaliera_f2",
        "Energia Prelevata Giornaliera F2",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(32),
    ),
    sensor(
        "energia_prelevata_giornaliera_f3",
        "Energia Prelevata Giornaliera F3",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(34),
    ),
    sensor(
        "energia_prelevata_giornaliera_f4",
        "Energia Prelevata Giornaliera F4",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(36),
    ),
    sensor(
        "energia_prelevata_giornaliera_f5",
        "Energia Prelevata Giornaliera F5",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(38),
    ),
    sensor(
        "energia_prelevata_giornaliera_f6",
        "Energia Prelevata Giornaliera F6",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(40),
    ),
    sensor(
        "energia_immessa_giornaliera_f1",
        "Energia Immessa Giornaliera F1",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(54),
    ),
    sensor(
        "energia_immessa_giornaliera_f2",
        "Energia Immessa Giornaliera F2",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(56),
    ),
    sensor(
        "energia_immessa_giornaliera_f3",
        "Energia Immessa Giornaliera F3",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(58),
    ),
    sensor(
        "energia_immessa_giornaliera_f4",
        "Energia Immessa Giornaliera F4",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(60),
    ),
    sensor(
        "energia_immessa_giornaliera_f5",
        "Energia Immessa Giornaliera F5",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(62),
    ),
    sensor(
        "energia_immessa_giornaliera_f6",
        "Energia Immessa Giornaliera F6",
        RegisterKind::Uint32,
        Measure::Energy,
        Some(64),
    ),
    sensor(
        "fascia_oraria_attuale",
        "Fascia Oraria Attuale",
        RegisterKind::Uint16,
        Measure::None,
        Some(203),
    ),
    sensor(
        "tempo_residuo_distacco",
        "Tempo Residuo Distacco",
        RegisterKind::Uint16,
        Measure::None,
        Some(782),
    ),
    sensor(
        "data_evento",
        "Data Evento",
        RegisterKind::Uint32,
        Measure::None,
        Some(780),
    ),
    sensor(
        "potenza_consumata",
        "Potenza Consumata",
        RegisterKind::Derived,
        Measure::Power,
        None,
    ),
    sensor(
        "potenza_auto_consumata",
        "Potenza Auto Consumata",
        RegisterKind::Derived,
        Measure::Power,
        None,
    ),
    sensor(
        "energia_consumata",
        "Energia Consumata",
        RegisterKind::Derived,
        Measure::Energy,
        None,
    ),
    sensor(
        "energia_auto_consumata",
        "Energia Auto Consumata",
        RegisterKind::Derived,
        Measure::Energy,
        None,
    ),
];

/// A contiguous range of holding registers read in one wire request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBatch {
    /// First register address of the window
    pub start: u16,
    /// Number of registers in the window
    pub count: u16,
}

impl RegisterBatch {
    /// Whether `address` falls inside this window
    pub fn contains(&self, address: u16) -> bool {
        address >= self.start && address < self.start + self.count
    }
}

/// Fixed, ordered batch layout covering every register-backed sensor
pub const REGISTER_BATCHES: [RegisterBatch; 6] = [
    RegisterBatch { start: 2, count: 18 },   // instantaneous/average power + cumulative energy
    RegisterBatch { start: 30, count: 12 },  // daily drawn energy, six time bands
    RegisterBatch { start: 54, count: 12 },  // daily injected energy, six time bands
    RegisterBatch { start: 203, count: 1 },  // current time band
    RegisterBatch { start: 780, count: 3 },  // event timestamp + disconnect timer
    RegisterBatch { start: 921, count: 5 },  // produced power + produced energy
];

/// Location of a sensor's registers inside the batch layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSlot {
    /// Index into the batch table
    pub batch: usize,
    /// Word offset inside the batch
    pub offset: usize,
    /// Register width/type
    pub kind: RegisterKind,
}

/// Lookup table from sensor key to its slot in the batch layout
pub type SensorMap = HashMap<&'static str, SensorSlot>;

/// Build the sensor-key lookup table from the catalog and batch layout.
///
/// Fails if a register-backed sensor's address is not covered by any batch,
/// or if a 32-bit sensor's second word falls outside its batch. Either case
/// is a catalog consistency bug, so this runs once at startup and any error
/// is fatal.
pub fn build_sensor_map(
    sensor_defs: &[SensorDefinition],
    batches: &[RegisterBatch],
) -> Result<SensorMap> {
    let mut map = SensorMap::new();

    for def in sensor_defs {
        let address = match (def.kind, def.address) {
            (RegisterKind::Derived, _) => continue,
            (_, Some(addr)) => addr,
            (_, None) => {
                return Err(AlfaError::config(format!(
                    "Sensor '{}' has no register address",
                    def.key
                )));
            }
        };

        let width = match def.kind {
            RegisterKind::Uint16 => 1u16,
            RegisterKind::Uint32 => 2u16,
            RegisterKind::Derived => unreachable!(),
        };

        let slot = batches
            .iter()
            .enumerate()
            .find(|(_, batch)| batch.contains(address) && batch.contains(address + width - 1))
            .map(|(index, batch)| SensorSlot {
                batch: index,
                offset: (address - batch.start) as usize,
                kind: def.kind,
            })
            .ok_or_else(|| {
                AlfaError::config(format!(
                    "No batch covers register {} of sensor '{}'",
                    address, def.key
                ))
            })?;

        if map.insert(def.key, slot).is_some() {
            return Err(AlfaError::config(format!(
                "Duplicate sensor key '{}' in catalog",
                def.key
            )));
        }
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_register_backed_sensor_is_mapped_once() {
        let map = build_sensor_map(&SENSOR_CATALOG, &REGISTER_BATCHES).unwrap();

        let register_backed = SENSOR_CATALOG
            .iter()
            .filter(|s| s.kind != RegisterKind::Derived)
            .count();
        assert_eq!(map.len(), register_backed);
        assert_eq!(map.len(), 23);
    }

    #[test]
    fn derived_sensors_never_appear_in_map() {
        let map = build_sensor_map(&SENSOR_CATALOG, &REGISTER_BATCHES).unwrap();
        for def in SENSOR_CATALOG.iter().filter(|s| s.kind == RegisterKind::Derived) {
            assert!(!map.contains_key(def.key), "{} should not be mapped", def.key);
        }
    }

    #[test]
    fn slots_resolve_within_their_batch() {
        let map = build_sensor_map(&SENSOR_CATALOG, &REGISTER_BATCHES).unwrap();
        for (key, slot) in &map {
            let batch = REGISTER_BATCHES[slot.batch];
            let width = if slot.kind == RegisterKind::Uint32 { 2 } else { 1 };
            assert!(
                slot.offset + width <= batch.count as usize,
                "{} overruns batch {}",
                key,
                slot.batch
            );
        }
    }

    #[test]
    fn known_slot_positions() {
        let map = build_sensor_map(&SENSOR_CATALOG, &REGISTER_BATCHES).unwrap();

        let p = map["potenza_prelevata"];
        assert_eq!((p.batch, p.offset), (0, 0));

        let e = map["energia_immessa"];
        assert_eq!((e.batch, e.offset), (0, 13));
        assert_eq!(e.kind, RegisterKind::Uint32);

        let t = map["tempo_residuo_distacco"];
        assert_eq!((t.batch, t.offset), (4, 2));

        let prod = map["energia_prodotta"];
        assert_eq!((prod.batch, prod.offset), (5, 3));
    }

    #[test]
    fn uncovered_address_is_a_build_error() {
        let defs = [sensor(
            "orphan",
            "Orphan",
            RegisterKind::Uint16,
            Measure::None,
            Some(9999),
        )];
        assert!(build_sensor_map(&defs, &REGISTER_BATCHES).is_err());
    }

    #[test]
    fn uint32_straddling_batch_end_is_a_build_error() {
        let defs = [sensor(
            "straddle",
            "Straddle",
            RegisterKind::Uint32,
            Measure::None,
            Some(203),
        )];
        // Batch (203, 1) covers the first word only
        assert!(build_sensor_map(&defs, &REGISTER_BATCHES).is_err());
    }
}
