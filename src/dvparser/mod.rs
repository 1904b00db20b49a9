//! DIF/VIF data record walker.
//!
//! A record is one DIF, zero or more DIFEs, one VIF, zero or more VIFEs and
//! then the data bytes whose count the DIF dictates. The walker emits one
//! `DVEntry` per record keyed by the uppercase hex of its DIF/VIF chain.
//! Compact frames (TPL CI 0x79) carry only the data bytes; the DIF/VIF
//! skeleton is replayed from the process wide format signature cache.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::{debug, warn};

use crate::telegram::{KindOfData, Telegram, Understanding};
use crate::units::{Quantity, Unit};
use crate::utils::{bin2hex, crc16_en13757, is_likely_ascii, reverse_bcd, reverse_binary_ascii};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementType {
    Any,
    Instantaneous,
    Maximum,
    Minimum,
    AtError,
}

pub fn dif_measurement_type(dif: u8) -> MeasurementType {
    match (dif >> 4) & 0x3 {
        0 => MeasurementType::Instantaneous,
        1 => MeasurementType::Maximum,
        2 => MeasurementType::Minimum,
        _ => MeasurementType::AtError,
    }
}

/* Data bytes implied by the DIF low nibble. -1 is variable length,
   -2 is a special function dif. */
pub fn dif_len_bytes(dif: u8) -> i32 {
    match dif & 0x0F {
        0x0 => 0,
        0x1 => 1,
        0x2 => 2,
        0x3 => 3,
        0x4 => 4,
        0x5 => 4, // 32 bit real
        0x6 => 6,
        0x7 => 8,
        0x8 => 0, // selection for readout
        0x9 => 1,
        0xA => 2,
        0xB => 3,
        0xC => 4,
        0xD => -1,
        0xE => 6,
        0xF => -2,
        _ => unreachable!(),
    }
}

/// Named VIF ranges shared by drivers for matching without hardcoded keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VifRange {
    None,
    Any,
    Volume,
    OnTime,
    OperatingTime,
    VolumeFlow,
    FlowTemperature,
    ReturnTemperature,
    TemperatureDifference,
    ExternalTemperature,
    Pressure,
    HeatCostAllocation,
    Date,
    DateTime,
    EnergyMj,
    EnergyWh,
    PowerW,
    ActualityDuration,
    FabricationNo,
    EnhancedIdentification,
    EnergyMwh,
    RelativeHumidity,
    AccessNumber,
    Manufacturer,
    ParameterSet,
    ModelVersion,
    HardwareVersion,
    FirmwareVersion,
    SoftwareVersion,
    Location,
    Customer,
    ErrorFlags,
    DigitalOutput,
    DigitalInput,
    DurationSinceReadout,
    DurationOfTariff,
    Dimensionless,
    Voltage,
    Amperage,
    ResetCounter,
    CumulationCounter,
    AnyVolumeVif,
    AnyEnergyVif,
    AnyPowerVif,
}

impl VifRange {
    fn bounds(&self) -> Option<(u16, u16)> {
        match self {
            VifRange::Volume => Some((0x10, 0x17)),
            VifRange::OnTime => Some((0x20, 0x23)),
            VifRange::OperatingTime => Some((0x24, 0x27)),
            VifRange::VolumeFlow => Some((0x38, 0x3F)),
            VifRange::FlowTemperature => Some((0x58, 0x5B)),
            VifRange::ReturnTemperature => Some((0x5C, 0x5F)),
            VifRange::TemperatureDifference => Some((0x60, 0x63)),
            VifRange::ExternalTemperature => Some((0x64, 0x67)),
            VifRange::Pressure => Some((0x68, 0x6B)),
            VifRange::HeatCostAllocation => Some((0x6E, 0x6E)),
            VifRange::Date => Some((0x6C, 0x6C)),
            VifRange::DateTime => Some((0x6D, 0x6D)),
            VifRange::EnergyMj => Some((0x08, 0x0F)),
            VifRange::EnergyWh => Some((0x00, 0x07)),
            VifRange::PowerW => Some((0x28, 0x2F)),
            VifRange::ActualityDuration => Some((0x74, 0x77)),
            VifRange::FabricationNo => Some((0x78, 0x78)),
            VifRange::EnhancedIdentification => Some((0x79, 0x79)),
            VifRange::EnergyMwh => Some((0x7B00, 0x7B01)),
            VifRange::RelativeHumidity => Some((0x7B1A, 0x7B1B)),
            VifRange::AccessNumber => Some((0x7D08, 0x7D08)),
            VifRange::Manufacturer => Some((0x7D0A, 0x7D0A)),
            VifRange::ParameterSet => Some((0x7D0B, 0x7D0B)),
            VifRange::ModelVersion => Some((0x7D0C, 0x7D0C)),
            VifRange::HardwareVersion => Some((0x7D0D, 0x7D0D)),
            VifRange::FirmwareVersion => Some((0x7D0E, 0x7D0E)),
            VifRange::SoftwareVersion => Some((0x7D0F, 0x7D0F)),
            VifRange::Location => Some((0x7D10, 0x7D10)),
            VifRange::Customer => Some((0x7D11, 0x7D11)),
            VifRange::ErrorFlags => Some((0x7D17, 0x7D17)),
            VifRange::DigitalOutput => Some((0x7D1A, 0x7D1A)),
            VifRange::DigitalInput => Some((0x7D1B, 0x7D1B)),
            VifRange::DurationSinceReadout => Some((0x7D2C, 0x7D2F)),
            VifRange::DurationOfTariff => Some((0x7D31, 0x7D33)),
            VifRange::Dimensionless => Some((0x7D3A, 0x7D3A)),
            VifRange::Voltage => Some((0x7D40, 0x7D4F)),
            VifRange::Amperage => Some((0x7D50, 0x7D5F)),
            VifRange::ResetCounter => Some((0x7D60, 0x7D60)),
            VifRange::CumulationCounter => Some((0x7D61, 0x7D61)),
            VifRange::None
            | VifRange::Any
            | VifRange::AnyVolumeVif
            | VifRange::AnyEnergyVif
            | VifRange::AnyPowerVif => None,
        }
    }

    pub fn default_unit(&self) -> Unit {
        match self {
            VifRange::Volume | VifRange::AnyVolumeVif => Unit::M3,
            VifRange::OnTime
            | VifRange::OperatingTime
            | VifRange::ActualityDuration
            | VifRange::DurationSinceReadout
            | VifRange::DurationOfTariff => Unit::Hour,
            VifRange::VolumeFlow => Unit::M3h,
            VifRange::FlowTemperature
            | VifRange::ReturnTemperature
            | VifRange::ExternalTemperature => Unit::C,
            VifRange::TemperatureDifference => Unit::C,
            VifRange::Pressure => Unit::Bar,
            VifRange::HeatCostAllocation => Unit::Hca,
            VifRange::Date => Unit::DateLT,
            VifRange::DateTime => Unit::DateTimeLT,
            VifRange::EnergyMj => Unit::Mj,
            VifRange::EnergyWh | VifRange::EnergyMwh | VifRange::AnyEnergyVif => Unit::Kwh,
            VifRange::PowerW | VifRange::AnyPowerVif => Unit::Kw,
            VifRange::RelativeHumidity => Unit::Rh,
            VifRange::Voltage => Unit::Volt,
            VifRange::Amperage => Unit::Ampere,
            VifRange::AccessNumber
            | VifRange::Dimensionless
            | VifRange::ResetCounter
            | VifRange::CumulationCounter => Unit::Counter,
            _ => Unit::Txt,
        }
    }

    pub fn quantity(&self) -> Quantity {
        self.default_unit().quantity()
    }

    pub fn contains(&self, vif: u16) -> bool {
        match self {
            VifRange::Any => true,
            VifRange::None => false,
            VifRange::AnyVolumeVif => (0x10..=0x17).contains(&vif),
            VifRange::AnyEnergyVif => vif <= 0x0F || (0x7B00..=0x7B01).contains(&vif),
            VifRange::AnyPowerVif => (0x28..=0x2F).contains(&vif),
            _ => match self.bounds() {
                Some((from, to)) => (from..=to).contains(&vif),
                None => false,
            },
        }
    }
}

/// Per the telegram, the unit actually encoded by a vif.
pub fn vif_default_unit(vif: u16) -> Unit {
    match vif & 0x7F7F {
        0x00..=0x07 => Unit::Kwh,
        0x08..=0x0F => Unit::Mj,
        0x10..=0x17 => Unit::M3,
        0x18..=0x1F => Unit::Kg,
        0x20..=0x27 => Unit::Hour,
        0x28..=0x2F => Unit::Kw,
        0x30..=0x37 => Unit::Mj,
        0x38..=0x4F => Unit::M3h,
        0x50..=0x57 => Unit::KgH,
        0x58..=0x67 => Unit::C,
        0x68..=0x6B => Unit::Bar,
        0x6C => Unit::DateLT,
        0x6D => Unit::DateTimeLT,
        0x6E => Unit::Hca,
        0x7B00..=0x7B01 => Unit::Kwh,
        0x7B1A..=0x7B1B => Unit::Rh,
        0x7D40..=0x7D4F => Unit::Volt,
        0x7D50..=0x7D5F => Unit::Ampere,
        _ => Unit::Counter,
    }
}

/* Scale dividing a raw value into the canonical unit of its quantity
   (kWh, m³, m³/h, kg, bar, °C, hours). */
pub fn vif_scale(vif: u16) -> f64 {
    let v = vif & 0x7F7F;
    let n = (v & 0x7) as i32;
    match v {
        0x00..=0x07 => 10f64.powi(6 - n), // energy, canonical kWh
        0x08..=0x0F => 10f64.powi(6 - n), // energy, canonical MJ
        0x10..=0x17 => 10f64.powi(6 - n), // volume, canonical m³
        0x18..=0x1F => 10f64.powi(3 - n), // mass, canonical kg
        0x20..=0x23 | 0x24..=0x27 | 0x70..=0x77 => match v & 0x3 {
            0 => 3600.0, // seconds
            1 => 60.0,   // minutes
            2 => 1.0,    // hours
            _ => 1.0 / 24.0,
        },
        0x28..=0x2F => 10f64.powi(6 - n),          // power, canonical kW
        0x30..=0x37 => 10f64.powi(6 - n),          // power, canonical MJ/h
        0x38..=0x3F => 10f64.powi(6 - n),          // volume flow m³/h
        0x40..=0x47 => 10f64.powi(7 - n) / 60.0,   // volume flow ext m³/min
        0x48..=0x4F => 10f64.powi(9 - n) / 3600.0, // volume flow ext m³/s
        0x50..=0x57 => 10f64.powi(3 - n),          // mass flow kg/h
        0x58..=0x67 => 10f64.powi(3 - (v & 0x3) as i32), // temperatures, °C or K
        0x68..=0x6B => 10f64.powi(3 - (v & 0x3) as i32), // pressure, bar
        0x7B00..=0x7B01 => 10f64.powi(1 - (v & 0x1) as i32) / 1000.0, // MWh to kWh
        0x7B1A..=0x7B1B => 10f64.powi(1 - (v & 0x1) as i32), // relative humidity
        0x7D40..=0x7D4F => 10f64.powi(9 - (v & 0xF) as i32), // volt
        0x7D50..=0x7D5F => 10f64.powi(12 - (v & 0xF) as i32), // ampere
        _ => 1.0,
    }
}

/// Combinable (orthogonal) VIFEs. The raw code is always kept alongside;
/// codes without a name stay `Unknown` and match through the raw set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VifCombinable {
    Any,
    PerSecond,
    PerMinute,
    PerHour,
    PerDay,
    PerWeek,
    PerMonth,
    PerYear,
    AccumulationPositive,
    AccumulationNegative,
    UncorrectedUnit,
    Unknown,
}

pub fn to_vif_combinable(code: u16) -> VifCombinable {
    match code {
        0x20 => VifCombinable::PerSecond,
        0x21 => VifCombinable::PerMinute,
        0x22 => VifCombinable::PerHour,
        0x23 => VifCombinable::PerDay,
        0x24 => VifCombinable::PerWeek,
        0x25 => VifCombinable::PerMonth,
        0x26 => VifCombinable::PerYear,
        0x3A => VifCombinable::AccumulationPositive,
        0x3B => VifCombinable::AccumulationNegative,
        0x3E => VifCombinable::UncorrectedUnit,
        _ => VifCombinable::Unknown,
    }
}

/// A date or datetime decoded from type G (2 bytes), F (4) or I (6) data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DvDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub has_time: bool,
}

impl DvDate {
    pub fn date_string(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }

    pub fn datetime_string(&self) -> String {
        if !self.has_time {
            return self.date_string();
        }
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}

/// One decoded data record. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct DVEntry {
    pub offset: usize,
    pub dif_vif_key: String,
    pub measurement_type: MeasurementType,
    pub vif: u16,
    pub combinable_vifs: BTreeSet<VifCombinable>,
    pub combinable_vifs_raw: BTreeSet<u16>,
    pub storage_nr: u32,
    pub tariff_nr: u32,
    pub subunit_nr: u32,
    /// Raw data bytes as uppercase hex, wire order.
    pub value: String,
}

impl DVEntry {
    pub fn dif(&self) -> u8 {
        u8::from_str_radix(&self.dif_vif_key[0..2], 16).unwrap_or(0)
    }

    fn value_bytes(&self) -> Vec<u8> {
        hex::decode(&self.value).unwrap_or_default()
    }

    pub fn extract_double(&self, auto_scale: bool, force_unsigned: bool) -> Option<f64> {
        let t = self.dif() & 0xF;
        let v = self.value_bytes();
        let scale = if auto_scale { vif_scale(self.vif) } else { 1.0 };

        let raw: f64 = match t {
            0x1 | 0x2 | 0x3 | 0x4 | 0x6 | 0x7 => {
                let width = dif_len_bytes(self.dif()) as usize;
                if v.len() != width {
                    warn!(
                        "(dvparser) bad decode, difvif {} expected {} bytes but got {}",
                        self.dif_vif_key,
                        width,
                        v.len()
                    );
                    return None;
                }
                let mut raw: u64 = 0;
                for (i, b) in v.iter().enumerate() {
                    raw |= (*b as u64) << (8 * i);
                }
                let sign_bit = 1u64 << (width * 8 - 1);
                if !force_unsigned && raw & sign_bit != 0 && width < 8 {
                    let mask = !0u64 << (width * 8);
                    (mask | raw) as i64 as f64
                } else if !force_unsigned && width == 8 {
                    raw as i64 as f64
                } else {
                    raw as f64
                }
            }
            0x9 | 0xA | 0xB | 0xC | 0xE => {
                let width = dif_len_bytes(self.dif()) as usize;
                if v.len() != width {
                    return None;
                }
                if v.iter().all(|&b| b == 0xFF) {
                    return None; // all-F bcd is NaN
                }
                /* Negative bcd marks the top nibble of the most significant
                   byte with 0xF. */
                let mut bytes = v.clone();
                let last = bytes.len() - 1;
                let negate = (bytes[last] >> 4) == 0xF;
                if negate {
                    bytes[last] &= 0x0F;
                }
                let mut raw: u64 = 0;
                for b in bytes.iter().rev() {
                    let hi = (b >> 4) as u64;
                    let lo = (b & 0x0F) as u64;
                    if hi > 9 || lo > 9 {
                        return None;
                    }
                    raw = raw * 100 + hi * 10 + lo;
                }
                if negate {
                    -(raw as f64)
                } else {
                    raw as f64
                }
            }
            0x5 => {
                if v.len() != 4 {
                    return None;
                }
                f32::from_le_bytes([v[0], v[1], v[2], v[3]]) as f64
            }
            _ => return None,
        };

        Some(raw / scale)
    }

    pub fn extract_long(&self) -> Option<u64> {
        let t = self.dif() & 0xF;
        let v = self.value_bytes();
        match t {
            0x1 | 0x2 | 0x3 | 0x4 | 0x6 | 0x7 => {
                if v.is_empty() || v.len() > 8 {
                    return None;
                }
                let mut raw: u64 = 0;
                for (i, b) in v.iter().enumerate() {
                    raw |= (*b as u64) << (8 * i);
                }
                Some(raw)
            }
            0x9 | 0xA | 0xB | 0xC | 0xE => {
                let mut raw: u64 = 0;
                for b in v.iter().rev() {
                    let hi = (b >> 4) as u64;
                    let lo = (b & 0x0F) as u64;
                    if hi > 9 || lo > 9 {
                        return None;
                    }
                    raw = raw * 100 + hi * 10 + lo;
                }
                Some(raw)
            }
            _ => None,
        }
    }

    pub fn extract_date(&self) -> Option<DvDate> {
        let v = self.value_bytes();
        let decode_date = |hi: u8, lo: u8| -> (i32, u32, u32) {
            let day = (lo & 0x1F) as u32;
            let year1 = ((lo & 0xE0) >> 5) as i32;
            let month = (hi & 0x0F) as u32;
            let year2 = ((hi & 0xF0) >> 1) as i32;
            (2000 + year1 + year2, month, day)
        };
        let decode_time = |hi: u8, lo: u8| -> (u32, u32) { (((hi & 0x1F) as u32), ((lo & 0x3F) as u32)) };

        match v.len() {
            2 => {
                let (year, month, day) = decode_date(v[1], v[0]);
                if month > 12 {
                    return None;
                }
                Some(DvDate { year, month, day, hour: 0, minute: 0, second: 0, has_time: false })
            }
            4 => {
                let (year, month, day) = decode_date(v[3], v[2]);
                let (hour, minute) = decode_time(v[1], v[0]);
                if month > 12 || hour > 23 || minute > 59 {
                    return None;
                }
                Some(DvDate { year, month, day, hour, minute, second: 0, has_time: true })
            }
            6 => {
                let (year, month, day) = decode_date(v[4], v[3]);
                let (hour, minute) = decode_time(v[2], v[1]);
                let second = (v[0] & 0x3F) as u32;
                if month > 12 || hour > 23 || minute > 59 {
                    return None;
                }
                Some(DvDate { year, month, day, hour, minute, second, has_time: true })
            }
            _ => None,
        }
    }

    pub fn extract_readable_string(&self) -> Option<String> {
        let t = self.dif() & 0xF;
        let v = self.value_bytes();
        match t {
            0x1 | 0x2 | 0x3 | 0x4 | 0x6 | 0x7 | 0xD => {
                if is_likely_ascii(&v) {
                    Some(reverse_binary_ascii(&v))
                } else {
                    Some(reverse_bcd(&self.value))
                }
            }
            0x9 | 0xA | 0xB | 0xC | 0xE => Some(reverse_bcd(&self.value)),
            _ => Some(self.value.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterType {
    Storage,
    Tariff,
    Subunit,
}

impl DVEntry {
    pub fn counter(&self, c: CounterType) -> u32 {
        match c {
            CounterType::Storage => self.storage_nr,
            CounterType::Tariff => self.tariff_nr,
            CounterType::Subunit => self.subunit_nr,
        }
    }
}

lazy_static! {
    /* Process wide signature -> DIF/VIF skeleton cache, learned from full
       frames and consulted by compact frames. */
    static ref FORMAT_CACHE: Mutex<HashMap<u16, Vec<u8>>> = Mutex::new(HashMap::new());
}

pub fn remember_format(signature: u16, skeleton: &[u8]) {
    let mut cache = FORMAT_CACHE.lock().unwrap();
    if cache.len() < 1024 {
        cache.entry(signature).or_insert_with(|| {
            debug!(
                "(dvparser) found new format \"{}\" with hash {:04x}, remembering!",
                bin2hex(skeleton),
                signature
            );
            skeleton.to_vec()
        });
    }
}

pub fn lookup_format(signature: u16) -> Option<Vec<u8>> {
    FORMAT_CACHE.lock().unwrap().get(&signature).cloned()
}

/* Skeletons for signatures seen on meters whose long frames are rare.
   Mostly Multical 21 variants. */
pub fn known_format_signature(signature: u16) -> Option<Vec<u8>> {
    let hex = match signature {
        0xA8ED => "02FF2004134413615B6167",
        0xC412 => "02FF20041392013BA1015B8101E7FF0F",
        0x61EB => "02FF2004134413A1015B8101E7FF0F",
        0xD2F7 => "02FF2004134413615B5167",
        0xDD34 => "02FF2004134413",
        0x7C0E => "02FF200413523B",
        _ => return None,
    };
    Some(hex::decode(hex).unwrap())
}

/// Walk the records in `t.frame[data_start .. data_start+data_len]`.
/// `format` supplies the DIF/VIF skeleton for compact frames.
pub fn parse_dv(t: &mut Telegram, data_start: usize, data_len: usize, format: Option<&[u8]>) {
    let data_end = data_start + data_len.min(t.frame.len().saturating_sub(data_start));
    let inline = format.is_none();
    let skeleton: Vec<u8> = format.map(|f| f.to_vec()).unwrap_or_default();

    let mut dv_count: HashMap<String, u32> = HashMap::new();
    let mut format_bytes: Vec<u8> = Vec::new();
    let mut dpos = data_start;
    let mut fpos = 0usize;

    t.dv_entries.clear();

    /* Pull the next DIF/VIF chain byte from the data stream (inline) or
       from the skeleton (compact). */
    macro_rules! fmt_peek {
        () => {
            if inline {
                if dpos < data_end {
                    Some(t.frame[dpos])
                } else {
                    None
                }
            } else {
                skeleton.get(fpos).copied()
            }
        };
    }
    macro_rules! fmt_advance {
        ($id_bytes:expr, $b:expr, $len:expr, $text:expr) => {
            $id_bytes.push($b);
            if inline {
                format_bytes.push($b);
                t.note(&mut dpos, $len, KindOfData::Protocol, Understanding::Full, $text);
            } else {
                fpos += $len;
            }
        };
    }

    loop {
        let mut id_bytes: Vec<u8> = Vec::new();

        if fmt_peek!().is_none() {
            break;
        }

        if let Some(force) = t.force_mfct_index {
            /* Meters without a 0x0F marker, everything after this offset is
               manufacturer specific. */
            if dpos - data_start >= force {
                let len = data_end - dpos;
                let text = format!("manufacturer specific data {}", bin2hex(&t.frame[dpos..data_end]));
                t.note(&mut dpos, len, KindOfData::Content, Understanding::None, text);
                break;
            }
        }

        let dif = fmt_peek!().unwrap();
        let mt = dif_measurement_type(dif);
        let datalen = dif_len_bytes(dif);

        if datalen == -2 {
            let within = dpos - data_start;
            let len = data_end - dpos;
            let value = if len > 1 { bin2hex(&t.frame[dpos + 1..data_end]) } else { String::new() };
            t.mfct_0f_index = Some(within + 1);
            let (text, und) = match dif {
                0x0F => (format!("{:02X} manufacturer specific data {}", dif, value), Understanding::None),
                0x1F => (format!("{:02X} more data in next telegram {}", dif, value), Understanding::Full),
                _ => (
                    format!("{:02X} unknown dif treating remaining data as mfct specific {}", dif, value),
                    Understanding::None,
                ),
            };
            t.note(&mut dpos, len, KindOfData::Content, und, text);
            break;
        }
        if dif == 0x2F {
            if inline {
                t.note(&mut dpos, 1, KindOfData::Protocol, Understanding::Full, format!("{:02X} skip", dif));
            } else {
                fpos += 1;
            }
            continue;
        }
        let variable_length = datalen == -1;

        fmt_advance!(id_bytes, dif, 1, format!("{:02X} dif", dif));

        let mut difenr = 0u32;
        let mut subunit = 0u32;
        let mut tariff = 0u32;
        let mut storage_nr = ((dif & 0x40) >> 6) as u32;

        let mut has_another_dife = dif & 0x80 == 0x80;
        while has_another_dife {
            let dife = match fmt_peek!() {
                Some(b) => b,
                None => {
                    debug!("(dvparser) warning: unexpected end of data (dife expected)");
                    break;
                }
            };
            subunit |= (((dife & 0x40) >> 6) as u32) << difenr;
            tariff |= (((dife & 0x30) >> 4) as u32) << (difenr * 2);
            storage_nr |= ((dife & 0x0F) as u32) << (1 + difenr * 4);
            fmt_advance!(
                id_bytes,
                dife,
                1,
                format!("{:02X} dife (subunit={} tariff={} storagenr={})", dife, subunit, tariff, storage_nr)
            );
            has_another_dife = dife & 0x80 == 0x80;
            difenr += 1;
        }

        let vif = match fmt_peek!() {
            Some(b) => b,
            None => {
                debug!("(dvparser) warning: unexpected end of data (vif expected)");
                break;
            }
        };
        let mut full_vif: u16 = (vif & 0x7F) as u16;
        let mut extension_vif = false;

        fmt_advance!(id_bytes, vif, 1, format!("{:02X} vif", vif));

        /* Markers for the extended vif tables: first, second, third and
           manufacturer specific. */
        if vif == 0xFB || vif == 0xFD || vif == 0xEF || vif == 0xFF {
            full_vif <<= 8;
            extension_vif = true;
        }

        /* Text vif, length prefixed ascii unit. */
        if vif == 0x7C {
            if let Some(viflen) = fmt_peek!() {
                fmt_advance!(id_bytes, viflen, 1, format!("{:02X} viflen ({})", viflen, viflen));
                for _ in 0..viflen {
                    match fmt_peek!() {
                        Some(c) => {
                            fmt_advance!(id_bytes, c, 1, format!("{:02X} vif ({})", c, c as char));
                        }
                        None => break,
                    }
                }
            }
        }

        let mut combinable_full_vif: u16 = 0;
        let mut combinable_extension = false;
        let mut found_combinables: BTreeSet<VifCombinable> = BTreeSet::new();
        let mut found_combinables_raw: BTreeSet<u16> = BTreeSet::new();

        let mut has_another_vife = vif & 0x80 == 0x80;
        while has_another_vife {
            let vife = match fmt_peek!() {
                Some(b) => b,
                None => {
                    debug!("(dvparser) warning: unexpected end of data (vife expected)");
                    break;
                }
            };
            fmt_advance!(id_bytes, vife, 1, format!("{:02X} vife", vife));
            has_another_vife = vife & 0x80 == 0x80;

            if extension_vif {
                /* First vife after the extension marker completes the vif. */
                full_vif |= (vife & 0x7F) as u16;
                extension_vif = false;
            } else if combinable_extension {
                combinable_full_vif |= (vife & 0x7F) as u16;
                combinable_extension = false;
                found_combinables.insert(to_vif_combinable(combinable_full_vif));
                found_combinables_raw.insert(combinable_full_vif);
            } else {
                combinable_full_vif = (vife & 0x7F) as u16;
                if combinable_full_vif == 0x7C || combinable_full_vif == 0x7F {
                    /* Combinable sub extension, widened to 16 bits. */
                    combinable_full_vif <<= 8;
                    combinable_extension = true;
                } else {
                    found_combinables.insert(to_vif_combinable(combinable_full_vif));
                    found_combinables_raw.insert(combinable_full_vif);
                }
            }
        }

        let dv = bin2hex(&id_bytes);
        let count = dv_count.entry(dv.clone()).and_modify(|c| *c += 1).or_insert(1);
        let key = if *count > 1 { format!("{}_{}", dv, count) } else { dv };

        let remaining = data_end.saturating_sub(dpos);
        if remaining < 1 {
            debug!("(dvparser) warning: unexpected end of data");
            break;
        }

        let mut datalen = if variable_length {
            let lvar = t.frame[dpos];
            t.note(&mut dpos, 1, KindOfData::Protocol, Understanding::Full, format!("{:02X} varlen={}", lvar, lvar));
            lvar as usize
        } else {
            datalen as usize
        };

        let remaining = data_end.saturating_sub(dpos);
        if remaining < datalen {
            debug!("(dvparser) warning: unexpected end of data");
            datalen = remaining;
        }

        let value = bin2hex(&t.frame[dpos..dpos + datalen]);
        let offset = dpos;

        if !value.is_empty() {
            t.note(&mut dpos, datalen, KindOfData::Content, Understanding::None, value.clone());
        }

        t.dv_entries.insert(
            key.clone(),
            DVEntry {
                offset,
                dif_vif_key: key,
                measurement_type: mt,
                vif: full_vif,
                combinable_vifs: found_combinables,
                combinable_vifs_raw: found_combinables_raw,
                storage_nr,
                tariff_nr: tariff,
                subunit_nr: subunit,
                value,
            },
        );

        if dpos >= data_end {
            break;
        }
    }

    if inline && !format_bytes.is_empty() {
        let hash = crc16_en13757(&format_bytes);
        remember_format(hash, &format_bytes);
    }
}

/// Entries sorted by telegram offset, the order the telegram presented them.
pub fn sorted_entries(t: &Telegram) -> Vec<&DVEntry> {
    let mut entries: Vec<&DVEntry> = t.dv_entries.values().collect();
    entries.sort_by_key(|e| e.offset);
    entries
}

#[cfg(test)]
mod dvparser_tests {
    use super::*;
    use crate::telegram::{AboutTelegram, Telegram};

    fn telegram_with_records(hex_records: &str) -> Telegram {
        let mut t = Telegram::new(AboutTelegram::default());
        t.frame = hex::decode(hex_records).unwrap();
        let len = t.frame.len();
        parse_dv(&mut t, 0, len, None);
        t
    }

    #[test]
    fn iperl_style_records() {
        /* 32 bit volume in liters and a 16 bit flow. */
        let t = telegram_with_records("041389E20100023B0000");
        assert_eq!(t.dv_entries.len(), 2);

        let total = &t.dv_entries["0413"];
        assert_eq!(total.vif, 0x13);
        assert_eq!(total.storage_nr, 0);
        assert_eq!(total.extract_double(true, false), Some(123.529));

        let flow = &t.dv_entries["023B"];
        assert_eq!(flow.extract_double(true, false), Some(0.0));
    }

    #[test]
    fn offsets_strictly_increase() {
        let t = telegram_with_records("041389E20100023B00000C1427048502");
        let entries = sorted_entries(&t);
        for pair in entries.windows(2) {
            assert!(pair[0].offset < pair[1].offset);
        }
    }

    #[test]
    fn duplicate_keys_get_suffixes() {
        let t = telegram_with_records("02FF200000" .repeat(3).as_str());
        assert!(t.dv_entries.contains_key("02FF20"));
        assert!(t.dv_entries.contains_key("02FF20_2"));
        assert!(t.dv_entries.contains_key("02FF20_3"));
    }

    #[test]
    fn dife_unpacks_storage_tariff_subunit() {
        /* DIF 84 (32 bit, extension) DIFE 10 (tariff 1) VIF 13. */
        let t = telegram_with_records("841013D2040000");
        let e = t.dv_entries.values().next().unwrap();
        assert_eq!(e.tariff_nr, 1);
        assert_eq!(e.storage_nr, 0);
        assert_eq!(e.dif_vif_key, "841013");
    }

    #[test]
    fn storage_lsb_from_dif_and_dife_bits() {
        /* DIF C2 = 16 bit integer, storage lsb set, extension; DIFE 04 adds
           storage bits -> storage = 1 | (4<<1) = 9. */
        let t = telegram_with_records("C2046C7F2A");
        let e = t.dv_entries.values().next().unwrap();
        assert_eq!(e.storage_nr, 9);
        assert_eq!(e.measurement_type, MeasurementType::Instantaneous);
    }

    #[test]
    fn bcd_and_date_extraction() {
        /* 0C14 8 digit bcd volume 10⁻² m³, 046D type F datetime. */
        let t = telegram_with_records("0C1427048502046D32371F15");
        let vol = &t.dv_entries["0C14"];
        assert_eq!(vol.extract_double(true, false), Some(28504.27));

        let dt = t.dv_entries["046D"].extract_date().unwrap();
        assert_eq!(dt.datetime_string(), "2008-05-31 23:50");
    }

    #[test]
    fn negative_bcd_and_all_f() {
        let t = telegram_with_records("0A5A21F00A5CFFFF");
        let flow_temp = &t.dv_entries["0A5A"];
        /* F in the top nibble negates, scale 10⁻¹ °C. */
        assert_eq!(flow_temp.extract_double(true, false), Some(-2.1));
        assert_eq!(t.dv_entries["0A5C"].extract_double(true, false), None);
    }

    #[test]
    fn signed_integer_extraction() {
        let t = telegram_with_records("01FF21FF");
        let e = &t.dv_entries["01FF21"];
        assert_eq!(e.extract_double(false, false), Some(-1.0));
        assert_eq!(e.extract_double(false, true), Some(255.0));
    }

    #[test]
    fn variable_length_string() {
        /* 0D VIF FD 0x11 (customer) varlen 3 "ABC" reversed. */
        let t = telegram_with_records("0DFD1103434241");
        let e = &t.dv_entries["0DFD11"];
        assert_eq!(e.vif, 0x7D11);
        assert_eq!(e.extract_readable_string(), Some("ABC".to_string()));
    }

    #[test]
    fn compact_frame_uses_skeleton() {
        let skeleton = hex::decode("02FF2004134413").unwrap();
        let mut t = Telegram::new(AboutTelegram::default());
        /* Only data bytes: 2 + 4 + 4. */
        t.frame = hex::decode("110089E2010000000000").unwrap();
        let len = t.frame.len();
        parse_dv(&mut t, 0, len, Some(&skeleton));
        assert_eq!(t.dv_entries.len(), 3);
        assert_eq!(t.dv_entries["0413"].extract_double(true, false), Some(123.529));
        assert_eq!(t.dv_entries["02FF20"].extract_long(), Some(0x0011));
    }

    #[test]
    fn format_cache_learns_from_inline_frames() {
        let records = "02FF20110004138AE2010044132A000000";
        let t = telegram_with_records(records);
        assert_eq!(t.dv_entries.len(), 3);
        let skeleton = hex::decode("02FF2004134413").unwrap();
        let hash = crc16_en13757(&skeleton);
        assert_eq!(lookup_format(hash), Some(skeleton));
    }

    #[test]
    fn vif_scaling_examples() {
        assert_eq!(vif_scale(0x03), 1000.0); // Wh -> kWh
        assert_eq!(vif_scale(0x13), 1000.0); // l -> m³
        assert_eq!(vif_scale(0x16), 1.0); // m³
        assert_eq!(vif_scale(0x5B), 1.0); // °C
        assert_eq!(vif_scale(0x14), 100.0); // 10⁻² m³
    }
}
