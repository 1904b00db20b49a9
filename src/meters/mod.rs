//! Meter drivers and dispatch: the global driver registry, per-configured
//! meter state, field extraction, the formula pass and record rendering.

use std::collections::BTreeMap;
use std::sync::{Arc, Once, RwLock};

use chrono::{DateTime, Utc};
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{Map, Value};

use crate::dvparser::{self, DVEntry, VifRange};
use crate::link::{Frame, LinkModeSet};
use crate::telegram::{AboutTelegram, Address, MeterKeys, Telegram};
use crate::units::{convert, Quantity, Unit};
use crate::utils::{decode_tpl_status_standard_bits, join_status_strings, sort_status_string};

pub mod fields;

pub mod driver_bfw240radio;
pub mod driver_iperl;
pub mod driver_multical21;

use fields::{print_property, FieldInfo, Translate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterType {
    WaterMeter,
    GasMeter,
    ElectricityMeter,
    HeatMeter,
    HeatCostAllocationMeter,
    SmokeDetector,
    TempHygroMeter,
    UnknownMeter,
}

/// One (manufacturer, media, version) triple a driver claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverDetect {
    pub mfct: u16,
    pub media: u8,
    pub version: u8,
}

/// Hook for manufacturer specific decoding that plain field matchers
/// cannot express.
pub type ProcessContentHook = fn(meter: &mut Meter, t: &mut Telegram);

/// Registered once per driver, lives for the process lifetime.
pub struct DriverInfo {
    pub name: String,
    pub aliases: Vec<String>,
    pub meter_type: MeterType,
    pub link_modes: LinkModeSet,
    pub detect: Vec<DriverDetect>,
    pub default_fields: Vec<String>,
    pub force_mfct_index: Option<usize>,
    pub fields: Vec<FieldInfo>,
    pub process_content: Option<ProcessContentHook>,
    /// Translation of the three mfct bits in the tpl status byte.
    pub mfct_tpl_status_bits: Translate,
}

impl DriverInfo {
    pub fn detects(&self, mfct: u16, media: u8, version: u8) -> bool {
        self.detect
            .iter()
            .any(|d| d.mfct == mfct && d.media == media && d.version == version)
    }

    pub fn has_driver_name(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }
}

lazy_static! {
    static ref DRIVERS: RwLock<Vec<Arc<DriverInfo>>> = RwLock::new(Vec::new());
}

static INIT: Once = Once::new();

/// Register all built-in drivers. Explicit call from main, idempotent.
pub fn init_drivers() {
    INIT.call_once(|| {
        driver_iperl::register();
        driver_multical21::register();
        driver_bfw240radio::register();
    });
}

pub fn register_driver(di: DriverInfo) {
    let mut drivers = DRIVERS.write().unwrap();
    for existing in drivers.iter() {
        for d in &di.detect {
            if existing.detects(d.mfct, d.media, d.version) {
                /* Programmer error, fail at startup. */
                panic!(
                    "drivers {} and {} share the detection triple {:04x}/{:02x}/{:02x}",
                    existing.name, di.name, d.mfct, d.media, d.version
                );
            }
        }
        if existing.name == di.name {
            panic!("driver {} registered twice", di.name);
        }
    }
    debug!("registered driver {}", di.name);
    drivers.push(Arc::new(di));
}

pub fn lookup_driver(name: &str) -> Option<Arc<DriverInfo>> {
    DRIVERS.read().unwrap().iter().find(|d| d.has_driver_name(name)).cloned()
}

/// Names of all drivers whose detection triples accept this telegram.
pub fn detect_meter_drivers(mfct: u16, media: u8, version: u8) -> Vec<String> {
    DRIVERS
        .read()
        .unwrap()
        .iter()
        .filter(|d| d.detects(mfct, media, version))
        .map(|d| d.name.clone())
        .collect()
}

pub fn pick_meter_driver(t: &Telegram) -> Option<Arc<DriverInfo>> {
    let (mfct, media, version) = match t.addresses.first() {
        Some(a) => (a.mfct, a.device_type, a.version),
        None => return None,
    };
    DRIVERS.read().unwrap().iter().find(|d| d.detects(mfct, media, version)).cloned()
}

lazy_static! {
    static ref ADDRESS_EXPR_RE: Regex =
        Regex::new(r"^([0-9A-Fa-f\*]{1,8})((?:\.[MTV]=[0-9A-Za-z]+)*)$").unwrap();
}

/// `id[.M=xxx][.T=xx][.V=xx]` with `*` wildcards in the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressExpression {
    pub id: String,
    pub mfct: Option<u16>,
    pub media: Option<u8>,
    pub version: Option<u8>,
}

impl AddressExpression {
    pub fn parse(s: &str) -> Option<AddressExpression> {
        let caps = ADDRESS_EXPR_RE.captures(s)?;
        let id = caps.get(1)?.as_str().to_uppercase();
        if id.len() != 8 && id != "*" {
            return None;
        }
        let mut expr = AddressExpression { id, mfct: None, media: None, version: None };
        for part in caps.get(2).map(|m| m.as_str()).unwrap_or("").split('.') {
            if part.is_empty() {
                continue;
            }
            let (what, value) = part.split_at(2);
            match what {
                "M=" => {
                    expr.mfct = crate::utils::manufacturer_code(&value.to_uppercase())
                        .or_else(|| u16::from_str_radix(value, 16).ok());
                    expr.mfct?;
                }
                "T=" => expr.media = u8::from_str_radix(value, 16).ok(),
                "V=" => expr.version = u8::from_str_radix(value, 16).ok(),
                _ => return None,
            }
        }
        Some(expr)
    }

    pub fn matches(&self, a: &Address) -> bool {
        if self.id != "*" {
            if a.id.len() != 8 || self.id.len() != 8 {
                return false;
            }
            for (e, g) in self.id.chars().zip(a.id.to_uppercase().chars()) {
                if e != '*' && e != g {
                    return false;
                }
            }
        }
        if let Some(m) = self.mfct {
            if m != a.mfct {
                return false;
            }
        }
        if let Some(t) = self.media {
            if t != a.device_type {
                return false;
            }
        }
        if let Some(v) = self.version {
            if v != a.version {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
struct NumericValue {
    value: f64,
    unit: Unit,
    field_index: Option<usize>,
}

#[derive(Debug, Clone)]
struct StringValue {
    value: String,
    field_index: Option<usize>,
}

/// Rendered surfaces for one telegram.
#[derive(Debug, Clone)]
pub struct RenderedRecord {
    pub human_readable: String,
    pub fields: String,
    pub json: Value,
}

/// A live, configured meter instance.
pub struct Meter {
    pub name: String,
    pub driver: Arc<DriverInfo>,
    pub address_expressions: Vec<AddressExpression>,
    pub keys: MeterKeys,
    pub selected_fields: Vec<String>,
    pub extra_constant_fields: Vec<String>,
    extra_calculated_fields: Vec<FieldInfo>,

    /* Keyed by the final json field name (unit suffix included for
       numerics) so rendering stays deterministic. */
    numeric_values: BTreeMap<String, NumericValue>,
    string_values: BTreeMap<String, StringValue>,

    num_updates: u64,
    last_update: DateTime<Utc>,
    warned_driver_mismatch: bool,
    warned_failure: bool,
}

impl Meter {
    pub fn new(
        name: &str,
        driver: Arc<DriverInfo>,
        address_expressions: Vec<AddressExpression>,
        keys: MeterKeys,
    ) -> Meter {
        let selected_fields = driver.default_fields.clone();
        Meter {
            name: name.to_string(),
            driver,
            address_expressions,
            keys,
            selected_fields,
            extra_constant_fields: Vec::new(),
            extra_calculated_fields: Vec::new(),
            numeric_values: BTreeMap::new(),
            string_values: BTreeMap::new(),
            num_updates: 0,
            last_update: DateTime::<Utc>::UNIX_EPOCH,
            warned_driver_mismatch: false,
            warned_failure: false,
        }
    }

    pub fn set_selected_fields(&mut self, fields: Vec<String>) {
        if !fields.is_empty() {
            self.selected_fields = fields;
        }
    }

    pub fn add_calculated_field(&mut self, spec: &str) {
        /* "approx_gallons = total_m3 * 264.172" */
        if let Some((name, formula)) = spec.split_once('=') {
            self.extra_calculated_fields.push(FieldInfo::calculated(
                name.trim(),
                Quantity::Counter,
                Unit::Counter,
                formula.trim(),
            ));
        }
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    /// True when any address expression accepts the DLL (or TPL) address.
    pub fn matches_telegram(&self, t: &Telegram) -> bool {
        self.address_expressions
            .iter()
            .any(|e| t.addresses.iter().any(|a| e.matches(a)))
    }

    /// The driver's translation of the tpl status byte, standard bits plus
    /// the three manufacturer bits.
    pub fn decode_tpl_status(&self, sts: u8) -> String {
        let standard = decode_tpl_status_standard_bits(sts);
        let mfct_bits = (sts & 0xE0) as u64;
        let mfct = if mfct_bits != 0 {
            if self.driver.mfct_tpl_status_bits.has_rules() {
                self.driver.mfct_tpl_status_bits.translate(mfct_bits)
            } else {
                format!("UNKNOWN_{:02X}", mfct_bits)
            }
        } else {
            "OK".to_string()
        };
        join_status_strings(&standard, &mfct)
    }

    pub fn set_numeric_value(&mut self, name: &str, unit: Unit, value: f64) {
        let field_index = self.driver.fields.iter().position(|f| f.name == name);
        let key = match field_index {
            Some(i) => self.driver.fields[i].field_name_with_unit(None),
            None => format!("{}_{}", name, unit.suffix()),
        };
        self.numeric_values.insert(key, NumericValue { value, unit, field_index });
    }

    pub fn set_string_value(&mut self, name: &str, value: &str) {
        let field_index = self.driver.fields.iter().position(|f| f.name == name);
        self.string_values
            .insert(name.to_string(), StringValue { value: value.to_string(), field_index });
    }

    pub fn get_numeric_value(&self, json_key: &str) -> Option<f64> {
        self.numeric_values.get(json_key).map(|nv| nv.value)
    }

    pub fn get_numeric_value_in(&self, json_key: &str, unit: Unit) -> Option<f64> {
        self.numeric_values.get(json_key).map(|nv| convert(nv.value, nv.unit, unit))
    }

    pub fn timestamp_last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn get_string_value(&self, name: &str) -> Option<&str> {
        self.string_values.get(name).map(|sv| sv.value.as_str())
    }

    /// Full parse of a frame this meter already matched, then extraction,
    /// calculation and bookkeeping. `simulated` marks replayed frames that
    /// may already be decrypted. Returns the telegram for rendering.
    pub fn handle_telegram(
        &mut self,
        about: AboutTelegram,
        frame_data: &[u8],
        simulated: bool,
    ) -> Option<Telegram> {
        let mut t = Telegram::new(about);
        t.force_mfct_index = self.driver.force_mfct_index;
        if simulated {
            t.mark_as_simulated();
        }

        match t.parse(frame_data, &self.keys, !self.warned_failure) {
            Ok(_) => {}
            Err(e) => {
                if !self.warned_failure {
                    warn!("(meter) {}: telegram could not be parsed: {}", self.name, e);
                    self.warned_failure = true;
                }
                return None;
            }
        }

        if let Some(a) = t.addresses.first() {
            if !self.driver.detects(a.mfct, a.device_type, a.version)
                && !self.warned_driver_mismatch
            {
                warn!(
                    "(meter) {}: driver {} does not match telegram {:04x}/{:02x}/{:02x}, parsing anyway",
                    self.name, self.driver.name, a.mfct, a.device_type, a.version
                );
                self.warned_driver_mismatch = true;
            }
        }

        t.handled = true;

        if t.decryption_failed && !self.warned_failure {
            warn!(
                "(meter) {}: decryption failed, wrong key? rendering header only",
                self.name
            );
            self.warned_failure = true;
        }

        if let Some(hook) = self.driver.process_content {
            hook(self, &mut t);
        }

        self.process_field_extractors(&t);
        self.process_field_calculators();

        self.num_updates += 1;
        self.last_update = t.about.timestamp;
        Some(t)
    }

    /* Walk every field info against the telegram entries in offset order,
       honoring index-nr and multi-register matchers. */
    fn process_field_extractors(&mut self, t: &Telegram) {
        let driver = self.driver.clone();
        let entries: Vec<DVEntry> = dvparser::sorted_entries(t).into_iter().cloned().collect();

        for (idx, fi) in driver.fields.iter().enumerate() {
            if !fi.has_matcher() {
                continue;
            }
            let mut current_match_nr = 0u32;
            let mut matched = false;
            for dve in &entries {
                if !fi.matcher.matches(dve) {
                    continue;
                }
                current_match_nr += 1;
                if fi.matcher.index_nr != current_match_nr && !fi.matcher.expects_multiple_matches()
                {
                    /* Matched, but the driver asked for another occurrence. */
                    continue;
                }
                if matched && !fi.matcher.expects_multiple_matches() {
                    continue;
                }
                debug!(
                    "(meter) {} field {} extracts {} at offset {}",
                    self.name, fi.name, dve.dif_vif_key, dve.offset
                );
                self.extract_field(idx, fi, t, Some(dve));
                matched = true;
            }
            if !matched && fi.print_properties.has(print_property::INCLUDE_TPL_STATUS) {
                /* Status fields capture the tpl status even with no entry. */
                self.extract_field(idx, fi, t, None);
            }
        }

        for (idx, fi) in driver.fields.iter().enumerate() {
            if !fi.has_matcher()
                && !fi.has_formula()
                && fi.print_properties.has(print_property::INCLUDE_TPL_STATUS)
            {
                self.extract_field(idx, fi, t, None);
            }
        }
    }

    fn extract_field(&mut self, idx: usize, fi: &FieldInfo, t: &Telegram, dve: Option<&DVEntry>) {
        if fi.quantity == Quantity::Text || fi.quantity == Quantity::PointInTime {
            self.extract_string_field(idx, fi, t, dve);
        } else {
            self.extract_numeric_field(idx, fi, dve);
        }
    }

    fn extract_numeric_field(&mut self, idx: usize, fi: &FieldInfo, dve: Option<&DVEntry>) {
        let dve = match dve {
            Some(d) => d,
            None => return,
        };
        let value = match dve.extract_double(fi.vif_scaling.auto(), fi.vif_scaling.force_unsigned())
        {
            Some(v) => v,
            None => return,
        };

        /* The canonical unit the vif scaling normalized into. */
        let decoded_unit = match fi.matcher.vif_range {
            Some(VifRange::AnyVolumeVif) | Some(VifRange::AnyEnergyVif) | Some(VifRange::AnyPowerVif) => {
                dvparser::vif_default_unit(dve.vif)
            }
            Some(range) if range != VifRange::Any && range != VifRange::None => range.default_unit(),
            _ => fi.display_unit,
        };

        let mut value = value;
        if fi.scale != 1.0 {
            value *= fi.scale;
        }
        let value = convert(value, decoded_unit, fi.display_unit);

        let key = fi.field_name_with_unit(Some(dve));
        self.numeric_values
            .insert(key, NumericValue { value, unit: fi.display_unit, field_index: Some(idx) });
    }

    fn extract_string_field(&mut self, idx: usize, fi: &FieldInfo, t: &Telegram, dve: Option<&DVEntry>) {
        let include_tpl = fi.print_properties.has(print_property::INCLUDE_TPL_STATUS);
        let name = fi.field_name(dve);

        let value = if fi.lookup.has_rules() || include_tpl {
            let mut translated = String::new();
            let mut found = false;
            if fi.lookup.has_rules() {
                if let Some(dve) = dve {
                    if let Some(bits) = dve.extract_long() {
                        translated = fi.lookup.translate(bits);
                        found = true;
                    }
                }
            }
            if include_tpl {
                let sts = self.decode_tpl_status(t.tpl_sts);
                translated = join_status_strings(&translated, &sts);
                found = true;
            }
            if !found {
                return;
            }
            translated
        } else {
            let dve = match dve {
                Some(d) => d,
                None => return,
            };
            match fi.matcher.vif_range {
                Some(VifRange::DateTime) => match dve.extract_date() {
                    Some(d) => d.datetime_string(),
                    None => return,
                },
                Some(VifRange::Date) => match dve.extract_date() {
                    Some(d) => d.date_string(),
                    None => return,
                },
                _ => match dve.extract_readable_string() {
                    Some(s) => s,
                    None => return,
                },
            }
        };

        self.string_values.insert(name, StringValue { value, field_index: Some(idx) });
    }

    /* Formulas run after extraction, in declared order, over a context of
       everything extracted so far. A forward reference fails its eval and
       is reported, which is how cycles surface. */
    fn process_field_calculators(&mut self) {
        let driver = self.driver.clone();
        let mut context = HashMapContext::<DefaultNumericTypes>::new();
        for (key, nv) in &self.numeric_values {
            let _ = context.set_value(key.clone(), evalexpr::Value::Float(nv.value));
        }

        let driver_formulas: Vec<(Option<usize>, FieldInfo)> = driver
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.has_formula() && !f.has_matcher())
            .map(|(i, f)| (Some(i), f.clone()))
            .collect();
        let extra: Vec<(Option<usize>, FieldInfo)> =
            self.extra_calculated_fields.iter().map(|f| (None, f.clone())).collect();

        for (idx, fi) in driver_formulas.into_iter().chain(extra) {
            let formula = fi.formula.as_deref().unwrap_or("");
            match evalexpr::eval_float_with_context(formula, &context) {
                Ok(v) => {
                    /* Driver formulas carry a display unit, config level
                       calculated fields keep their bare name. */
                    let key = match idx {
                        Some(_) => fi.field_name_with_unit(None),
                        None => fi.field_name(None),
                    };
                    let _ = context.set_value(key.clone(), evalexpr::Value::Float(v));
                    self.numeric_values
                        .insert(key, NumericValue { value: v, unit: fi.display_unit, field_index: idx });
                }
                Err(e) => {
                    debug!("(meter) {} failed to evaluate formula for {}: {}", self.name, fi.name, e);
                }
            }
        }
    }

    /* The canonical status string: the STATUS field joined with every
       INJECT_INTO_STATUS field, deduplicated and sorted. */
    fn status_field_value(&self, fi_index: Option<usize>) -> String {
        let mut value = match fi_index
            .and_then(|i| self.driver.fields.get(i))
            .and_then(|fi| self.string_values.get(&fi.field_name(None)))
        {
            Some(sv) => sv.value.clone(),
            None => String::new(),
        };
        for (i, fi) in self.driver.fields.iter().enumerate() {
            if Some(i) == fi_index {
                continue;
            }
            if fi.print_properties.has(print_property::INJECT_INTO_STATUS) {
                if let Some(sv) = self.string_values.get(&fi.field_name(None)) {
                    value = join_status_strings(&value, &sv.value);
                }
            }
        }
        sort_status_string(&value)
    }

    fn field_hidden(&self, field_index: Option<usize>) -> bool {
        field_index
            .and_then(|i| self.driver.fields.get(i))
            .map(|fi| fi.print_properties.has(print_property::HIDE))
            .unwrap_or(false)
    }

    /// Render the three output surfaces for one handled telegram.
    pub fn render(&self, t: &Telegram, separator: char) -> RenderedRecord {
        let mut json = Map::new();
        json.insert("media".to_string(), Value::from(t.media()));
        json.insert("meter".to_string(), Value::from(self.driver.name.clone()));
        json.insert("name".to_string(), Value::from(self.name.clone()));
        json.insert("id".to_string(), Value::from(t.id().to_lowercase()));

        for (key, nv) in &self.numeric_values {
            if self.field_hidden(nv.field_index) {
                continue;
            }
            json.insert(key.clone(), Value::from(nv.value));
        }

        for (name, sv) in &self.string_values {
            let props = sv
                .field_index
                .and_then(|i| self.driver.fields.get(i))
                .map(|fi| fi.print_properties)
                .unwrap_or_default();
            if props.has(print_property::HIDE) || props.has(print_property::INJECT_INTO_STATUS) {
                continue;
            }
            if props.has(print_property::STATUS) {
                json.insert(name.clone(), Value::from(self.status_field_value(sv.field_index)));
            } else if sv.value == "null" {
                /* The literal sentinel renders as real json null. */
                json.insert(name.clone(), Value::Null);
            } else {
                json.insert(name.clone(), Value::from(sv.value.clone()));
            }
        }

        json.insert(
            "timestamp".to_string(),
            Value::from(t.about.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );

        if !t.about.device.is_empty() {
            json.insert("device".to_string(), Value::from(t.about.device.clone()));
            json.insert("rssi_dbm".to_string(), Value::from(t.about.rssi_dbm));
        }

        for extra in &self.extra_constant_fields {
            if let Some((k, v)) = extra.split_once('=') {
                json.insert(k.trim().to_string(), Value::from(v.trim().to_string()));
            }
        }

        let human_readable = self.concat_fields(t, '\t');
        let fields_line = self.concat_fields(t, separator);

        RenderedRecord { human_readable, fields: fields_line, json: Value::Object(json) }
    }

    fn concat_fields(&self, t: &Telegram, separator: char) -> String {
        let mut out: Vec<String> = Vec::new();
        for field in &self.selected_fields {
            let v = match field.as_str() {
                "name" => self.name.clone(),
                "id" => t.id().to_lowercase(),
                "timestamp" => t.about.timestamp.format("%Y-%m-%d %H:%M.%S").to_string(),
                key => {
                    if let Some(nv) = self.numeric_values.get(key) {
                        format_number(nv.value)
                    } else if let Some(sv) = self.string_values.get(key) {
                        sv.value.clone()
                    } else {
                        "null".to_string()
                    }
                }
            };
            out.push(v);
        }
        out.join(&separator.to_string())
    }
}

/* Trim trailing zeros the way %g does, the human line is for eyes. */
fn format_number(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// All configured meters plus the routing of incoming frames.
pub struct MeterManager {
    pub meters: Vec<Meter>,
    pub separator: char,
}

impl MeterManager {
    pub fn new(separator: char) -> MeterManager {
        MeterManager { meters: Vec::new(), separator }
    }

    pub fn add_meter(&mut self, meter: Meter) {
        self.meters.push(meter);
    }

    /// Route one link-layer frame to every matching meter. Returns the
    /// rendered records, one per meter that handled the telegram.
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        about: AboutTelegram,
        simulated: bool,
    ) -> Vec<RenderedRecord> {
        let mut header = Telegram::new(AboutTelegram::default());
        if header.parse_header(&frame.data).is_err() {
            debug!("frame too mangled to read its header, dropping");
            return Vec::new();
        }

        let mut records = Vec::new();
        for meter in &mut self.meters {
            if !meter.matches_telegram(&header) {
                continue;
            }
            if let Some(t) = meter.handle_telegram(about.clone(), &frame.data, simulated) {
                records.push(meter.render(&t, self.separator));
            }
        }

        if records.is_empty() {
            let candidates = detect_meter_drivers(
                header.dll_mfct,
                header.dll_type,
                header.dll_version,
            );
            if candidates.is_empty() {
                info!(
                    "telegram from {} not handled, no driver matches mfct {:04x} media {:02x} version {:02x}",
                    header.id(),
                    header.dll_mfct,
                    header.dll_type,
                    header.dll_version
                );
            } else {
                info!(
                    "telegram from {} not handled by any configured meter, could be decoded by: {}",
                    header.id(),
                    candidates.join(", ")
                );
            }
        }

        records
    }
}

#[cfg(test)]
mod meters_tests {
    use super::*;

    #[test]
    fn address_expression_parsing_and_wildcards() {
        let e = AddressExpression::parse("12345678").unwrap();
        let a = Address { id: "12345678".to_string(), mfct: 0x1593, version: 0x33, device_type: 0x03 };
        assert!(e.matches(&a));

        let e = AddressExpression::parse("1234****").unwrap();
        let a1 = Address { id: "12340001".to_string(), mfct: 0, version: 0, device_type: 0 };
        let a2 = Address { id: "12349999".to_string(), mfct: 0, version: 0, device_type: 0 };
        let b = Address { id: "22340001".to_string(), mfct: 0, version: 0, device_type: 0 };
        assert!(e.matches(&a1));
        assert!(e.matches(&a2));
        assert!(!e.matches(&b));

        let e = AddressExpression::parse("12345678.M=ELS.T=07.V=01").unwrap();
        assert_eq!(e.mfct, Some(0x1593));
        assert_eq!(e.media, Some(0x07));
        assert_eq!(e.version, Some(0x01));

        let any = AddressExpression::parse("*").unwrap();
        assert!(any.matches(&a1));

        assert!(AddressExpression::parse("123").is_none());
        assert!(AddressExpression::parse("1234567890").is_none());
    }

    #[test]
    fn status_string_is_sorted_and_deduplicated() {
        init_drivers();
        let driver = lookup_driver("multical21").unwrap();
        let mut meter = Meter::new(
            "test",
            driver,
            vec![AddressExpression::parse("*").unwrap()],
            MeterKeys::default(),
        );
        meter.set_string_value("current_status", "LEAK DRY LEAK");
        let idx = meter.string_values.get("current_status").and_then(|s| s.field_index);
        assert_eq!(meter.status_field_value(idx), "DRY LEAK");
    }

    #[test]
    fn format_number_trims() {
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(123.529), "123.529");
        assert_eq!(format_number(904.0), "904");
    }

    /* Whole pipeline: mode C wire bytes through the link layer, mode 5
       decryption, extraction and rendering. */
    #[test]
    fn end_to_end_mode_c_with_mode5_decryption() {
        init_drivers();
        let driver = lookup_driver("multical21").unwrap();
        let meter = Meter::new(
            "basement",
            driver,
            vec![AddressExpression::parse("12345678").unwrap()],
            MeterKeys::from_hex("0102030405060708090A0B0C0D0E0F11").unwrap(),
        );
        let mut manager = MeterManager::new(';');
        manager.add_meter(meter);

        let mut wire = vec![crate::link::MODE_C_PREAMBLE, crate::link::BLOCK_A_PREAMBLE];
        wire.extend(
            hex::decode(
                "2E44931578563412330333637A2A0020255923C95AAA26D1B2E7493BC2AD013EC4A6F6D3529B520EDFF0EA6DEFC955B29D6D69EBF3EC8A",
            )
            .unwrap(),
        );
        let frame = crate::link::decode(wire, -66).unwrap();

        let about = AboutTelegram { device: "sx1262".to_string(), rssi_dbm: -66, ..Default::default() };
        let records = manager.handle_frame(&frame, about, false);
        assert_eq!(records.len(), 1);

        let json = records[0].json.as_object().unwrap();
        assert_eq!(json["media"], "gas");
        assert_eq!(json["id"], "12345678");
        assert_eq!(json["total_m3"], 28504.27);
        assert_eq!(json["current_status"], "OK");
        assert_eq!(json["device"], "sx1262");
        assert_eq!(json["rssi_dbm"], -66);
    }
}
