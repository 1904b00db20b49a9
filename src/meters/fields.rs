//! Driver declared output fields: the matcher predicate over decoded
//! records, extraction into the meter value maps, bit translation tables
//! and the tiny parsed name template.

use std::collections::BTreeSet;

use crate::dvparser::{CounterType, DVEntry, MeasurementType, VifCombinable, VifRange};
use crate::units::Unit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VifScaling {
    None,
    Auto,
    NoneSigned,
    AutoSigned,
}

impl VifScaling {
    pub fn auto(&self) -> bool {
        matches!(self, VifScaling::Auto | VifScaling::AutoSigned)
    }

    /* The *Signed variants override the dif default signedness for meters
       that encode unsigned values in signed-looking widths. */
    pub fn force_unsigned(&self) -> bool {
        matches!(self, VifScaling::NoneSigned | VifScaling::AutoSigned)
    }
}

pub mod print_property {
    pub const REQUIRED: u32 = 1;
    pub const DEPRECATED: u32 = 2;
    pub const STATUS: u32 = 4;
    pub const INCLUDE_TPL_STATUS: u32 = 8;
    pub const INJECT_INTO_STATUS: u32 = 16;
    pub const HIDE: u32 = 32;
    pub const DEFAULT: u32 = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrintProperties(pub u32);

impl PrintProperties {
    pub fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// One bit pattern to human readable token, e.g. 0x20 -> DRY.
#[derive(Debug, Clone)]
pub struct TranslateRule {
    pub mask: u64,
    pub bits: u64,
    pub label: String,
}

/// Bits to label translation declared by drivers for status style fields.
#[derive(Debug, Clone, Default)]
pub struct Translate {
    pub rules: Vec<TranslateRule>,
}

impl Translate {
    pub fn new() -> Translate {
        Translate::default()
    }

    pub fn rule(mut self, mask: u64, bits: u64, label: &str) -> Translate {
        self.rules.push(TranslateRule { mask, bits, label: label.to_string() });
        self
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn translate(&self, value: u64) -> String {
        let mut tokens: Vec<&str> = Vec::new();
        for r in &self.rules {
            if value & r.mask == r.bits && (r.bits != 0 || r.mask == !0) {
                tokens.push(&r.label);
            }
        }
        if tokens.is_empty() {
            return "OK".to_string();
        }
        tokens.join(" ")
    }
}

/// Predicate over DVEntries. All enabled clauses must pass. A matcher with
/// no declared combinables rejects entries that carry any.
#[derive(Debug, Clone)]
pub struct FieldMatcher {
    pub active: bool,
    pub dif_vif_key: Option<String>,
    pub measurement_type: Option<MeasurementType>,
    pub vif_range: Option<VifRange>,
    pub vif_raw: Option<u16>,
    pub vif_combinables: BTreeSet<VifCombinable>,
    pub vif_combinables_raw: BTreeSet<u16>,
    pub storage_nr: Option<(u32, u32)>,
    pub tariff_nr: Option<(u32, u32)>,
    pub subunit_nr: Option<(u32, u32)>,
    /// 1-based occurrence of this match to consume.
    pub index_nr: u32,
}

impl Default for FieldMatcher {
    fn default() -> Self {
        FieldMatcher {
            active: true,
            dif_vif_key: None,
            measurement_type: None,
            vif_range: None,
            vif_raw: None,
            vif_combinables: BTreeSet::new(),
            vif_combinables_raw: BTreeSet::new(),
            /* Unless a driver says otherwise only the base registers match. */
            storage_nr: Some((0, 0)),
            tariff_nr: Some((0, 0)),
            subunit_nr: Some((0, 0)),
            index_nr: 1,
        }
    }
}

impl FieldMatcher {
    pub fn build() -> FieldMatcher {
        FieldMatcher::default()
    }

    pub fn none() -> FieldMatcher {
        FieldMatcher { active: false, ..FieldMatcher::default() }
    }

    pub fn key(mut self, k: &str) -> FieldMatcher {
        self.dif_vif_key = Some(k.to_string());
        self
    }

    pub fn mtype(mut self, mt: MeasurementType) -> FieldMatcher {
        self.measurement_type = if mt == MeasurementType::Any { None } else { Some(mt) };
        self
    }

    pub fn vif(mut self, v: VifRange) -> FieldMatcher {
        self.vif_range = if v == VifRange::Any { None } else { Some(v) };
        self
    }

    pub fn vif_raw(mut self, v: u16) -> FieldMatcher {
        self.vif_raw = Some(v);
        self
    }

    pub fn add_combinable(mut self, c: VifCombinable) -> FieldMatcher {
        self.vif_combinables.insert(c);
        self
    }

    pub fn add_combinable_raw(mut self, c: u16) -> FieldMatcher {
        self.vif_combinables_raw.insert(c);
        self
    }

    pub fn storage(mut self, nr: u32) -> FieldMatcher {
        self.storage_nr = Some((nr, nr));
        self
    }

    pub fn storage_range(mut self, from: u32, to: u32) -> FieldMatcher {
        self.storage_nr = Some((from, to));
        self
    }

    pub fn any_storage(mut self) -> FieldMatcher {
        self.storage_nr = None;
        self
    }

    pub fn tariff(mut self, nr: u32) -> FieldMatcher {
        self.tariff_nr = Some((nr, nr));
        self
    }

    pub fn tariff_range(mut self, from: u32, to: u32) -> FieldMatcher {
        self.tariff_nr = Some((from, to));
        self
    }

    pub fn subunit(mut self, nr: u32) -> FieldMatcher {
        self.subunit_nr = Some((nr, nr));
        self
    }

    pub fn index(mut self, nr: u32) -> FieldMatcher {
        self.index_nr = nr;
        self
    }

    /// True when the storage/tariff/subunit clauses span more than one
    /// register, so the matcher consumes every occurrence.
    pub fn expects_multiple_matches(&self) -> bool {
        let spans = |r: &Option<(u32, u32)>| matches!(r, Some((a, b)) if a != b);
        spans(&self.storage_nr) || spans(&self.tariff_nr) || spans(&self.subunit_nr)
    }

    pub fn matches(&self, dve: &DVEntry) -> bool {
        if !self.active {
            return false;
        }
        if let Some(key) = &self.dif_vif_key {
            return &dve.dif_vif_key == key;
        }

        if let Some(range) = self.vif_range {
            if !range.contains(dve.vif) {
                return false;
            }
        }
        if let Some(raw) = self.vif_raw {
            if dve.vif != raw {
                return false;
            }
        }
        if let Some(mt) = self.measurement_type {
            if dve.measurement_type != mt {
                return false;
            }
        }
        let in_range = |r: &Option<(u32, u32)>, v: u32| match r {
            Some((from, to)) => (*from..=*to).contains(&v),
            None => true,
        };
        if !in_range(&self.storage_nr, dve.storage_nr)
            || !in_range(&self.tariff_nr, dve.tariff_nr)
            || !in_range(&self.subunit_nr, dve.subunit_nr)
        {
            return false;
        }

        /* Combinables are never implicit. */
        if self.vif_combinables.is_empty() && self.vif_combinables_raw.is_empty() {
            return dve.combinable_vifs.is_empty() && dve.combinable_vifs_raw.is_empty();
        }
        for c in &self.vif_combinables_raw {
            if !dve.combinable_vifs_raw.contains(c) {
                return false;
            }
        }
        let any = self.vif_combinables.contains(&VifCombinable::Any);
        for c in &self.vif_combinables {
            if *c != VifCombinable::Any && !dve.combinable_vifs.contains(c) {
                return false;
            }
        }
        if !any {
            /* Extra combinables on the entry must be explicitly requested. */
            for c in &dve.combinable_vifs_raw {
                if !self.vif_combinables_raw.contains(c)
                    && !self.vif_combinables.contains(&crate::dvparser::to_vif_combinable(*c))
                {
                    return false;
                }
            }
        }
        true
    }
}

/// A parsed field name template: literal pieces and counter variables,
/// built once at driver registration.
#[derive(Debug, Clone)]
enum TemplatePart {
    Lit(String),
    Var(CounterType),
}

#[derive(Debug, Clone)]
pub struct NameTemplate {
    parts: Vec<TemplatePart>,
}

impl NameTemplate {
    pub fn parse(name: &str) -> NameTemplate {
        let mut parts = Vec::new();
        let mut rest = name;
        while let Some(start) = rest.find('{') {
            if start > 0 {
                parts.push(TemplatePart::Lit(rest[..start].to_string()));
            }
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    let var = &after[..end];
                    let part = match var {
                        "storage_counter" => TemplatePart::Var(CounterType::Storage),
                        "tariff_counter" => TemplatePart::Var(CounterType::Tariff),
                        "subunit_counter" => TemplatePart::Var(CounterType::Subunit),
                        other => TemplatePart::Lit(other.to_string()),
                    };
                    parts.push(part);
                    rest = &after[end + 1..];
                }
                None => {
                    parts.push(TemplatePart::Lit(rest.to_string()));
                    rest = "";
                }
            }
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Lit(rest.to_string()));
        }
        NameTemplate { parts }
    }

    pub fn expand(&self, dve: Option<&DVEntry>) -> String {
        let mut out = String::new();
        for p in &self.parts {
            match p {
                TemplatePart::Lit(s) => out.push_str(s),
                TemplatePart::Var(c) => match dve {
                    Some(dve) => out.push_str(&dve.counter(*c).to_string()),
                    None => {}
                },
            }
        }
        out
    }
}

/// One driver declared output field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    template: NameTemplate,
    pub quantity: crate::units::Quantity,
    pub display_unit: Unit,
    pub vif_scaling: VifScaling,
    /// Hardcoded factor for mfct values without a vif unit.
    pub scale: f64,
    pub matcher: FieldMatcher,
    pub help: String,
    pub print_properties: PrintProperties,
    pub lookup: Translate,
    pub formula: Option<String>,
}

impl FieldInfo {
    pub fn numeric(name: &str, quantity: crate::units::Quantity, display_unit: Unit, matcher: FieldMatcher) -> FieldInfo {
        FieldInfo {
            name: name.to_string(),
            template: NameTemplate::parse(name),
            quantity,
            display_unit,
            vif_scaling: VifScaling::Auto,
            scale: 1.0,
            matcher,
            help: String::new(),
            print_properties: PrintProperties(print_property::DEFAULT),
            lookup: Translate::new(),
            formula: None,
        }
    }

    pub fn text(name: &str, matcher: FieldMatcher) -> FieldInfo {
        FieldInfo {
            name: name.to_string(),
            template: NameTemplate::parse(name),
            quantity: crate::units::Quantity::Text,
            display_unit: Unit::Txt,
            vif_scaling: VifScaling::None,
            scale: 1.0,
            matcher,
            help: String::new(),
            print_properties: PrintProperties(print_property::DEFAULT),
            lookup: Translate::new(),
            formula: None,
        }
    }

    pub fn calculated(name: &str, quantity: crate::units::Quantity, display_unit: Unit, formula: &str) -> FieldInfo {
        FieldInfo {
            name: name.to_string(),
            template: NameTemplate::parse(name),
            quantity,
            display_unit,
            vif_scaling: VifScaling::None,
            scale: 1.0,
            matcher: FieldMatcher::none(),
            help: String::new(),
            print_properties: PrintProperties(print_property::DEFAULT),
            lookup: Translate::new(),
            formula: Some(formula.to_string()),
        }
    }

    pub fn with_scaling(mut self, s: VifScaling) -> FieldInfo {
        self.vif_scaling = s;
        self
    }

    pub fn with_scale(mut self, factor: f64) -> FieldInfo {
        self.scale = factor;
        self
    }

    pub fn with_help(mut self, help: &str) -> FieldInfo {
        self.help = help.to_string();
        self
    }

    pub fn with_properties(mut self, props: u32) -> FieldInfo {
        self.print_properties = PrintProperties(props);
        self
    }

    pub fn with_lookup(mut self, lookup: Translate) -> FieldInfo {
        self.lookup = lookup;
        self
    }

    pub fn has_matcher(&self) -> bool {
        self.matcher.active
    }

    pub fn has_formula(&self) -> bool {
        self.formula.is_some()
    }

    /// Field name for one concrete entry, counters substituted.
    pub fn field_name(&self, dve: Option<&DVEntry>) -> String {
        self.template.expand(dve)
    }

    /// Field name including the lowercase unit suffix, e.g. total_m3.
    pub fn field_name_with_unit(&self, dve: Option<&DVEntry>) -> String {
        match self.quantity {
            crate::units::Quantity::Text | crate::units::Quantity::PointInTime => self.field_name(dve),
            _ => format!("{}_{}", self.field_name(dve), self.display_unit.suffix()),
        }
    }
}

#[cfg(test)]
mod fields_tests {
    use super::*;
    use crate::dvparser::{parse_dv, MeasurementType};
    use crate::telegram::{AboutTelegram, Telegram};
    use crate::units::Quantity;

    fn entries(hex_records: &str) -> Telegram {
        let mut t = Telegram::new(AboutTelegram::default());
        t.frame = hex::decode(hex_records).unwrap();
        let len = t.frame.len();
        parse_dv(&mut t, 0, len, None);
        t
    }

    #[test]
    fn vif_range_matching() {
        let t = entries("041389E20100023B0000");
        let m = FieldMatcher::build().mtype(MeasurementType::Instantaneous).vif(VifRange::Volume);
        assert!(m.matches(&t.dv_entries["0413"]));
        assert!(!m.matches(&t.dv_entries["023B"]));
    }

    #[test]
    fn combinables_are_never_implicit() {
        /* 04 93 3A: volume with an accumulation-positive combinable. */
        let t = entries("04933A89E20100");
        let plain = FieldMatcher::build().vif(VifRange::Volume);
        let entry = t.dv_entries.values().next().unwrap();
        assert!(!entry.combinable_vifs.is_empty());
        assert!(!plain.matches(entry));

        let with = FieldMatcher::build()
            .vif(VifRange::Volume)
            .add_combinable(VifCombinable::AccumulationPositive);
        assert!(with.matches(entry));
    }

    #[test]
    fn storage_range_matcher() {
        let t = entries("841013D20400008420130A000000");
        let m = FieldMatcher::build().vif(VifRange::Volume).tariff_range(1, 2).any_storage();
        let matching: Vec<_> = t.dv_entries.values().filter(|e| m.matches(e)).collect();
        assert_eq!(matching.len(), 2);
        assert!(m.expects_multiple_matches());
    }

    #[test]
    fn name_template_expansion() {
        let t = entries("841013D2040000");
        let dve = t.dv_entries.values().next().unwrap();
        let template = NameTemplate::parse("total_at_tariff_{tariff_counter}");
        assert_eq!(template.expand(Some(dve)), "total_at_tariff_1");
        assert_eq!(NameTemplate::parse("plain_name").expand(None), "plain_name");
    }

    #[test]
    fn field_name_with_unit_suffix() {
        let fi = FieldInfo::numeric("total", Quantity::Volume, Unit::M3, FieldMatcher::build());
        assert_eq!(fi.field_name_with_unit(None), "total_m3");
    }

    #[test]
    fn translate_rules() {
        let lookup = Translate::new().rule(0x20, 0x20, "DRY").rule(0x40, 0x40, "BURST");
        assert_eq!(lookup.translate(0x60), "DRY BURST");
        assert_eq!(lookup.translate(0x00), "OK");
    }
}
