//! Kamstrup Multical 21 water meter. Sends C1 compact frames most of the
//! time, the format skeletons behind its known signatures are built into
//! the dvparser.

use crate::dvparser::{MeasurementType, VifRange};
use crate::link::{LinkMode, LinkModeSet};
use crate::units::{Quantity, Unit};

use super::fields::{print_property, FieldInfo, FieldMatcher, Translate};
use super::{register_driver, DriverDetect, DriverInfo, MeterType};

pub fn register() {
    register_driver(DriverInfo {
        name: "multical21".to_string(),
        aliases: vec!["flowiq3100".to_string()],
        meter_type: MeterType::WaterMeter,
        link_modes: LinkModeSet::none().with(LinkMode::C1).with(LinkMode::T1),
        detect: vec![
            DriverDetect { mfct: 0x2C2D, media: 0x06, version: 0x1B },
            DriverDetect { mfct: 0x2C2D, media: 0x16, version: 0x1B },
        ],
        default_fields: vec![
            "name".to_string(),
            "id".to_string(),
            "total_m3".to_string(),
            "target_m3".to_string(),
            "current_status".to_string(),
            "timestamp".to_string(),
        ],
        force_mfct_index: None,
        fields: vec![
            FieldInfo::numeric(
                "total",
                Quantity::Volume,
                Unit::M3,
                FieldMatcher::build()
                    .mtype(MeasurementType::Instantaneous)
                    .vif(VifRange::Volume),
            )
            .with_help("The total water consumption recorded by this meter."),
            FieldInfo::numeric(
                "target",
                Quantity::Volume,
                Unit::M3,
                FieldMatcher::build()
                    .mtype(MeasurementType::Instantaneous)
                    .vif(VifRange::Volume)
                    .storage(1),
            )
            .with_help("The total water consumption at the beginning of this month."),
            FieldInfo::numeric(
                "max_flow",
                Quantity::Flow,
                Unit::M3h,
                FieldMatcher::build()
                    .mtype(MeasurementType::Maximum)
                    .vif(VifRange::VolumeFlow)
                    .any_storage(),
            )
            .with_help("The maximum flow recorded during previous period."),
            FieldInfo::numeric(
                "flow_temperature",
                Quantity::Temperature,
                Unit::C,
                FieldMatcher::build()
                    .mtype(MeasurementType::Minimum)
                    .vif(VifRange::FlowTemperature),
            )
            .with_help("The water temperature."),
            FieldInfo::numeric(
                "min_flow_temperature",
                Quantity::Temperature,
                Unit::C,
                FieldMatcher::build()
                    .mtype(MeasurementType::Minimum)
                    .vif(VifRange::FlowTemperature)
                    .storage(2),
            )
            .with_help("The lowest water temperature during previous period."),
            FieldInfo::numeric(
                "external_temperature",
                Quantity::Temperature,
                Unit::C,
                FieldMatcher::build()
                    .mtype(MeasurementType::Minimum)
                    .vif(VifRange::ExternalTemperature),
            )
            .with_help("The external temperature outside of the meter."),
            FieldInfo::text(
                "current_status",
                FieldMatcher::build().vif_raw(0x7F20),
            )
            .with_lookup(
                Translate::new()
                    .rule(0x01, 0x01, "DRY")
                    .rule(0x02, 0x02, "REVERSE")
                    .rule(0x04, 0x04, "LEAK")
                    .rule(0x08, 0x08, "BURST"),
            )
            .with_properties(print_property::STATUS | print_property::INCLUDE_TPL_STATUS)
            .with_help("Status and error flags."),
        ],
        process_content: None,
        mfct_tpl_status_bits: Translate::new(),
    });
}
