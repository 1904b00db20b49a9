//! Sensus iPERL water meter.

use crate::dvparser::{MeasurementType, VifRange};
use crate::link::{LinkMode, LinkModeSet};
use crate::units::{Quantity, Unit};

use super::fields::{FieldInfo, FieldMatcher, Translate};
use super::{register_driver, DriverDetect, DriverInfo, MeterType};

pub fn register() {
    register_driver(DriverInfo {
        name: "iperl".to_string(),
        aliases: vec![],
        meter_type: MeterType::WaterMeter,
        link_modes: LinkModeSet::none().with(LinkMode::T1).with(LinkMode::C1),
        detect: vec![
            DriverDetect { mfct: 0x4CAE, media: 0x06, version: 0x68 },
            DriverDetect { mfct: 0x4CAE, media: 0x07, version: 0x68 },
            /* Rebadged units ship with an ELS id. */
            DriverDetect { mfct: 0x1593, media: 0x07, version: 0x01 },
        ],
        default_fields: vec![
            "name".to_string(),
            "id".to_string(),
            "total_m3".to_string(),
            "max_flow_m3h".to_string(),
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
                "max_flow",
                Quantity::Flow,
                Unit::M3h,
                FieldMatcher::build()
                    .mtype(MeasurementType::Instantaneous)
                    .vif(VifRange::VolumeFlow),
            )
            .with_help("The maximum flow recorded during previous period."),
        ],
        process_content: None,
        mfct_tpl_status_bits: Translate::new(),
    });
}

#[cfg(test)]
mod iperl_tests {
    use super::super::{init_drivers, AddressExpression, Meter, MeterManager};
    use crate::link::{Frame, FrameFormat, LinkMode};
    use crate::telegram::{AboutTelegram, MeterKeys};

    fn about() -> AboutTelegram {
        AboutTelegram { device: "cc1101".to_string(), rssi_dbm: -77, ..Default::default() }
    }

    #[test]
    fn sensus_telegram_renders_total() {
        init_drivers();
        let driver = super::super::lookup_driver("iperl").unwrap();
        let mut meter = Meter::new(
            "MoreWater",
            driver,
            vec![AddressExpression::parse("33225544").unwrap()],
            MeterKeys::default(),
        );

        let frame = hex::decode("1844AE4C4455223368077A55000000041389E20100023B0000").unwrap();
        let t = meter.handle_telegram(about(), &frame, false).unwrap();
        let record = meter.render(&t, ';');

        let json = record.json.as_object().unwrap();
        assert_eq!(json["media"], "water");
        assert_eq!(json["meter"], "iperl");
        assert_eq!(json["name"], "MoreWater");
        assert_eq!(json["id"], "33225544");
        assert_eq!(json["total_m3"], 123.529);
        assert_eq!(json["max_flow_m3h"], 0.0);
        assert_eq!(json["device"], "cc1101");
        assert_eq!(json["rssi_dbm"], -77);
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));

        assert_eq!(record.fields, "MoreWater;33225544;123.529;0;1970-01-01 00:00.00");
    }

    #[test]
    fn rebadged_els_water_meter_dispatches_by_detection() {
        init_drivers();
        let driver = super::super::lookup_driver("iperl").unwrap();
        let meter = Meter::new(
            "kitchen",
            driver,
            vec![AddressExpression::parse("00010474").unwrap()],
            MeterKeys::default(),
        );
        let mut manager = MeterManager::new(';');
        manager.add_meter(meter);

        /* ELS water meter, version 01 media 07, one liter-scaled record. */
        let frame = Frame {
            data: hex::decode("104493157404010001077804 13D2040000".replace(' ', "")).unwrap(),
            link_mode: LinkMode::T1,
            rssi_dbm: -80,
            format: FrameFormat::A,
        };
        let records = manager.handle_frame(&frame, about(), false);
        assert_eq!(records.len(), 1);
        let json = records[0].json.as_object().unwrap();
        assert_eq!(json["meter"], "iperl");
        assert_eq!(json["media"], "water");
        assert_eq!(json["id"], "00010474");
        assert_eq!(json["total_m3"], 1.234);
    }

    #[test]
    fn wildcard_ids_route_to_one_meter_config() {
        init_drivers();
        let driver = super::super::lookup_driver("iperl").unwrap();
        let meter = Meter::new(
            "building",
            driver,
            vec![AddressExpression::parse("1234****").unwrap()],
            MeterKeys::default(),
        );
        let mut manager = MeterManager::new(';');
        manager.add_meter(meter);

        for id_wire in ["01003412", "99993412"] {
            /* id on the wire is reversed bcd. */
            let hex = format!("14444C4E{}010778041310270000023B0000", id_wire);
            let frame = Frame {
                data: hex::decode(&hex).unwrap(),
                link_mode: LinkMode::C1,
                rssi_dbm: -70,
                format: FrameFormat::A,
            };
            let records = manager.handle_frame(&frame, about(), false);
            assert_eq!(records.len(), 1);
        }
        assert_eq!(manager.meters[0].num_updates(), 2);
    }
}
