//! BFW 240 radio heat cost allocator. The telegram starts with 2f 2f as a
//! plain header marker, everything after is manufacturer specific and is
//! unpacked by the process content hook.

use crate::link::{LinkMode, LinkModeSet};
use crate::telegram::Telegram;
use crate::units::{Quantity, Unit};

use super::fields::{FieldInfo, FieldMatcher, Translate};
use super::{register_driver, DriverDetect, DriverInfo, Meter, MeterType};

pub fn register() {
    let mut fields = vec![
        FieldInfo::numeric("current", Quantity::Hca, Unit::Hca, FieldMatcher::none())
            .with_help("Energy consumption so far in this billing period."),
        FieldInfo::numeric("prev", Quantity::Hca, Unit::Hca, FieldMatcher::none())
            .with_help("Energy consumption at end of previous billing period."),
    ];
    for i in 0..18 {
        fields.push(
            FieldInfo::numeric(
                &format!("prev_{:02}", i + 1),
                Quantity::Hca,
                Unit::Hca,
                FieldMatcher::none(),
            )
            .with_help(&format!("Energy consumption {} months ago.", i + 1)),
        );
    }
    fields.push(
        FieldInfo::text("device_date", FieldMatcher::none())
            .with_help("Device date when telegram was sent."),
    );

    register_driver(DriverInfo {
        name: "bfw240radio".to_string(),
        aliases: vec![],
        meter_type: MeterType::HeatCostAllocationMeter,
        link_modes: LinkModeSet::none().with(LinkMode::T1),
        detect: vec![DriverDetect { mfct: 0x08D7, media: 0x08, version: 0x02 }],
        default_fields: vec![
            "name".to_string(),
            "id".to_string(),
            "current_hca".to_string(),
            "prev_hca".to_string(),
            "timestamp".to_string(),
        ],
        /* First two bytes are 2f2f, after that completely mfct specific. */
        force_mfct_index: Some(2),
        fields,
        process_content: Some(process_content),
        mfct_tpl_status_bits: Translate::new(),
    });
}

/* Historic monthly values are packed 12 bits each, newest first, with a
   byte reordering for every second month. */
fn historic(n: usize, content: &[u8]) -> f64 {
    let offset = (n * 12) / 8;
    let remainder = (n * 12) % 8;

    let (lo, hi) = if remainder == 0 {
        (content[36 - offset], 0x0F & content[36 - 1 - offset])
    } else {
        (content[36 - 1 - offset], (0xF0 & content[36 - offset]) >> 4)
    };
    (hi as f64) * 256.0 + lo as f64
}

fn process_content(meter: &mut Meter, t: &mut Telegram) {
    let content = t.extract_payload();
    if content.len() < 40 {
        return;
    }

    let current = (content[6] as f64) * 256.0 + content[7] as f64;
    meter.set_numeric_value("current", Unit::Hca, current);

    let prev = (content[4] as f64) * 256.0 + content[5] as f64;
    meter.set_numeric_value("prev", Unit::Hca, prev);

    let device_date = format!("20{:02x}-{:02x}-{:02x}", content[39], content[38], content[37]);
    meter.set_string_value("device_date", &device_date);

    for i in 0..18 {
        meter.set_numeric_value(&format!("prev_{:02}", i + 1), Unit::Hca, historic(i, &content));
    }
}

#[cfg(test)]
mod bfw240radio_tests {
    use super::super::{init_drivers, AddressExpression, Meter};
    use crate::telegram::{AboutTelegram, MeterKeys};

    fn meter(id: &str) -> Meter {
        init_drivers();
        let driver = super::super::lookup_driver("bfw240radio").unwrap();
        Meter::new("bfw", driver, vec![AddressExpression::parse(id).unwrap()], MeterKeys::default())
    }

    const TELEGRAM_FEB: &str = "3644D7088877700002087ADBC000002F2F9E1F03C10388152A00000000000000000000000000000204000404000EE2020AC1321D280221";

    #[test]
    fn heat_cost_allocator_decodes_mfct_content() {
        let mut m = meter("00707788");
        let frame = hex::decode(TELEGRAM_FEB).unwrap();
        let t = m.handle_telegram(AboutTelegram::default(), &frame, false).unwrap();
        let record = m.render(&t, ';');
        let json = record.json.as_object().unwrap();

        assert_eq!(json["media"], "heat cost allocation");
        assert_eq!(json["meter"], "bfw240radio");
        assert_eq!(json["id"], "00707788");
        assert_eq!(json["current_hca"], 904.0);
        assert_eq!(json["prev_hca"], 961.0);
        assert_eq!(json["prev_01_hca"], 541.0);
        assert_eq!(json["prev_02_hca"], 961.0);
        assert_eq!(json["prev_03_hca"], 522.0);
        assert_eq!(json["prev_04_hca"], 226.0);
        assert_eq!(json["prev_05_hca"], 14.0);
        assert_eq!(json["prev_09_hca"], 2.0);
        assert_eq!(json["prev_18_hca"], 0.0);
        assert_eq!(json["device_date"], "2021-02-28");

        assert_eq!(record.human_readable, "bfw\t00707788\t904\t961\t1970-01-01 00:00.00");
    }

    #[test]
    fn records_stay_mfct_specific() {
        let mut m = meter("00707788");
        let frame = hex::decode(TELEGRAM_FEB).unwrap();
        let t = m.handle_telegram(AboutTelegram::default(), &frame, false).unwrap();
        /* forceMfctIndex stops the walker before it invents records. */
        assert!(t.dv_entries.is_empty());
    }
}
