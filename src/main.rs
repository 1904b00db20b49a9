use std::env;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use wmbus2json::meters::{AddressExpression, Meter, MeterManager};
use wmbus2json::radio::RawPacket;
use wmbus2json::telegram::{AboutTelegram, FrameType, MeterKeys};
use wmbus2json::{config, link, meters};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("WMBUS_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    env::set_var("RUST_BACKTRACE", "1");

    config::load_config();
    meters::init_drivers();

    let cfg = config::get_config();
    let mut manager = MeterManager::new(cfg.output.separator);
    for mc in &cfg.meters {
        let driver = match meters::lookup_driver(&mc.driver) {
            Some(d) => d,
            None => {
                warn!("meter {} uses unknown driver {}, skipping", mc.name, mc.driver);
                continue;
            }
        };
        let address = match AddressExpression::parse(&mc.address) {
            Some(a) => a,
            None => {
                warn!("meter {} has a bad address expression {}, skipping", mc.name, mc.address);
                continue;
            }
        };
        let keys = match MeterKeys::from_hex(&mc.key).and_then(|k| k.with_auth_key(&mc.auth_key)) {
            Ok(k) => k,
            Err(e) => {
                warn!("meter {} has a bad key: {}, skipping", mc.name, e);
                continue;
            }
        };
        let mut meter = Meter::new(&mc.name, driver, vec![address], keys);
        meter.set_selected_fields(mc.selected_fields.clone());
        meter.extra_constant_fields = mc.extra_constant_fields.clone();
        for calc in &mc.calculated_fields {
            meter.add_calculated_field(calc);
        }
        manager.add_meter(meter);
    }
    info!("{} meters configured", manager.meters.len());

    let (packet_tx, mut packet_rx) = wmbus2json::radio::packet_channel();
    let device_name = cfg.radio.chip.clone();
    let pretty_json = cfg.output.pretty_json;

    let mut threads: Vec<JoinHandle<()>> = Vec::new();

    /* Frames arrive either from an attached transceiver (wired up by the
       platform integration through radio::Receiver) or, the portable
       default, as hex lines on stdin in the rtl-wmbus style. */
    threads.push(tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let hex = line
                .trim()
                .trim_start_matches("telegram=")
                .trim_matches('|')
                .trim_start_matches("0x")
                .to_string();
            if hex.is_empty() || hex.starts_with('#') {
                continue;
            }
            match hex::decode(&hex) {
                Ok(data) => {
                    if packet_tx.send(RawPacket { data, rssi_dbm: 0 }).await.is_err() {
                        break;
                    }
                }
                Err(_) => warn!("ignoring non-hex input line"),
            }
        }
        debug!("input closed");
    }));

    /* Main task: link layer, telegram parsing, dispatch and rendering. */
    threads.push(tokio::spawn(async move {
        while let Some(packet) = packet_rx.recv().await {
            let rssi = packet.rssi_dbm;
            let (frame, simulated) = match link::decode(packet.data.clone(), rssi) {
                Ok(f) => (f, false),
                Err(e) => {
                    /* Not a raw wire frame. Accept already CRC-stripped
                       canonical frames as simulated input. */
                    let data = packet.data;
                    if !data.is_empty() && data[0] as usize == data.len() - 1 {
                        debug!("treating input as simulated canonical frame");
                        let frame = link::Frame {
                            data,
                            link_mode: link::LinkMode::T1,
                            rssi_dbm: rssi,
                            format: link::FrameFormat::A,
                        };
                        (frame, true)
                    } else {
                        debug!("dropping frame: {}", e);
                        continue;
                    }
                }
            };

            let about = AboutTelegram {
                device: device_name.clone(),
                rssi_dbm: frame.rssi_dbm as i32,
                frame_type: FrameType::WmBus,
                timestamp: chrono::Utc::now(),
            };

            for record in manager.handle_frame(&frame, about, simulated) {
                info!("{}", record.human_readable);
                if pretty_json {
                    println!("{}", serde_json::to_string_pretty(&record.json).unwrap_or_default());
                } else {
                    println!("{}", record.json);
                }
            }
        }
    }));

    info!("All tasks started, now waiting for a signal to exit");
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut kill_all_tasks = false;
        for task in threads.iter() {
            if task.is_finished() {
                kill_all_tasks = true;
            }
        }

        if kill_all_tasks == true {
            for task in threads.iter_mut() {
                task.abort();
            }
            break;
        }
    }
    Ok(())
}
