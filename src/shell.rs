//! # Shell Hook Environment
//!
//! When a meter updates, configured shell hooks run with the decoded
//! values exported as `METER_` environment variables: the full JSON, the
//! identity fields, one variable per decoded field, and timestamps in both
//! UTC and local time.

use chrono::{Local, Utc};
use serde_json::Value;

use crate::meters::Meter;
use crate::telegram::Telegram;

/// Build the `METER_*` environment for a shell hook.
pub fn build_meter_env(meter: &Meter, t: &Telegram) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let json = meter.to_json(Some(t));

    env.push(("METER_JSON".to_string(), json.to_string()));
    env.push(("METER_NAME".to_string(), meter.name().to_string()));
    env.push(("METER_TYPE".to_string(), meter.driver_name().to_string()));
    if let Some(a) = t.addresses.last() {
        env.push(("METER_ID".to_string(), a.id.clone()));
    }
    env.push(("METER_RSSI_DBM".to_string(), t.about.rssi_dbm.to_string()));
    env.push(("METER_DEVICE".to_string(), t.about.device.clone()));

    if let Value::Object(fields) = &json {
        for (key, value) in fields {
            let var = format!("METER_{}", key.to_uppercase());
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => "null".to_string(),
                other => other.to_string(),
            };
            // Identity variables already exported above keep their names.
            if !matches!(key.as_str(), "name" | "id" | "meter" | "rssi_dbm") {
                env.push((var, text));
            }
        }
    }

    let now_utc = Utc::now();
    let now_local = now_utc.with_timezone(&Local);
    env.push((
        "METER_TIMESTAMP".to_string(),
        now_utc.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    ));
    env.push((
        "METER_TIMESTAMP_UTC".to_string(),
        now_utc.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    ));
    env.push((
        "METER_TIMESTAMP_LT".to_string(),
        now_local.format("%Y-%m-%d %H:%M:%S").to_string(),
    ));
    env.push((
        "METER_TIMESTAMP_UT".to_string(),
        now_utc.timestamp().to_string(),
    ));

    env
}

/// Spawn the meter's shell hooks with the built environment. Failures are
/// logged, never fatal, and the dispatch loop is not blocked.
pub fn spawn_meter_shells(meter: &Meter, t: &Telegram) {
    if meter.shells().is_empty() {
        return;
    }
    let env = build_meter_env(meter, t);
    for cmdline in meter.shells() {
        let cmdline = cmdline.clone();
        let env = env.clone();
        tokio::spawn(async move {
            let mut cmd = tokio::process::Command::new("/bin/sh");
            cmd.arg("-c").arg(&cmdline);
            for (k, v) in &env {
                cmd.env(k, v);
            }
            match cmd.status().await {
                Ok(status) if !status.success() => {
                    log::warn!("(shell) \"{cmdline}\" exited with {status}");
                }
                Ok(_) => {}
                Err(e) => log::warn!("(shell) \"{cmdline}\" failed to start: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressExpression;
    use crate::meters::{create_meter, MeterInfo, TelegramOutcome};
    use crate::telegram::{AboutTelegram, FrameType};
    use crate::util::hex::decode_hex_flex;

    #[test]
    fn test_env_contains_decoded_fields() {
        let mi = MeterInfo {
            name: "MyHeater".to_string(),
            driver_name: "kamheat".to_string(),
            address_expressions: vec![AddressExpression::parse("67676767", false).unwrap()],
            ..MeterInfo::default()
        };
        let mut m = create_meter(&mi).unwrap();
        let frame = decode_hex_flex(
            "2E442D2C6767676730048D2039D1684020BCDB7803062C000043060000000314630000426C7F2A022D130001FF2100",
        )
        .unwrap();
        let about = AboutTelegram::new("im871a[00000000]", -77, FrameType::WMBus);
        let TelegramOutcome::Updated(t) = m.handle_telegram(&about, &frame) else {
            panic!("telegram should update the meter");
        };

        let env = build_meter_env(&m, &t);
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("METER_ID").unwrap(), "67676767");
        assert_eq!(get("METER_NAME").unwrap(), "MyHeater");
        assert_eq!(get("METER_TYPE").unwrap(), "kamheat");
        assert_eq!(get("METER_TOTAL_ENERGY_CONSUMPTION_KWH").unwrap(), "44.0");
        assert!(get("METER_JSON").unwrap().contains("\"meter\":\"kamheat\""));
        assert!(get("METER_TIMESTAMP_UTC").is_some());
        assert!(get("METER_TIMESTAMP_LT").is_some());
    }
}
