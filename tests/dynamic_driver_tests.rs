//! Dynamic driver loading: a driver file parsed at runtime decodes
//! telegrams like a built-in, may override a built-in, and reports
//! readable errors for bad entries.

use wmeters::address::AddressExpression;
use wmeters::meters::dynamic::{load_driver, parse_driver, DynamicError};
use wmeters::meters::{create_meter, MeterInfo, TelegramOutcome};
use wmeters::telegram::{AboutTelegram, FrameType};

const WATER_DRIVER: &str = r#"
driver {
    name           = aquastream
    meter_type     = WaterMeter
    default_fields = name,id,total_m3,timestamp
    detect { mvt = AQU,22,07 }
    library { use = total_m3 }
    field {
        name           = target
        quantity       = Volume
        info           = 'Volume at the billing date.'
        vif_scaling    = Auto
        dif_signedness = Signed
        match {
            measurement_type = Instantaneous
            vif_range        = Volume
            storage_nr       = 1
        }
    }
    field {
        name      = approx_flow
        quantity  = Flow
        info      = 'Rough flow estimate over the last day.'
        calculate = total_m3 / 24 h
    }
}
"#;

fn water_telegram() -> Vec<u8> {
    // AQU 0x0475? A=1,Q=17,U=21: (1<<10)|(17<<5)|21 = 1024+544+21 = 1589.
    let mfct = 1589u16;
    let mut body: Vec<u8> = Vec::new();
    body.push(0x44);
    body.extend_from_slice(&mfct.to_le_bytes());
    body.extend_from_slice(&[0x44, 0x33, 0x22, 0x11]); // id 11223344
    body.push(0x22); // version
    body.push(0x07); // water
    body.push(0x78);
    // total 123.456 m3, target 100.000 m3.
    body.extend_from_slice(&[0x0b, 0x13, 0x56, 0x34, 0x12]);
    body.extend_from_slice(&[0x4b, 0x13, 0x00, 0x00, 0x10]);
    let mut frame = vec![body.len() as u8];
    frame.append(&mut body);
    frame
}

#[test]
fn test_dynamic_driver_decodes_telegram() {
    load_driver("aquastream.wmd", WATER_DRIVER).expect("driver loads");

    let mi = MeterInfo {
        name: "w1".to_string(),
        driver_name: "aquastream".to_string(),
        address_expressions: vec![AddressExpression::parse("11223344", false).unwrap()],
        ..MeterInfo::default()
    };
    let mut m = create_meter(&mi).unwrap();
    let about = AboutTelegram::new("test", 0, FrameType::WMBus);
    let TelegramOutcome::Updated(t) = m.handle_telegram(&about, &water_telegram()) else {
        panic!("telegram rejected");
    };
    let json = m.to_json(Some(&t));

    let total = json.get("total_m3").unwrap().as_f64().unwrap();
    assert!((total - 123.456).abs() < 1e-9);
    let target = json.get("target_m3").unwrap().as_f64().unwrap();
    assert!((target - 100.0).abs() < 1e-9);
    // The calculated field derives from total.
    let flow = json.get("approx_flow_m3h").unwrap().as_f64().unwrap();
    assert!((flow - 123.456 / 24.0).abs() < 1e-9);
}

#[test]
fn test_dynamic_driver_error_reporting() {
    let bad = WATER_DRIVER.replace("meter_type     = WaterMeter", "meter_type     = WetMeter");
    match parse_driver("aquastream.wmd", &bad) {
        Err(DynamicError::BadValue { file, entry, value, expected, .. }) => {
            assert_eq!(file, "aquastream.wmd");
            assert_eq!(entry, "meter_type");
            assert_eq!(value, "WetMeter");
            assert!(expected.contains("WaterMeter"));
        }
        other => panic!("expected a BadValue error, got {other:?}"),
    }
}

#[test]
fn test_dynamic_driver_cannot_replace_dynamic() {
    let first = WATER_DRIVER.replace("aquastream", "aquaone").replace("AQU,22,07", "AQU,23,07");
    let second = WATER_DRIVER.replace("aquastream", "aquaone").replace("AQU,22,07", "AQU,24,07");
    load_driver("aquaone.wmd", &first).expect("first load ok");
    let err = load_driver("aquaone2.wmd", &second).unwrap_err();
    assert!(matches!(err, DynamicError::Registration { .. }));
}
