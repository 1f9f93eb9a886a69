//! Apator NA-1 water meter.
//!
//! The NA-1 does not send DIF/VIF records at all: the payload is a
//! vendor-packed block encrypted with AES-CBC using the telegram's first
//! payload byte as access counter. The configured meter key must be
//! supplied; meters in the field commonly ship with an all-zero key.

use std::sync::Arc;

use log::{debug, warn};

use crate::meters::fields::PrintProperties;
use crate::meters::registry::{register_driver, ContentProcessor, DriverError, DriverInfo};
use crate::meters::{Meter, MeterType};
use crate::telegram::parser::build_tpl_cbc_iv;
use crate::telegram::Telegram;
use crate::units::{Quantity, Unit};
use crate::util::crypto::aes_cbc_decrypt;

use super::detect;

pub fn register() -> Result<(), DriverError> {
    let mut di = DriverInfo::new("apatorna1", MeterType::WaterMeter);
    di.default_fields = vec![
        "name".to_string(),
        "id".to_string(),
        "total_m3".to_string(),
        "timestamp".to_string(),
    ];
    di.detect = vec![detect("APA", 0x07, 0x14)];
    di.setup_fields = Arc::new(|m: &mut Meter| {
        m.add_numeric_field(
            "total",
            Quantity::Volume,
            PrintProperties::default(),
            "The total water consumption recorded by this meter.",
        );
    });
    di.content_processor = Some(Arc::new(Na1Content));
    register_driver(di)
}

struct Na1Content;

impl ContentProcessor for Na1Content {
    fn process_content(&self, meter: &mut Meter, t: &Telegram) {
        let content = t.extract_payload();
        if content.len() < 18 {
            return;
        }

        let Some(key) = &meter.meter_keys().confidentiality_key else {
            warn!("(apatorna1) no key configured for {}", meter.name());
            return;
        };

        // One AES block starting after the leading access counter pair.
        let acc = content[0];
        let iv = build_tpl_cbc_iv(&t.dll_mfct_b, &t.dll_a, acc);
        let Ok(block) = aes_cbc_decrypt(key, &iv, &content[2..18]) else {
            warn!("(apatorna1) decrypt failed for {}", meter.name());
            return;
        };

        let multiplier = 10u32.pow(((block[1] & 0b0011_0000) >> 4) as u32);
        let reading = (block[4] as u32) << 20
            | (block[3] as u32) << 12
            | (block[2] as u32) << 4
            | (block[1] & 0b0000_1111) as u32;
        let volume = reading as f64 * multiplier as f64 / 1000.0;

        debug!("(apatorna1) volume {volume:.3}");
        meter.set_numeric_value("total", Unit::M3, volume);
    }
}
