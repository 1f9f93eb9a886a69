//! # Compact Frame Format Cache
//!
//! A compact frame (CI 0x79) carries a 2-byte CRC of the DIF/VIF run of an
//! earlier full frame instead of the run itself. Whenever a full frame is
//! parsed its format bytes are remembered here, keyed by that CRC, so
//! subsequent compact frames from the same meter decode fully. A handful of
//! signatures from meters that only rarely send full frames are seeded at
//! startup.
//!
//! Writes happen once per signature on the event loop thread during parse;
//! the mutex is uncontended in practice.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use once_cell::sync::Lazy;

use crate::util::hex::{decode_hex_strict, encode_hex_upper};

/// Format signatures from well known meters that mostly send compact
/// frames, so a restart does not have to wait for a full frame.
const KNOWN_METER_SIGNATURES: &[(u16, &str)] = &[
    (0xa8ed, "02FF2004134413615B6167"),
    (0xc412, "02FF20041392013BA1015B8101E7FF0F"),
    (0x61eb, "02FF2004134413"),
    (0xd2f7, "02FF2004134413615B5167"),
    (0xdd34, "02FF20046D04134413"),
];

static FORMAT_CACHE: Lazy<Mutex<HashMap<u16, Vec<u8>>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (sig, hexfmt) in KNOWN_METER_SIGNATURES {
        if let Ok(bytes) = decode_hex_strict(hexfmt) {
            map.insert(*sig, bytes);
        }
    }
    Mutex::new(map)
});

/// Remember the format byte run for a signature. First write wins.
pub fn remember_format(signature: u16, format_bytes: &[u8]) {
    let mut cache = FORMAT_CACHE.lock().unwrap();
    if !cache.contains_key(&signature) {
        debug!(
            "(dvparser) found new format \"{}\" with hash {signature:x}, remembering!",
            encode_hex_upper(format_bytes)
        );
        cache.insert(signature, format_bytes.to_vec());
    }
}

/// Fetch the remembered format bytes for a compact frame signature.
pub fn lookup_format(signature: u16) -> Option<Vec<u8>> {
    let cache = FORMAT_CACHE.lock().unwrap();
    let hit = cache.get(&signature).cloned();
    if hit.is_some() {
        debug!("(dvparser) found remembered format for hash {signature:x}");
    }
    hit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remember_and_lookup() {
        remember_format(0x9999, &[0x0b, 0x13]);
        assert_eq!(lookup_format(0x9999), Some(vec![0x0b, 0x13]));
        // First write wins.
        remember_format(0x9999, &[0x0c, 0x14]);
        assert_eq!(lookup_format(0x9999), Some(vec![0x0b, 0x13]));
    }

    #[test]
    fn test_known_signatures_seeded() {
        assert!(lookup_format(0xa8ed).is_some());
        assert!(lookup_format(0x0000).is_none());
    }
}
