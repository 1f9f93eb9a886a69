//! The internal invariants the pipeline must hold: hex codecs, CRC
//! flavours, AES-CMAC vectors, SLIP framing, the DIF/VIF parser vectors
//! and address expression matching.

use proptest::prelude::*;

use wmeters::address::{does_id_match_expressions, is_valid_match_expressions, split_match_expressions};
use wmeters::payload::dvparser::{
    extract_dv_date, extract_dv_double, extract_dv_hex_string, parse_dv, DvEntries,
};
use wmeters::util::crc::{crc16_ccitt_check, crc16_en13757};
use wmeters::util::crypto::{aes_cmac, AesKey};
use wmeters::util::hex::{decode_hex_flex, decode_hex_strict, encode_hex, encode_hex_upper};
use wmeters::util::slip::{add_slip_framing, remove_slip_framing};

#[test]
fn test_hex_strict_rejects_odd_and_nonhex() {
    assert!(decode_hex_strict("0").is_err());
    assert!(decode_hex_strict("0g").is_err());
    assert!(decode_hex_strict("0a1B").is_ok());
}

#[test]
fn test_hex_flex_ignores_framing_characters() {
    let a = decode_hex_flex("2E442D2C6767676730048D20").unwrap();
    let b = decode_hex_flex("2E44 2D2C_67676767|3004#8D20").unwrap();
    assert_eq!(a, b);
}

proptest! {
    #[test]
    fn prop_hex_round_trip(data in proptest::collection::vec(any::<u8>(), 0..200)) {
        let hex = encode_hex(&data);
        prop_assert_eq!(decode_hex_strict(&hex).unwrap(), data);
    }

    #[test]
    fn prop_slip_round_trip(data in proptest::collection::vec(any::<u8>(), 1..200)) {
        let framed = add_slip_framing(&data);
        let (unframed, consumed) = remove_slip_framing(&framed);
        prop_assert_eq!(unframed, data);
        prop_assert_eq!(consumed, framed.len());
    }
}

#[test]
fn test_slip_vector() {
    let payload = [1u8, 0xc0, 3, 4, 5, 0xdb];
    let framed = add_slip_framing(&payload);
    assert_eq!(framed, vec![0xc0, 1, 0xdb, 0xdc, 3, 4, 5, 0xdb, 0xdd, 0xc0]);
    let (unframed, consumed) = remove_slip_framing(&framed);
    assert_eq!(unframed, payload);
    assert_eq!(consumed, 10);
}

#[test]
fn test_crc16_en13757_vectors() {
    assert_eq!(crc16_en13757(b"123456789"), 0xc2b7);
    assert_eq!(crc16_en13757(&[0x01, 0xfd, 0x1f, 0x00]), 0xf147);
    assert_eq!(crc16_en13757(&[0x01, 0xfd, 0x1f, 0x01]), 0xcc22);
}

#[test]
fn test_crc16_ccitt_good_value() {
    let mut data = vec![0x01u8, 0x02, 0x03, 0x04];
    let crc = !wmeters::util::crc::crc16_ccitt(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    assert!(crc16_ccitt_check(&data));
}

#[test]
fn test_aes_cmac_rfc4493() {
    let key = AesKey::from_hex("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
    assert_eq!(
        encode_hex_upper(&aes_cmac(&key, &[])),
        "BB1D6929E95937287FA37D129B756746"
    );
    let one_block = decode_hex_strict("6bc1bee22e409f96e93d7e117393172a").unwrap();
    assert_eq!(
        encode_hex_upper(&aes_cmac(&key, &one_block)),
        "070A16B46B4D4144F79BDD9DD04A287C"
    );
}

#[test]
fn test_address_validity() {
    for s in ["12345678", "*", "!12345678", "12345*", "!123456*", "2222*,!22224444"] {
        assert!(is_valid_match_expressions(s, false), "{s}");
    }
    for s in ["1234567", "", "z1234567", "123456789", "!!12345678", "12345678*", "**", "123**"] {
        assert!(!is_valid_match_expressions(s, false), "{s}");
    }
}

fn check_match(id: &str, expressions: &str, expected: bool, expected_wildcard: bool) {
    let exprs = split_match_expressions(expressions);
    let mut used_wildcard = false;
    let matched = does_id_match_expressions(id, &exprs, &mut used_wildcard);
    assert_eq!(matched, expected, "{id} vs {expressions}");
    if expected {
        assert_eq!(used_wildcard, expected_wildcard, "wildcard for {id} vs {expressions}");
    }
}

#[test]
fn test_address_matching() {
    check_match("12345678", "12345678", true, false);
    check_match("22222223", "22*,!22222222", true, true);
    check_match("22222222", "22*,!22222222", false, false);
    check_match("22222223", "22*,!22*", false, false);
    check_match("78563413", "*,!00156327,!00048713", true, true);
}

fn parse(hex: &str) -> DvEntries {
    let bytes = decode_hex_flex(hex).unwrap();
    parse_dv(&bytes, 0, None, None).entries
}

#[test]
fn test_dvparser_payload() {
    let entries = parse(
        "2F 2F 0B 13 56 34 12 8B 82 00 93 3E 67 45 23 0D FD 10 0A 30 31 32 33 34 35 36 37 38 39 0F 88 2F",
    );
    let (_, v) = extract_dv_double(&entries, "0B13").unwrap();
    assert!((v - 123.456).abs() < 1e-9);
    let (_, v) = extract_dv_double(&entries, "8B8200933E").unwrap();
    assert!((v - 234.567).abs() < 1e-9);
    let (_, s) = extract_dv_hex_string(&entries, "0DFD10").unwrap();
    assert_eq!(s, "30313233343536373839");
}

#[test]
fn test_date_extraction() {
    let entries = parse("82046C 5F1C");
    let (_, d) = extract_dv_date(&entries, "82046C").unwrap();
    assert_eq!(d.to_string(), "2010-12-31");

    let entries = parse("426C FE04");
    let (_, d) = extract_dv_date(&entries, "426C").unwrap();
    assert_eq!(d.to_string(), "2007-04-30");
}

#[test]
fn test_dvparser_long_payload_with_history() {
    let entries = parse(
        "0C1348550000426CE1F14C130000000082046C21298C0413330000008D04931E3A3CFE3300000033000000330000003300000033000000330000003300000033000000330000003300000033000000330000004300000034180000046D0D0B5C2B03FD6C5E150082206C5C290BFD0F0200018C4079678885238310FD3100000082106C01018110FD610002FD66020002FD170000",
    );
    let (_, v) = extract_dv_double(&entries, "0C13").unwrap();
    assert!((v - 5.548).abs() < 1e-9);
    let (_, d) = extract_dv_date(&entries, "426C").unwrap();
    assert_eq!(d.to_string(), "2127-01-01");
    let (_, d) = extract_dv_date(&entries, "82106C").unwrap();
    assert_eq!(d.to_string(), "2000-01-01");
}
