//! # DIF/VIF Record Walker
//!
//! Walks the self-describing data records of an application payload. Each
//! record is a DIF byte (width, function, storage bit) optionally chained
//! into DIFE bytes (more storage bits, tariff, subunit), a VIF byte
//! (what is measured) optionally chained into VIFE combinable modifiers,
//! followed by the data bytes.
//!
//! A record is keyed by the exact hex of its DIF..VIFE bytes, eg `02FF20`
//! for the Multical21 status bits. The same key can occur several times in
//! one telegram; later occurrences get `_2`, `_3`, ... suffixes. A proper
//! meter would use storage numbers instead, but the world is what it is.
//!
//! While walking a full frame the DIF/VIF byte run is hashed with
//! CRC-16 EN 13757 and remembered, so that later compact frames carrying
//! only the hash can be expanded again.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use log::{debug, trace, warn};
use serde::Serialize;

use crate::payload::dif::{dif_len_bytes, dif_measurement_type, dif_type_name, DifWidth, MeasurementType};
use crate::payload::vif::{to_vif_combinable, vif_scale, VifCombinable};
use crate::telegram::format_cache;
use crate::telegram::{Explanation, KindOfData, Understanding};
use crate::util::crc::crc16_en13757;
use crate::util::hex::{
    decode_hex_strict, encode_hex_upper, is_likely_ascii, reverse_bcd,
    reverse_binary_ascii_safe_to_string,
};

/// The exact DIF..VIFE byte sequence of a record, uppercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DifVifKey(pub String);

impl DifVifKey {
    pub fn new(s: &str) -> DifVifKey {
        DifVifKey(s.to_uppercase())
    }

    pub fn str(&self) -> &str {
        &self.0
    }

    /// The DIF byte of this key. Duplicate suffixes (`_2`, `_3`) are not
    /// part of the byte sequence.
    pub fn dif(&self) -> u8 {
        let hex = self.0.split('_').next().unwrap_or("");
        decode_hex_strict(hex)
            .ok()
            .and_then(|b| b.first().copied())
            .unwrap_or(0)
    }
}

impl std::fmt::Display for DifVifKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which record counter a template such as `{storage_counter}` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvEntryCounterType {
    StorageCounter,
    TariffCounter,
    SubunitCounter,
}

/// A decoded date, with optional time-of-day for the F coding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDate {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub has_seconds: bool,
}

impl std::fmt::Display for FieldDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.time {
            Some(t) if self.has_seconds => {
                write!(f, "{} {}", self.date.format("%Y-%m-%d"), t.format("%H:%M:%S"))
            }
            Some(t) => write!(f, "{} {}", self.date.format("%Y-%m-%d"), t.format("%H:%M")),
            None => write!(f, "{}", self.date.format("%Y-%m-%d")),
        }
    }
}

/// One decoded data record.
#[derive(Debug, Clone, Serialize)]
pub struct DVEntry {
    /// Byte offset of the data in the original frame.
    pub offset: usize,
    pub dif_vif_key: DifVifKey,
    pub measurement_type: MeasurementType,
    /// The full VIF, extension escapes folded in (0xFD 0x17 -> 0x7d17).
    pub vif: u16,
    pub combinable_vifs: Vec<VifCombinable>,
    pub combinable_vifs_raw: Vec<u16>,
    pub storage_nr: u64,
    pub tariff_nr: u32,
    pub subunit_nr: u32,
    /// Raw data bytes, uppercase hex.
    pub value: String,
}

impl DVEntry {
    pub fn counter(&self, ct: DvEntryCounterType) -> f64 {
        match ct {
            DvEntryCounterType::StorageCounter => self.storage_nr as f64,
            DvEntryCounterType::TariffCounter => self.tariff_nr as f64,
            DvEntryCounterType::SubunitCounter => self.subunit_nr as f64,
        }
    }

    fn check_size(&self, expected_hex_chars: usize) -> bool {
        if self.value.len() == expected_hex_chars {
            return true;
        }
        warn!(
            "(dvparser) bad decode since difvif {} expected {} hex chars but got \"{}\"",
            self.dif_vif_key, expected_hex_chars, self.value
        );
        false
    }

    /// Extract the record value as a double.
    ///
    /// `auto_scale` applies the VIF-implicit scale so the result lands in
    /// the range's display unit. `assume_signed` enables two's-complement
    /// sign extension for binary codings and the F-nibble sign convention
    /// for BCD.
    pub fn extract_double(&self, auto_scale: bool, assume_signed: bool) -> Option<f64> {
        let t = self.dif_vif_key.dif() & 0xf;
        let scale = if auto_scale { vif_scale(self.vif) } else { 1.0 };

        match t {
            0x1 | 0x2 | 0x3 | 0x4 | 0x6 | 0x7 => {
                let nbytes: usize = match t {
                    0x1 => 1,
                    0x2 => 2,
                    0x3 => 3,
                    0x4 => 4,
                    0x6 => 6,
                    _ => 8,
                };
                if !self.check_size(nbytes * 2) {
                    return None;
                }
                let v = decode_hex_strict(&self.value).ok()?;
                let mut raw: u64 = 0;
                for (i, &b) in v.iter().enumerate() {
                    raw |= (b as u64) << (8 * i);
                }
                let bits = nbytes * 8;
                let sign_bit = 1u64 << (bits - 1);
                let mut draw = raw as f64;
                if assume_signed && raw & sign_bit != 0 {
                    let negate_mask = if bits == 64 { 0 } else { !0u64 << bits };
                    draw = (negate_mask | raw) as i64 as f64;
                }
                Some(draw / scale)
            }
            0x9 | 0xa | 0xb | 0xc | 0xe => {
                let ndigits: usize = match t {
                    0x9 => 2,
                    0xa => 4,
                    0xb => 6,
                    0xc => 8,
                    _ => 12,
                };
                if !self.check_size(ndigits) {
                    return None;
                }
                let mut chars: Vec<u8> = self.value.bytes().collect();
                // Top nibble F in the sign position means negative.
                let sign_pos = ndigits - 2;
                let mut negate = false;
                if assume_signed && chars[sign_pos] == b'F' {
                    negate = true;
                    chars[sign_pos] = b'0';
                }
                // Little endian byte pairs: 74140000 decodes as 00001474.
                let mut raw: u64 = 0;
                for pair in (0..ndigits / 2).rev() {
                    let i = pair * 2;
                    let hi = (chars[i] as char).to_digit(10)?;
                    let lo = (chars[i + 1] as char).to_digit(10)?;
                    raw = raw * 100 + (hi * 10 + lo) as u64;
                }
                let mut draw = raw as f64;
                if negate {
                    draw = -draw;
                }
                Some(draw / scale)
            }
            0x5 => {
                // 32 bit IEEE 754 real.
                if !self.check_size(8) {
                    return None;
                }
                let v = decode_hex_strict(&self.value).ok()?;
                let bits = u32::from_le_bytes([v[0], v[1], v[2], v[3]]);
                Some(f32::from_bits(bits) as f64 / scale)
            }
            _ => {
                // Nothing to extract: no data, selection for readout,
                // variable length or special.
                None
            }
        }
    }

    /// Extract the record value as an unsigned integer.
    pub fn extract_long(&self) -> Option<u64> {
        let t = self.dif_vif_key.dif() & 0xf;
        match t {
            0x1 | 0x2 | 0x3 | 0x4 | 0x6 | 0x7 => {
                let v = decode_hex_strict(&self.value).ok()?;
                let mut raw: u64 = 0;
                for (i, &b) in v.iter().enumerate() {
                    raw |= (b as u64) << (8 * i);
                }
                Some(raw)
            }
            0x9 | 0xa | 0xb | 0xc | 0xe => self.extract_double(false, false).map(|d| d as u64),
            _ => None,
        }
    }

    /// Extract a human readable string. Binary data that looks like ascii
    /// is reversed and decoded; BCD is digit-reversed.
    pub fn extract_readable_string(&self) -> String {
        let t = self.dif_vif_key.dif() & 0xf;
        match t {
            0x1 | 0x2 | 0x3 | 0x4 | 0x6 | 0x7 | 0xd => {
                if is_likely_ascii(&self.value) {
                    reverse_binary_ascii_safe_to_string(&self.value)
                } else {
                    reverse_bcd(&self.value)
                }
            }
            0x9 | 0xa | 0xb | 0xc | 0xe => reverse_bcd(&self.value),
            _ => self.value.clone(),
        }
    }

    /// Decode a G (2 byte date), F (4 byte date+time) or 6 byte
    /// date+time+seconds coding.
    pub fn extract_date(&self) -> Option<FieldDate> {
        let v = decode_hex_strict(&self.value).ok()?;

        let date_from = |hi: u8, lo: u8| -> Option<NaiveDate> {
            // | YYYY MMMM | YYY DDDDD |
            let day = (lo & 0x1f) as u32;
            let year1 = ((lo & 0xe0) >> 5) as i32;
            let month = (hi & 0x0f) as u32;
            let year2 = ((hi & 0xf0) >> 1) as i32;
            let year = 2000 + year1 + year2;
            if month > 12 {
                return None;
            }
            NaiveDate::from_ymd_opt(year, month, day)
        };
        let time_from = |hi: u8, lo: u8, sec: Option<u8>| -> Option<NaiveTime> {
            let min = (lo & 0x3f) as u32;
            let hour = (hi & 0x1f) as u32;
            if min > 59 || hour > 23 {
                return None;
            }
            NaiveTime::from_hms_opt(hour, min, (sec.unwrap_or(0) & 0x3f) as u32)
        };

        match v.len() {
            2 => Some(FieldDate {
                date: date_from(v[1], v[0])?,
                time: None,
                has_seconds: false,
            }),
            4 => Some(FieldDate {
                date: date_from(v[3], v[2])?,
                time: Some(time_from(v[1], v[0], None)?),
                has_seconds: false,
            }),
            6 => Some(FieldDate {
                date: date_from(v[4], v[3])?,
                time: Some(time_from(v[2], v[1], Some(v[0]))?),
                has_seconds: true,
            }),
            _ => None,
        }
    }
}

/// Records keyed by their DIF/VIF hex, each with its frame offset.
pub type DvEntries = BTreeMap<String, (usize, DVEntry)>;

#[derive(Debug, Default)]
pub struct DvParseResult {
    pub entries: DvEntries,
    /// CRC-16 EN 13757 over the DIF/VIF byte run.
    pub format_signature: u16,
    /// Index just past a 0x0F manufacturer-data marker, if one was seen.
    pub mfct_0f_index: Option<usize>,
    pub explanations: Vec<Explanation>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    i: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.i).copied()
    }
    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.i += 1;
        Some(b)
    }
    fn at_end(&self) -> bool {
        self.i >= self.bytes.len()
    }
}

/// Walk the record section of an application payload.
///
/// `data` holds the record data. For a full frame the DIF/VIF headers are
/// part of `data` and `format` is `None`; for a compact frame `format`
/// carries the remembered DIF/VIF run and `data` only the values.
/// `offset_base` is where `data` starts inside the original frame, so the
/// explanations line up. `force_mfct_index` cuts over to manufacturer
/// specific data at a fixed index, a quirk of some legacy meters that send
/// trailing vendor bytes without a 0x0F marker.
pub fn parse_dv(
    data: &[u8],
    offset_base: usize,
    format: Option<&[u8]>,
    force_mfct_index: Option<usize>,
) -> DvParseResult {
    let data_has_difvifs = format.is_none();
    let fmt_bytes = format.unwrap_or(data);

    let mut result = DvParseResult::default();
    let mut dv_count: BTreeMap<String, u32> = BTreeMap::new();
    let mut format_run: Vec<u8> = Vec::new();

    let mut fmt = Cursor { bytes: fmt_bytes, i: 0 };
    let mut di = 0usize; // data cursor

    let expl = &mut result.explanations;
    let mut explain = |pos: usize, len: usize, kind: KindOfData, u: Understanding, info: String| {
        expl.push(Explanation::new(offset_base + pos, len, info, kind, u));
    };

    if !data_has_difvifs {
        debug!(
            "(dvparser) using format \"{}\"",
            encode_hex_upper(fmt_bytes)
        );
    }

    'records: loop {
        if fmt.at_end() {
            break;
        }

        if let Some(fmi) = force_mfct_index {
            // Old meter without a proper 0x0F manufacturer data marker.
            if di >= fmi {
                let value = encode_hex_upper(&data[di..]);
                explain(
                    di,
                    data.len() - di,
                    KindOfData::Content,
                    Understanding::None,
                    format!("manufacturer specific data {value}"),
                );
                result.mfct_0f_index = Some(di);
                break;
            }
        }

        let mut id_bytes: Vec<u8> = Vec::new();
        let dif = fmt.peek().expect("checked not at end");

        let mt = dif_measurement_type(dif);
        let width = dif_len_bytes(dif);
        trace!(
            "(dvparser) dif={dif:02x} \"{}\" type={}",
            dif_type_name(dif),
            mt.name()
        );

        // The idle filler 0x2F is skipped; it shares the special low
        // nibble with the manufacturer data markers, so test it first.
        if dif == 0x2f {
            fmt.next();
            if data_has_difvifs {
                explain(
                    fmt.i - 1,
                    1,
                    KindOfData::Protocol,
                    Understanding::Full,
                    format!("{dif:02X} skip"),
                );
                di = fmt.i;
            }
            continue;
        }

        if width == DifWidth::Special {
            fmt.next();
            if data_has_difvifs {
                di = fmt.i;
            }
            let start = di.saturating_sub(1);
            let value = encode_hex_upper(&data[di.min(data.len())..]);
            result.mfct_0f_index = Some(di);
            let info = if dif == 0x0f {
                format!("{dif:02X} manufacturer specific data {value}")
            } else {
                format!("{dif:02X} unknown dif treating remaining data as mfct specific {value}")
            };
            explain(
                start,
                data.len() - start,
                KindOfData::Content,
                Understanding::None,
                info,
            );
            break;
        }

        let variable_length = width == DifWidth::Variable;

        fmt.next();
        if data_has_difvifs {
            format_run.push(dif);
            explain(
                fmt.i - 1,
                1,
                KindOfData::Protocol,
                Understanding::Full,
                format!("{dif:02X} dif ({})", dif_type_name(dif)),
            );
        }
        id_bytes.push(dif);

        // DIFE chain: each byte adds 4 storage bits, 2 tariff bits and one
        // subunit bit.
        let mut difenr = 0u32;
        let mut subunit: u32 = 0;
        let mut tariff: u32 = 0;
        let mut storage_nr: u64 = ((dif & 0x40) >> 6) as u64;

        let mut has_another_dife = dif & 0x80 == 0x80;
        while has_another_dife {
            let Some(dife) = fmt.next() else {
                debug!("(dvparser) warning: unexpected end of data (dife expected)");
                break 'records;
            };
            subunit |= (((dife & 0x40) >> 6) as u32) << difenr;
            tariff |= (((dife & 0x30) >> 4) as u32) << (difenr * 2);
            storage_nr |= ((dife & 0x0f) as u64) << (1 + difenr * 4);

            if data_has_difvifs {
                format_run.push(dife);
                explain(
                    fmt.i - 1,
                    1,
                    KindOfData::Protocol,
                    Understanding::Full,
                    format!("{dife:02X} dife (subunit={subunit} tariff={tariff} storagenr={storage_nr})"),
                );
            }
            id_bytes.push(dife);
            has_another_dife = dife & 0x80 == 0x80;
            difenr += 1;
        }

        let Some(vif) = fmt.next() else {
            debug!("(dvparser) warning: unexpected end of data (vif expected)");
            break;
        };

        let mut full_vif: u16 = (vif & 0x7f) as u16;
        let mut extension_vif = false;
        let mut combinable_full_vif: u16 = 0;
        let mut combinable_extension_vif = false;
        let mut combinables: Vec<VifCombinable> = Vec::new();
        let mut combinables_raw: Vec<u16> = Vec::new();

        if data_has_difvifs {
            format_run.push(vif);
            explain(
                fmt.i - 1,
                1,
                KindOfData::Protocol,
                Understanding::Full,
                format!("{vif:02X} vif"),
            );
        }
        id_bytes.push(vif);

        // Extension markers escape into the second level vif tables.
        if vif == 0xfb || vif == 0xfd || vif == 0xef || vif == 0xff {
            full_vif <<= 8;
            extension_vif = true;
        }

        // Variable length user defined vif string.
        if vif == 0x7c {
            let Some(viflen) = fmt.next() else {
                debug!("(dvparser) warning: unexpected end of data (vif varlen expected)");
                break;
            };
            id_bytes.push(viflen);
            if data_has_difvifs {
                format_run.push(viflen);
                explain(
                    fmt.i - 1,
                    1,
                    KindOfData::Protocol,
                    Understanding::Full,
                    format!("{viflen:02X} viflen ({viflen})"),
                );
            }
            for n in 0..viflen {
                let Some(v) = fmt.next() else {
                    debug!(
                        "(dvparser) warning: unexpected end of data (vif varlen byte {}/{viflen} expected)",
                        n + 1
                    );
                    break 'records;
                };
                id_bytes.push(v);
                if data_has_difvifs {
                    format_run.push(v);
                    explain(
                        fmt.i - 1,
                        1,
                        KindOfData::Protocol,
                        Understanding::Full,
                        format!("{v:02X} vif ({})", v as char),
                    );
                }
            }
        }

        let mut has_another_vife = vif & 0x80 == 0x80;
        while has_another_vife {
            let Some(vife) = fmt.next() else {
                debug!("(dvparser) warning: unexpected end of data (vife expected)");
                break 'records;
            };
            if data_has_difvifs {
                format_run.push(vife);
            }
            id_bytes.push(vife);
            has_another_vife = vife & 0x80 == 0x80;

            if extension_vif {
                // First vife after the extension marker is the real vif.
                full_vif |= (vife & 0x7f) as u16;
                extension_vif = false;
                if data_has_difvifs {
                    explain(
                        fmt.i - 1,
                        1,
                        KindOfData::Protocol,
                        Understanding::Full,
                        format!("{vife:02X} vife"),
                    );
                }
            } else if combinable_extension_vif {
                combinable_full_vif |= (vife & 0x7f) as u16;
                combinable_extension_vif = false;
                let vc = to_vif_combinable(combinable_full_vif);
                if vc != VifCombinable::None {
                    combinables.push(vc);
                }
                combinables_raw.push(combinable_full_vif);
                if data_has_difvifs {
                    explain(
                        fmt.i - 1,
                        1,
                        KindOfData::Protocol,
                        Understanding::Full,
                        format!("{vife:02X} combinable extension vife"),
                    );
                }
            } else {
                combinable_full_vif = (vife & 0x7f) as u16;
                if combinable_full_vif == 0x7c || combinable_full_vif == 0x7f {
                    // Marker for the extended combinable tables.
                    combinable_full_vif <<= 8;
                    combinable_extension_vif = true;
                    if data_has_difvifs {
                        explain(
                            fmt.i - 1,
                            1,
                            KindOfData::Protocol,
                            Understanding::Full,
                            format!("{vife:02X} combinable vif"),
                        );
                    }
                } else {
                    let vc = to_vif_combinable(combinable_full_vif);
                    if vc != VifCombinable::None {
                        combinables.push(vc);
                    }
                    combinables_raw.push(combinable_full_vif);
                    if data_has_difvifs {
                        explain(
                            fmt.i - 1,
                            1,
                            KindOfData::Protocol,
                            Understanding::Full,
                            format!("{vife:02X} combinable vif ({vc:?})"),
                        );
                    }
                }
            }
        }

        if data_has_difvifs {
            di = fmt.i;
        }

        let dv = encode_hex_upper(&id_bytes);
        let count = dv_count.entry(dv.clone()).or_insert(0);
        *count += 1;
        let key = if *count > 1 {
            format!("{dv}_{count}")
        } else {
            dv
        };
        trace!("(dvparser) difvif key is {key}");

        let mut remaining = data.len().saturating_sub(di);
        if remaining == 0 {
            debug!("(dvparser) warning: unexpected end of data");
            break;
        }

        let mut datalen = match width {
            DifWidth::Fixed(n) => n,
            DifWidth::Variable => {
                let len = data[di] as usize;
                explain(
                    di,
                    1,
                    KindOfData::Protocol,
                    Understanding::Full,
                    format!("{:02X} varlen={len}", data[di]),
                );
                di += 1;
                remaining -= 1;
                len
            }
            DifWidth::Special => unreachable!("handled above"),
        };
        if remaining < datalen {
            debug!("(dvparser) warning: unexpected end of data");
            datalen = remaining.saturating_sub(1);
        }

        let value = encode_hex_upper(&data[di..di + datalen]);
        let offset = offset_base + di;

        let entry = DVEntry {
            offset,
            dif_vif_key: DifVifKey::new(&key),
            measurement_type: mt,
            vif: full_vif,
            combinable_vifs: combinables,
            combinable_vifs_raw: combinables_raw,
            storage_nr,
            tariff_nr: tariff,
            subunit_nr: subunit,
            value: value.clone(),
        };
        trace!(
            "(dvparser) entry {}: {} vif={:x} st={} ta={} su={}",
            entry.offset,
            entry.dif_vif_key,
            entry.vif,
            entry.storage_nr,
            entry.tariff_nr,
            entry.subunit_nr
        );
        result.entries.insert(key, (offset, entry));

        if !value.is_empty() {
            explain(di, datalen, KindOfData::Content, Understanding::None, value);
        }
        di += datalen;
        if data_has_difvifs {
            fmt.i = di;
        }

        if di >= data.len() {
            break;
        }
    }

    let hash = crc16_en13757(&format_run);
    result.format_signature = hash;
    if data_has_difvifs && !format_run.is_empty() {
        format_cache::remember_format(hash, &format_run);
    }

    result
}

/// Extract a double from a keyed entry. Auto-scaled, unsigned.
pub fn extract_dv_double(entries: &DvEntries, key: &str) -> Option<(usize, f64)> {
    let (offset, e) = entries.get(key)?;
    Some((*offset, e.extract_double(true, false)?))
}

/// Extract the raw hex string of a keyed entry.
pub fn extract_dv_hex_string(entries: &DvEntries, key: &str) -> Option<(usize, String)> {
    let (offset, e) = entries.get(key)?;
    Some((*offset, e.value.clone()))
}

/// Extract a date from a keyed entry.
pub fn extract_dv_date(entries: &DvEntries, key: &str) -> Option<(usize, FieldDate)> {
    let (offset, e) = entries.get(key)?;
    Some((*offset, e.extract_date()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::decode_hex_flex;

    fn parse(hexdata: &str) -> DvEntries {
        let bytes = decode_hex_flex(hexdata).unwrap();
        parse_dv(&bytes, 0, None, None).entries
    }

    fn check_double(entries: &DvEntries, key: &str, expected: f64) {
        let (_, v) = extract_dv_double(entries, key).expect(key);
        assert!((v - expected).abs() < 1e-9, "{key}: got {v} expected {expected}");
    }

    #[test]
    fn test_basic_records() {
        let entries =
            parse("2F 2F 0B 13 56 34 12 8B 82 00 93 3E 67 45 23 0D FD 10 0A 30 31 32 33 34 35 36 37 38 39 0F 88 2F");
        check_double(&entries, "0B13", 123.456);
        check_double(&entries, "8B8200933E", 234.567);
        let (_, s) = extract_dv_hex_string(&entries, "0DFD10").unwrap();
        assert_eq!(s, "30313233343536373839");
    }

    #[test]
    fn test_g_date() {
        let entries = parse("82046C 5F1C");
        let (_, d) = extract_dv_date(&entries, "82046C").unwrap();
        assert_eq!(d.to_string(), "2010-12-31");
    }

    #[test]
    fn test_g_date_other() {
        let entries = parse("426C FE04");
        let (_, d) = extract_dv_date(&entries, "426C").unwrap();
        assert_eq!(d.to_string(), "2007-04-30");
    }

    #[test]
    fn test_long_telegram_with_storage_counters() {
        let entries = parse(
            "0C1348550000426CE1F14C130000000082046C21298C0413330000008D04931E3A3CFE3300000033000000330000003300000033000000330000003300000033000000330000003300000033000000330000004300000034180000046D0D0B5C2B03FD6C5E150082206C5C290BFD0F0200018C4079678885238310FD3100000082106C01018110FD610002FD66020002FD170000",
        );
        check_double(&entries, "0C13", 5.548);
        let (_, d) = extract_dv_date(&entries, "426C").unwrap();
        assert_eq!(d.to_string(), "2127-01-01");
        let (_, d2) = extract_dv_date(&entries, "82106C").unwrap();
        assert_eq!(d2.to_string(), "2000-01-01");
    }

    #[test]
    fn test_duplicate_keys_get_suffixes() {
        let entries = parse("0B13563412 0B13563412 0B13999999");
        assert!(entries.contains_key("0B13"));
        assert!(entries.contains_key("0B13_2"));
        assert!(entries.contains_key("0B13_3"));
        check_double(&entries, "0B13_3", 999.999);
    }

    #[test]
    fn test_signed_bcd_negative() {
        // 6 digit BCD with F in the sign nibble position.
        let entries = parse("0B13 56 34 F2");
        let (_, e) = entries.get("0B13").unwrap();
        let v = e.extract_double(true, true).unwrap();
        assert!((v - (-23.456)).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn test_signed_int_extension() {
        // 16 bit -1 with plain scale.
        let entries = parse("02FF20FFFF");
        let (_, e) = entries.get("02FF20").unwrap();
        assert_eq!(e.extract_double(false, true).unwrap(), -1.0);
        assert_eq!(e.extract_double(false, false).unwrap(), 65535.0);
    }

    #[test]
    fn test_storage_tariff_subunit_counters() {
        // DIF 8C with DIFE 04: storage lsb 0, dife storage bits 4 -> 8.
        let entries = parse("8C0413 33000000");
        let (_, e) = entries.get("8C0413").unwrap();
        assert_eq!(e.storage_nr, 8);
        // DIF 84 with DIFE 10: tariff bits 01 -> tariff 1.
        let entries = parse("841013 33000000");
        let (_, e) = entries.get("841013").unwrap();
        assert_eq!(e.tariff_nr, 1);
        assert_eq!(e.storage_nr, 0);
        // DIFE 40: subunit bit set.
        let entries = parse("844013 33000000");
        let (_, e) = entries.get("844013").unwrap();
        assert_eq!(e.subunit_nr, 1);
    }

    #[test]
    fn test_variable_length_record() {
        let entries = parse("0DFD10 0A 30313233343536373839");
        let (_, e) = entries.get("0DFD10").unwrap();
        assert_eq!(e.value, "30313233343536373839");
        assert_eq!(e.extract_readable_string(), "9876543210");
    }

    #[test]
    fn test_mfct_data_stops_parse() {
        let bytes = decode_hex_flex("0B13563412 0F DEADBEEF").unwrap();
        let r = parse_dv(&bytes, 0, None, None);
        assert!(r.entries.contains_key("0B13"));
        assert_eq!(r.entries.len(), 1);
        assert_eq!(r.mfct_0f_index, Some(6));
    }

    #[test]
    fn test_compact_format_reuse() {
        // Parse a full record section, then reparse only the data bytes
        // using the remembered format.
        let full = decode_hex_flex("0B135634128B8200933E674523").unwrap();
        let r1 = parse_dv(&full, 0, None, None);
        let sig = r1.format_signature;

        let format = format_cache::lookup_format(sig).expect("format remembered");
        let data_only = decode_hex_flex("5634126745 23").unwrap();
        let r2 = parse_dv(&data_only, 0, Some(&format), None);

        check_double(&r2.entries, "0B13", 123.456);
        check_double(&r2.entries, "8B8200933E", 234.567);
    }

    #[test]
    fn test_float_record() {
        // DIF 05 = 32 bit real, value 1.0f.
        let entries = parse("0513 0000803F");
        let (_, e) = entries.get("0513").unwrap();
        let v = e.extract_double(false, false).unwrap();
        assert!((v - 1.0).abs() < 1e-9);
    }
}
