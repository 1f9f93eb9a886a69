//! # Layered Telegram Parsing
//!
//! A frame unwraps strictly top-down: DLL, then (by CI field) the optional
//! extended link layer, the optional authentication/fragmentation layer,
//! and the transport layer, whose configuration word selects the
//! decryption applied to the application payload. Decryption happens in
//! place so the record walker always sees plaintext at the same offsets.
//!
//! Failures never abort bookkeeping: each layer records what it understood
//! as explanations, sets a categorised error and the `decryption_failed`
//! flag where applicable, and the caller decides whether the telegram is
//! still dispatched to meters.

use std::collections::HashSet;
use std::sync::Mutex;

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::address::Address;
use crate::constants::*;
use crate::payload::dvparser::parse_dv;
use crate::telegram::format_cache;
use crate::telegram::frame::mbus_checksum_ok;
use crate::telegram::{FrameType, KindOfData, MeterKeys, Telegram, TelegramError, Understanding};
use crate::util::crc::crc16_en13757;
use crate::util::crypto::{aes_cbc_decrypt, aes_cmac, aes_ctr_transform, AesKey};
use crate::util::hex::encode_hex_upper;

use KindOfData::{Content, Protocol};
use Understanding::{Encrypted, Full};

/// Build the id string for four little-endian BCD id bytes.
pub fn id_string_from_bytes(id_b: &[u8; 4]) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", id_b[3], id_b[2], id_b[1], id_b[0])
}

/// IV for TPL security mode 5: manufacturer, A-field, then the access
/// counter repeated out to the block size.
pub fn build_tpl_cbc_iv(mfct_b: &[u8; 2], a_field: &[u8], acc: u8) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0] = mfct_b[0];
    iv[1] = mfct_b[1];
    iv[2..8].copy_from_slice(&a_field[0..6]);
    for b in iv[8..16].iter_mut() {
        *b = acc;
    }
    iv
}

/// IV for ELL security mode 1: manufacturer, A-field, CC, SN, then zeroed
/// frame and block counters.
pub fn build_ell_ctr_iv(mfct_b: &[u8; 2], a_field: &[u8], cc: u8, sn_b: &[u8; 4]) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0] = mfct_b[0];
    iv[1] = mfct_b[1];
    iv[2..8].copy_from_slice(&a_field[0..6]);
    iv[8] = cc;
    iv[9..13].copy_from_slice(sn_b);
    // FN and BC start at zero.
    iv
}

/// Derive the per-session confidentiality and MAC keys (security mode 7
/// and relatives) from the meter key. The CMAC input is a purpose byte
/// (0x00 confidentiality, 0x01 authentication), the message counter, the
/// meter id, padded with 0x07 to one block.
pub fn derive_session_keys(
    master: &AesKey,
    counter_b: &[u8; 4],
    id_b: &[u8; 4],
) -> (AesKey, AesKey) {
    let mut input = [0x07u8; 16];
    input[0] = 0x00;
    input[1..5].copy_from_slice(counter_b);
    input[5..9].copy_from_slice(id_b);
    let enc = aes_cmac(master, &input);

    input[0] = 0x01;
    let mac = aes_cmac(master, &input);

    (
        AesKey::from_bytes(&enc).expect("cmac output is one block"),
        AesKey::from_bytes(&mac).expect("cmac output is one block"),
    )
}

// Remember (id, mfct, type, version) quadruples we already warned for, so
// a noisy neighbour cannot flood the logs.
static WARNED_TELEGRAMS: Lazy<Mutex<HashSet<(String, u16, u8, u8)>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// True if a warning was already emitted for this meter identity.
pub fn warned_for_telegram_before(id: &str, mfct: u16, mtype: u8, version: u8) -> bool {
    let mut set = WARNED_TELEGRAMS.lock().unwrap();
    !set.insert((id.to_string(), mfct, mtype, version))
}

impl Telegram {
    fn reset_parse(&mut self) {
        self.addresses.clear();
        self.explanations.clear();
        self.dv_entries.clear();
        self.decryption_failed = false;
        self.error = None;
        self.header_size = 0;
        self.suffix_size = 0;
        self.mfct_0f_index = None;
    }

    fn fail(&mut self, e: TelegramError) -> bool {
        if self.error.is_none() {
            self.error = Some(e);
        }
        false
    }

    /// Parse only far enough to learn the telegram's addresses, without
    /// keys and without warnings. Used to decide which meter the telegram
    /// belongs to before decryption.
    pub fn parse_header(&mut self, input: &[u8]) -> bool {
        let keys = MeterKeys::default();
        self.parse_internal(input, &keys, false);
        !self.addresses.is_empty()
    }

    /// Full parse: all layers, decryption, record walk.
    pub fn parse(&mut self, input: &[u8], keys: &MeterKeys, warn: bool) -> bool {
        let ok = self.parse_internal(input, keys, warn);
        ok && !self.decryption_failed
    }

    fn parse_internal(&mut self, input: &[u8], keys: &MeterKeys, warn: bool) -> bool {
        self.reset_parse();
        self.frame = input.to_vec();
        match self.about.frame_type {
            FrameType::WMBus => self.parse_wmbus(keys, warn),
            FrameType::MBus => self.parse_mbus(keys, warn),
        }
    }

    // ---- wM-Bus ----------------------------------------------------------

    fn parse_wmbus(&mut self, keys: &MeterKeys, warn: bool) -> bool {
        let mut pos = 0usize;
        if !self.parse_dll(&mut pos) {
            return false;
        }
        if !self.parse_ell(&mut pos, keys, warn) {
            return false;
        }
        if !self.parse_afl(&mut pos) {
            return false;
        }
        self.parse_tpl(&mut pos, keys, warn)
    }

    fn parse_dll(&mut self, pos: &mut usize) -> bool {
        if self.frame.len() < 11 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        self.dll_len = self.frame[0] as usize;
        if self.frame.len() < self.dll_len + 1 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        self.dll_c = self.frame[1];
        self.dll_mfct_b = [self.frame[2], self.frame[3]];
        self.dll_mfct = u16::from_le_bytes(self.dll_mfct_b);
        self.dll_id_b = [self.frame[4], self.frame[5], self.frame[6], self.frame[7]];
        self.dll_id = id_string_from_bytes(&self.dll_id_b);
        self.dll_version = self.frame[8];
        self.dll_type = self.frame[9];
        self.dll_a = self.frame[4..10].to_vec();

        self.add_explanation(0, 1, Protocol, Full, format!("{:02X} length ({} bytes)", self.frame[0], self.dll_len));
        self.add_explanation(1, 1, Protocol, Full, format!("{:02X} dll-c ({})", self.dll_c, c_field_name(self.dll_c)));
        self.add_explanation(
            2,
            2,
            Protocol,
            Full,
            format!(
                "{} dll-mfct ({})",
                encode_hex_upper(&self.dll_mfct_b),
                crate::address::manufacturer_flag(self.dll_mfct)
            ),
        );
        self.add_explanation(4, 4, Protocol, Full, format!("{} dll-id ({})", encode_hex_upper(&self.dll_id_b), self.dll_id));
        self.add_explanation(8, 1, Protocol, Full, format!("{:02X} dll-version", self.dll_version));
        self.add_explanation(
            9,
            1,
            Protocol,
            Full,
            format!("{:02X} dll-type ({})", self.dll_type, media_type_name(self.dll_type)),
        );

        self.addresses.push(Address::new(
            &self.dll_id,
            self.dll_mfct,
            self.dll_version,
            self.dll_type,
        ));
        *pos = 10;
        true
    }

    fn parse_ell(&mut self, pos: &mut usize, keys: &MeterKeys, warn: bool) -> bool {
        let Some(&ci) = self.frame.get(*pos) else {
            return self.fail(TelegramError::IncompleteFrame);
        };
        if !matches!(ci, CI_ELL_2 | CI_ELL_8 | CI_ELL_10 | CI_ELL_16) {
            return true;
        }
        self.ell_ci = ci;
        self.add_explanation(*pos, 1, Protocol, Full, format!("{ci:02X} ell-ci"));
        *pos += 1;

        let need = match ci {
            CI_ELL_2 => 2,
            CI_ELL_8 => 8,
            CI_ELL_10 => 10,
            _ => 16,
        };
        if self.frame.len() < *pos + need {
            return self.fail(TelegramError::IncompleteFrame);
        }

        self.ell_cc = self.frame[*pos];
        self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} ell-cc", self.ell_cc));
        *pos += 1;
        self.ell_acc = self.frame[*pos];
        self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} ell-acc", self.ell_acc));
        *pos += 1;

        if matches!(ci, CI_ELL_10 | CI_ELL_16) {
            self.ell_mfct_b = [self.frame[*pos], self.frame[*pos + 1]];
            self.ell_mfct = u16::from_le_bytes(self.ell_mfct_b);
            self.add_explanation(*pos, 2, Protocol, Full, format!("{} ell-mfct", encode_hex_upper(&self.ell_mfct_b)));
            *pos += 2;
            self.ell_id_b.copy_from_slice(&self.frame[*pos..*pos + 6]);
            self.ell_id_found = true;
            self.add_explanation(*pos, 6, Protocol, Full, format!("{} ell-id", encode_hex_upper(&self.ell_id_b)));
            *pos += 6;
        }

        if matches!(ci, CI_ELL_8 | CI_ELL_16) {
            self.ell_sn_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
            self.ell_sn = u32::from_le_bytes(self.ell_sn_b);
            self.ell_sn_session = (self.ell_sn & 0x0f) as u8;
            self.ell_sn_time = (self.ell_sn >> 4) & 0x01ff_ffff;
            self.ell_sn_sec = ((self.ell_sn >> 29) & 0x07) as u8;
            self.ell_sec_mode = EllSecurityMode::from_bits(self.ell_sn_sec);
            self.add_explanation(
                *pos,
                4,
                Protocol,
                Full,
                format!(
                    "{} ell-sn (session={} time={} sec={})",
                    encode_hex_upper(&self.ell_sn_b),
                    self.ell_sn_session,
                    self.ell_sn_time,
                    self.ell_sec_mode.name()
                ),
            );
            *pos += 4;

            if self.ell_sec_mode == EllSecurityMode::AesCtr {
                self.decrypt_ell_aes_ctr(*pos, keys, warn);
            }

            // The payload crc is part of the (now decrypted) payload.
            if self.frame.len() < *pos + 2 {
                return self.fail(TelegramError::IncompleteFrame);
            }
            self.ell_pl_crc = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
            let computed = crc16_en13757(&self.frame[*pos + 2..]);
            if computed != self.ell_pl_crc {
                // Either we had no key, or the wrong one.
                self.decryption_failed = true;
                self.add_explanation(
                    *pos,
                    self.frame.len() - *pos,
                    Content,
                    Encrypted,
                    format!(
                        "ell payload crc mismatch (stored {:04x} calculated {computed:04x}), cannot decode",
                        self.ell_pl_crc
                    ),
                );
                if warn && !warned_for_telegram_before(&self.dll_id, self.dll_mfct, self.dll_type, self.dll_version) {
                    warn!(
                        "(wmbus) telegram from {} failed ell payload crc check, wrong or missing key?",
                        self.dll_id
                    );
                    self.triggered_warning = true;
                }
                return self.fail(TelegramError::DecryptionFailed);
            }
            self.add_explanation(*pos, 2, Protocol, Full, format!("{:04X} ell-pl-crc", self.ell_pl_crc));
            *pos += 2;
        }

        true
    }

    fn decrypt_ell_aes_ctr(&mut self, pos: usize, keys: &MeterKeys, _warn: bool) {
        let Some(key) = &keys.confidentiality_key else {
            debug!("(wmbus) ell aes-ctr but no key, leaving content encrypted");
            return;
        };
        let iv = build_ell_ctr_iv(&self.dll_mfct_b, &self.dll_a, self.ell_cc, &self.ell_sn_b);
        let plain = aes_ctr_transform(key, &iv, &self.frame[pos..]);
        self.frame.splice(pos.., plain);
        debug!("(wmbus) decrypted ell aes-ctr content");
    }

    fn parse_afl(&mut self, pos: &mut usize) -> bool {
        let Some(&ci) = self.frame.get(*pos) else {
            return self.fail(TelegramError::IncompleteFrame);
        };
        if ci != CI_AFL && ci != CI_AFL_FRAGMENT {
            return true;
        }
        self.afl_ci = ci;
        self.add_explanation(*pos, 1, Protocol, Full, format!("{ci:02X} afl-ci"));
        *pos += 1;
        if self.frame.len() < *pos + 3 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        self.afl_len = self.frame[*pos];
        self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} afl-len", self.afl_len));
        *pos += 1;
        self.afl_fc = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
        self.add_explanation(*pos, 2, Protocol, Full, format!("{:04X} afl-fc", self.afl_fc));
        *pos += 2;

        let has_mcl = self.afl_fc & 0x2000 != 0;
        let has_mlen = self.afl_fc & 0x1000 != 0;
        let has_mcr = self.afl_fc & 0x0800 != 0;
        let has_mac = self.afl_fc & 0x0400 != 0;
        let has_ki = self.afl_fc & 0x0200 != 0;

        if has_mcl {
            if self.frame.len() < *pos + 1 {
                return self.fail(TelegramError::IncompleteFrame);
            }
            self.afl_mcl = self.frame[*pos];
            self.afl_auth_type = AflAuthenticationType::from_bits(self.afl_mcl & 0x0f);
            self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} afl-mcl", self.afl_mcl));
            *pos += 1;
        }
        if has_ki {
            if self.frame.len() < *pos + 2 {
                return self.fail(TelegramError::IncompleteFrame);
            }
            self.afl_ki = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
            self.afl_ki_found = true;
            self.add_explanation(*pos, 2, Protocol, Full, format!("{:04X} afl-ki", self.afl_ki));
            *pos += 2;
        }
        if has_mcr {
            if self.frame.len() < *pos + 4 {
                return self.fail(TelegramError::IncompleteFrame);
            }
            self.afl_counter_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
            self.afl_counter = u32::from_le_bytes(self.afl_counter_b);
            self.afl_counter_found = true;
            self.add_explanation(*pos, 4, Protocol, Full, format!("{} afl-mcr ({})", encode_hex_upper(&self.afl_counter_b), self.afl_counter));
            *pos += 4;
        }
        if has_mlen {
            if self.frame.len() < *pos + 2 {
                return self.fail(TelegramError::IncompleteFrame);
            }
            self.afl_mlen = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]) as usize;
            self.afl_mlen_found = true;
            self.add_explanation(*pos, 2, Protocol, Full, format!("afl-mlen ({})", self.afl_mlen));
            *pos += 2;
        }
        if has_mac {
            let mac_len = self.afl_auth_type.mac_len();
            if self.frame.len() < *pos + mac_len {
                return self.fail(TelegramError::IncompleteFrame);
            }
            self.afl_mac_b = self.frame[*pos..*pos + mac_len].to_vec();
            self.must_check_mac = !self.afl_mac_b.is_empty();
            self.add_explanation(*pos, mac_len, Protocol, Full, format!("{} afl-mac", encode_hex_upper(&self.afl_mac_b)));
            *pos += mac_len;
        }
        true
    }

    // ---- TPL -------------------------------------------------------------

    fn parse_tpl(&mut self, pos: &mut usize, keys: &MeterKeys, warn: bool) -> bool {
        let Some(&ci) = self.frame.get(*pos) else {
            return self.fail(TelegramError::IncompleteFrame);
        };
        self.tpl_ci = ci;
        self.tpl_start = *pos;

        match ci {
            CI_APL_NO_TPL => {
                self.add_explanation(*pos, 1, Protocol, Full, format!("{ci:02X} tpl-ci (no header)"));
                *pos += 1;
                self.header_size = *pos;
                self.parse_records(None)
            }
            CI_TPL_COMPACT => self.parse_tpl_compact(pos),
            CI_TPL_SHORT => {
                self.add_explanation(*pos, 1, Protocol, Full, format!("{ci:02X} tpl-ci (short header)"));
                *pos += 1;
                if !self.parse_short_tpl(pos, keys) {
                    return false;
                }
                if !self.potentially_decrypt(*pos, keys, warn) {
                    return false;
                }
                self.header_size = *pos;
                self.parse_records(None)
            }
            CI_TPL_LONG => {
                self.add_explanation(*pos, 1, Protocol, Full, format!("{ci:02X} tpl-ci (long header)"));
                *pos += 1;
                if !self.parse_long_tpl(pos, keys) {
                    return false;
                }
                if !self.potentially_decrypt(*pos, keys, warn) {
                    return false;
                }
                self.header_size = *pos;
                self.parse_records(None)
            }
            0xa0..=0xb7 => {
                // Manufacturer specific payload, no transport header and
                // no DIF/VIF records. Drivers that opt in pick the bytes
                // up through their content processors.
                self.add_explanation(*pos, 1, Protocol, Full, format!("{ci:02X} tpl-ci (mfct specific)"));
                *pos += 1;
                self.header_size = *pos;
                let end = self.frame.len().saturating_sub(self.suffix_size);
                if end > *pos {
                    let value = encode_hex_upper(&self.frame[*pos..end]);
                    self.add_explanation(
                        *pos,
                        end - *pos,
                        Content,
                        Understanding::None,
                        format!("manufacturer specific data {value}"),
                    );
                }
                true
            }
            _ => {
                self.add_explanation(
                    *pos,
                    1,
                    Protocol,
                    Understanding::None,
                    format!("{ci:02X} unknown ci field"),
                );
                self.fail(TelegramError::UnknownCi(ci))
            }
        }
    }

    fn parse_tpl_compact(&mut self, pos: &mut usize) -> bool {
        self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} tpl-ci (compact frame)", CI_TPL_COMPACT));
        *pos += 1;
        if self.frame.len() < *pos + 4 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        self.format_signature = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
        self.add_explanation(*pos, 2, Protocol, Full, format!("format signature {:04x}", self.format_signature));
        *pos += 2;
        let data_crc = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
        self.add_explanation(*pos, 2, Protocol, Full, format!("data crc {data_crc:04x}"));
        *pos += 2;

        let Some(format_bytes) = format_cache::lookup_format(self.format_signature) else {
            self.add_explanation(
                *pos,
                self.frame.len() - *pos,
                Content,
                Understanding::Compressed,
                format!(
                    "compressed data with unknown format signature {:04x}, waiting for a full frame",
                    self.format_signature
                ),
            );
            debug!(
                "(wmbus) unknown format signature {:04x}, cannot decode compact frame yet",
                self.format_signature
            );
            return self.fail(TelegramError::FormatSignatureMiss(self.format_signature));
        };

        let computed = crc16_en13757(&self.frame[*pos..]);
        if computed != data_crc {
            debug!("(wmbus) compact frame data crc mismatch, stored {data_crc:04x} calculated {computed:04x}");
            return self.fail(TelegramError::BadCrc);
        }

        self.header_size = *pos;
        self.parse_records(Some(format_bytes))
    }

    fn parse_short_tpl(&mut self, pos: &mut usize, keys: &MeterKeys) -> bool {
        if self.frame.len() < *pos + 4 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        self.tpl_acc = self.frame[*pos];
        self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} tpl-acc", self.tpl_acc));
        *pos += 1;
        self.tpl_sts = self.frame[*pos];
        self.tpl_sts_offset = *pos;
        self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} tpl-sts", self.tpl_sts));
        *pos += 1;
        self.parse_tpl_config(pos, keys)
    }

    fn parse_long_tpl(&mut self, pos: &mut usize, keys: &MeterKeys) -> bool {
        if self.frame.len() < *pos + 12 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        self.tpl_id_b.copy_from_slice(&self.frame[*pos..*pos + 4]);
        self.tpl_id_found = true;
        let tpl_id = id_string_from_bytes(&self.tpl_id_b);
        self.add_explanation(*pos, 4, Protocol, Full, format!("{} tpl-id ({tpl_id})", encode_hex_upper(&self.tpl_id_b)));
        *pos += 4;
        self.tpl_mfct_b = [self.frame[*pos], self.frame[*pos + 1]];
        self.tpl_mfct = u16::from_le_bytes(self.tpl_mfct_b);
        self.add_explanation(
            *pos,
            2,
            Protocol,
            Full,
            format!("{} tpl-mfct ({})", encode_hex_upper(&self.tpl_mfct_b), crate::address::manufacturer_flag(self.tpl_mfct)),
        );
        *pos += 2;
        self.tpl_version = self.frame[*pos];
        self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} tpl-version", self.tpl_version));
        *pos += 1;
        self.tpl_type = self.frame[*pos];
        self.add_explanation(*pos, 1, Protocol, Full, format!("{:02X} tpl-type ({})", self.tpl_type, media_type_name(self.tpl_type)));
        *pos += 1;
        self.tpl_a = self.frame[*pos - 8..*pos - 4].to_vec();
        self.tpl_a.push(self.tpl_version);
        self.tpl_a.push(self.tpl_type);

        self.addresses.push(Address::new(&tpl_id, self.tpl_mfct, self.tpl_version, self.tpl_type));

        self.parse_short_tpl(pos, keys)
    }

    fn parse_tpl_config(&mut self, pos: &mut usize, keys: &MeterKeys) -> bool {
        if self.frame.len() < *pos + 2 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        self.tpl_cfg = u16::from_le_bytes([self.frame[*pos], self.frame[*pos + 1]]);
        self.tpl_sec_mode = TplSecurityMode::from_bits(((self.tpl_cfg >> 8) & 0x1f) as u8);
        self.add_explanation(
            *pos,
            2,
            Protocol,
            Full,
            format!("{:04X} tpl-cfg ({})", self.tpl_cfg, self.tpl_sec_mode.name()),
        );
        *pos += 2;

        match self.tpl_sec_mode {
            TplSecurityMode::AesCbcIv | TplSecurityMode::AesCbcNoIv | TplSecurityMode::AesCtrCmac => {
                self.tpl_num_encr_blocks = ((self.tpl_cfg >> 4) & 0x0f) as usize;
            }
            _ => {}
        }

        if self.tpl_sec_mode == TplSecurityMode::AesCbcNoIv
            || self.tpl_sec_mode == TplSecurityMode::AesCtrCmac
        {
            // Profile B carries a configuration extension selecting the kdf.
            if self.frame.len() < *pos + 1 {
                return self.fail(TelegramError::IncompleteFrame);
            }
            self.tpl_cfg_ext = self.frame[*pos];
            self.tpl_kdf_selection = (self.tpl_cfg_ext >> 4) & 0x03;
            self.add_explanation(
                *pos,
                1,
                Protocol,
                Full,
                format!("{:02X} tpl-cfg-ext (kdf={})", self.tpl_cfg_ext, self.tpl_kdf_selection),
            );
            *pos += 1;

            if let Some(master) = &keys.confidentiality_key {
                let counter = if self.afl_counter_found {
                    self.afl_counter_b
                } else {
                    [self.tpl_acc, 0, 0, 0]
                };
                let id = if self.tpl_id_found { self.tpl_id_b } else { self.dll_id_b };
                let (enc, mac) = derive_session_keys(master, &counter, &id);
                self.tpl_generated_key = Some(enc);
                self.tpl_generated_mac_key = Some(mac);
            }
        }
        true
    }

    fn check_afl_mac(&mut self, warn: bool) {
        if !self.must_check_mac {
            return;
        }
        let Some(mac_key) = self.tpl_generated_mac_key.clone() else {
            return;
        };
        // CMAC over message control, message counter and the whole TPL.
        let mut input = Vec::with_capacity(5 + self.frame.len() - self.tpl_start);
        input.push(self.afl_mcl);
        input.extend_from_slice(&self.afl_counter_b);
        input.extend_from_slice(&self.frame[self.tpl_start..]);
        let computed = aes_cmac(&mac_key, &input);
        if computed[..self.afl_mac_b.len()] != self.afl_mac_b[..] {
            self.decryption_failed = true;
            if self.error.is_none() {
                self.error = Some(TelegramError::MacFailed);
            }
            if warn {
                warn!(
                    "(wmbus) telegram from {} failed afl mac check, wrong authentication key?",
                    self.dll_id
                );
                self.triggered_warning = true;
            }
        } else {
            debug!("(wmbus) afl mac verified ok");
        }
    }

    /// Decrypt the application payload in place per the TPL security mode.
    fn potentially_decrypt(&mut self, pos: usize, keys: &MeterKeys, warn: bool) -> bool {
        match self.tpl_sec_mode {
            TplSecurityMode::NoSecurity => true,
            TplSecurityMode::AesCbcIv => self.decrypt_tpl_cbc(pos, keys, warn, true),
            TplSecurityMode::AesCbcNoIv => {
                self.check_afl_mac(warn);
                self.decrypt_tpl_cbc(pos, keys, warn, false)
            }
            TplSecurityMode::AesCtrCmac => self.decrypt_tpl_ctr_cmac(pos, keys, warn),
            other => {
                self.add_explanation(
                    pos,
                    self.frame.len() - pos,
                    Content,
                    Encrypted,
                    format!("encrypted with unsupported security mode {}", other.name()),
                );
                self.decryption_failed = true;
                self.fail(TelegramError::DecryptionFailed)
            }
        }
    }

    fn encrypted_region_len(&self, pos: usize) -> usize {
        let remaining = self.frame.len() - pos;
        let mut n = if self.tpl_num_encr_blocks > 0 {
            self.tpl_num_encr_blocks * 16
        } else {
            remaining
        };
        if n > remaining {
            debug!("(wmbus) telegram says {} encrypted bytes but only {remaining} remain", n);
            n = remaining;
        }
        n - n % 16
    }

    fn decrypt_tpl_cbc(&mut self, pos: usize, keys: &MeterKeys, warn: bool, with_iv: bool) -> bool {
        let n = self.encrypted_region_len(pos);
        if n == 0 {
            return true;
        }

        // Mode 7 uses the kdf-derived session key, mode 5 the meter key.
        let key = if with_iv {
            keys.confidentiality_key.clone()
        } else {
            self.tpl_generated_key.clone().or_else(|| keys.confidentiality_key.clone())
        };
        let Some(key) = key else {
            self.add_explanation(pos, n, Content, Encrypted, "encrypted data, no key configured".to_string());
            self.decryption_failed = true;
            return self.fail(TelegramError::DecryptionFailed);
        };

        let iv = if with_iv {
            let (mfct_b, a_field) = if self.tpl_id_found {
                (&self.tpl_mfct_b, &self.tpl_a)
            } else {
                (&self.dll_mfct_b, &self.dll_a)
            };
            build_tpl_cbc_iv(mfct_b, a_field, self.tpl_acc)
        } else {
            [0u8; 16]
        };

        match aes_cbc_decrypt(&key, &iv, &self.frame[pos..pos + n]) {
            Ok(plain) => {
                self.frame.splice(pos..pos + n, plain);
            }
            Err(e) => {
                warn!("(wmbus) aes-cbc decrypt error: {e}");
                self.decryption_failed = true;
                return self.fail(TelegramError::DecryptionFailed);
            }
        }

        if self.frame[pos..pos + 2] != APL_DECRYPT_SENTINEL {
            self.decryption_failed = true;
            self.add_explanation(pos, n, Content, Encrypted, "decrypted data does not start with 2F2F, wrong key?".to_string());
            if warn && !warned_for_telegram_before(&self.dll_id, self.dll_mfct, self.dll_type, self.dll_version) {
                warn!("(wmbus) telegram from {} decryption failed, wrong key?", self.dll_id);
                self.triggered_warning = true;
            }
            return self.fail(TelegramError::DecryptionFailed);
        }
        debug!("(wmbus) decrypted {n} bytes with aes-cbc{}", if with_iv { "-iv" } else { "" });
        true
    }

    fn decrypt_tpl_ctr_cmac(&mut self, pos: usize, keys: &MeterKeys, warn: bool) -> bool {
        let n = self.frame.len() - pos;
        let Some(enc_key) = self
            .tpl_generated_key
            .clone()
            .or_else(|| keys.confidentiality_key.clone())
        else {
            self.add_explanation(pos, n, Content, Encrypted, "encrypted data, no key configured".to_string());
            self.decryption_failed = true;
            return self.fail(TelegramError::DecryptionFailed);
        };

        let (mfct_b, a_field) = if self.tpl_id_found {
            (self.tpl_mfct_b, self.tpl_a.clone())
        } else {
            (self.dll_mfct_b, self.dll_a.clone())
        };
        // Counter IV from the addressing fields and the access counter.
        let mut iv = [0u8; 16];
        iv[0] = mfct_b[0];
        iv[1] = mfct_b[1];
        iv[2..8].copy_from_slice(&a_field[0..6]);
        iv[8] = self.tpl_acc;
        let plain = aes_ctr_transform(&enc_key, &iv, &self.frame[pos..]);
        self.frame.splice(pos.., plain);

        if self.frame[pos..pos + 2.min(n)] != APL_DECRYPT_SENTINEL[..2.min(n)] {
            self.decryption_failed = true;
            self.add_explanation(pos, n, Content, Encrypted, "decrypted data does not start with 2F2F, wrong key?".to_string());
            if warn {
                warn!("(wmbus) telegram from {} decryption failed, wrong key?", self.dll_id);
                self.triggered_warning = true;
            }
            return self.fail(TelegramError::DecryptionFailed);
        }
        self.check_afl_mac(warn);
        !self.decryption_failed
    }

    // ---- Records ---------------------------------------------------------

    fn parse_records(&mut self, format: Option<Vec<u8>>) -> bool {
        let end = self.frame.len().saturating_sub(self.suffix_size);
        if self.header_size > end {
            return self.fail(TelegramError::IncompleteFrame);
        }
        let data = self.frame[self.header_size..end].to_vec();
        let result = parse_dv(
            &data,
            self.header_size,
            format.as_deref(),
            self.force_mfct_index,
        );
        self.dv_entries = result.entries;
        self.mfct_0f_index = result.mfct_0f_index;
        if format.is_none() {
            self.format_signature = result.format_signature;
        }
        self.explanations.extend(result.explanations);
        true
    }

    // ---- Wired M-Bus -----------------------------------------------------

    fn parse_mbus(&mut self, keys: &MeterKeys, warn: bool) -> bool {
        if self.frame.len() < 9 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        if self.frame[0] != MBUS_FRAME_LONG_START
            || self.frame[3] != MBUS_FRAME_LONG_START
            || self.frame[1] != self.frame[2]
        {
            return self.fail(TelegramError::BadFormat);
        }
        let len = self.frame[1] as usize;
        if self.frame.len() < len + 6 {
            return self.fail(TelegramError::IncompleteFrame);
        }
        if *self.frame.last().unwrap() != MBUS_FRAME_STOP {
            return self.fail(TelegramError::BadFormat);
        }
        if !mbus_checksum_ok(&self.frame) {
            return self.fail(TelegramError::BadChecksum);
        }
        self.dll_len = len;

        self.dll_c = self.frame[4];
        self.add_explanation(4, 1, Protocol, Full, format!("{:02X} mbus-c ({})", self.dll_c, c_field_name(self.dll_c)));
        self.mbus_primary_address = self.frame[5];
        self.add_explanation(5, 1, Protocol, Full, format!("{:02X} mbus-primary-address", self.mbus_primary_address));
        self.mbus_ci = self.frame[6];

        let mut primary = Address::new(&self.mbus_primary_address.to_string(), 0, 0, 0);
        primary.mbus_primary = true;
        self.addresses.push(primary);

        // Checksum and stop byte terminate the record section.
        self.suffix_size = 2;

        let mut pos = 6usize;
        self.parse_tpl(&mut pos, keys, warn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::AboutTelegram;
    use crate::util::hex::decode_hex_flex;

    fn wmbus_telegram(hex: &str) -> Telegram {
        let frame = decode_hex_flex(hex).unwrap();
        let mut t = Telegram::new(AboutTelegram::new("test", -77, FrameType::WMBus));
        let keys = MeterKeys::default();
        assert!(t.parse(&frame, &keys, false), "parse failed: {:?}", t.error);
        t
    }

    #[test]
    fn test_parse_kamheat_plain_c1() {
        let t = wmbus_telegram(
            "2E442D2C6767676730048D2039D1684020BCDB7803062C000043060000000314630000426C7F2A022D130001FF2100",
        );
        assert_eq!(t.dll_id, "67676767");
        assert_eq!(crate::address::manufacturer_flag(t.dll_mfct), "KAM");
        assert_eq!(t.dll_type, 0x04);
        assert_eq!(t.dll_version, 0x30);
        assert_eq!(t.ell_ci, 0x8d);
        assert_eq!(t.ell_sec_mode, crate::constants::EllSecurityMode::AesCtr);
        assert_eq!(t.tpl_ci, 0x78);

        // total energy 44 kwh
        let (_, e) = t.dv_entries.get("0306").expect("total energy record");
        assert_eq!(e.extract_double(true, false).unwrap(), 44.0);
        // total volume 0.99 m3
        let (_, e) = t.dv_entries.get("0314").expect("total volume record");
        assert!((e.extract_double(true, false).unwrap() - 0.99).abs() < 1e-9);
        // power 1.9 kw
        let (_, e) = t.dv_entries.get("022D").expect("power record");
        assert!((e.extract_double(true, false).unwrap() - 1.9).abs() < 1e-9);
        // target date 2019-10-31
        let (_, e) = t.dv_entries.get("426C").expect("target date record");
        assert_eq!(e.extract_date().unwrap().to_string(), "2019-10-31");
    }

    #[test]
    fn test_parse_mbus_long_frame() {
        let frame = decode_hex_flex(
            "68464668084a72447744772d2c3404060000000406ce86000004ff073444020004ff08f8ce0100041411680300043B0f02000002593c19025da41104ff220000000004a5ff21c7d02700d916",
        )
        .unwrap();
        let mut t = Telegram::new(AboutTelegram::new("mbus", 0, FrameType::MBus));
        let keys = MeterKeys::default();
        assert!(t.parse(&frame, &keys, false), "parse failed: {:?}", t.error);
        assert_eq!(t.tpl_id_found, true);
        assert_eq!(t.addresses.last().unwrap().id, "77447744");
        assert_eq!(crate::address::manufacturer_flag(t.tpl_mfct), "KAM");
        // total energy 34510 kwh
        let (_, e) = t.dv_entries.get("0406").expect("energy record");
        assert_eq!(e.extract_double(true, false).unwrap(), 34510.0);
        // operating time record with mfct combinable vife
        let (_, e) = t.dv_entries.get("04A5FF21").expect("operating time record");
        assert!(e
            .combinable_vifs
            .contains(&crate::payload::vif::VifCombinable::Mfct21));
    }

    #[test]
    fn test_unknown_ci_fails() {
        let frame = decode_hex_flex("0A442D2C67676767300477").unwrap();
        let mut t = Telegram::new(AboutTelegram::new("test", 0, FrameType::WMBus));
        let keys = MeterKeys::default();
        assert!(!t.parse(&frame, &keys, false));
        assert_eq!(t.error, Some(TelegramError::UnknownCi(0x77)));
        // Skeleton still available.
        assert_eq!(t.addresses[0].id, "67676767");
    }

    #[test]
    fn test_session_key_derivation_is_deterministic() {
        let master = AesKey::from_hex("000102030405060708090a0b0c0d0e0f").unwrap();
        let (e1, m1) = derive_session_keys(&master, &[1, 0, 0, 0], &[0x67, 0x67, 0x67, 0x67]);
        let (e2, m2) = derive_session_keys(&master, &[1, 0, 0, 0], &[0x67, 0x67, 0x67, 0x67]);
        assert_eq!(e1.as_bytes(), e2.as_bytes());
        assert_eq!(m1.as_bytes(), m2.as_bytes());
        assert_ne!(e1.as_bytes(), m1.as_bytes());
        let (e3, _) = derive_session_keys(&master, &[2, 0, 0, 0], &[0x67, 0x67, 0x67, 0x67]);
        assert_ne!(e1.as_bytes(), e3.as_bytes());
    }

    #[test]
    fn test_warned_before_rate_limits() {
        assert!(!warned_for_telegram_before("99990001", 0x2c2d, 4, 0x30));
        assert!(warned_for_telegram_before("99990001", 0x2c2d, 4, 0x30));
        assert!(!warned_for_telegram_before("99990002", 0x2c2d, 4, 0x30));
    }
}
