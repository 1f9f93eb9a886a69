//! # Telegram Model
//!
//! A [`Telegram`] accumulates the state of all link/transport layers as the
//! parser walks a frame: DLL addressing, optional extended link layer,
//! optional authentication/fragmentation layer, transport header, and
//! finally the decoded data records. Every byte span the parser touches is
//! recorded as an [`Explanation`] so a telegram can be pretty printed for
//! diagnostics even when parsing or decryption fails half way.

pub mod dedup;
pub mod format_cache;
pub mod frame;
pub mod parser;

use serde::Serialize;

use crate::address::Address;
use crate::constants::{AflAuthenticationType, EllSecurityMode, TplSecurityMode};
use crate::payload::dvparser::DvEntries;
use crate::util::crypto::AesKey;

/// Where a telegram came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FrameType {
    #[default]
    WMBus,
    MBus,
}

/// Receive-side metadata attached by the bus device.
#[derive(Debug, Clone, Default)]
pub struct AboutTelegram {
    /// Description of the receiving device, eg `im871a[12345678]`.
    pub device: String,
    /// Best effort conversion into dBm.
    pub rssi_dbm: i32,
    pub frame_type: FrameType,
}

impl AboutTelegram {
    pub fn new(device: &str, rssi_dbm: i32, frame_type: FrameType) -> Self {
        AboutTelegram {
            device: device.to_string(),
            rssi_dbm,
            frame_type,
        }
    }
}

/// Protocol bytes (headers, dif/vif) or content bytes (the values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindOfData {
    Protocol,
    Content,
}

/// How well a byte span was understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Understanding {
    None,
    Encrypted,
    Compressed,
    Partial,
    Full,
}

/// Annotation of one byte span in the frame.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub pos: usize,
    pub len: usize,
    pub info: String,
    pub kind: KindOfData,
    pub understanding: Understanding,
}

impl Explanation {
    pub fn new(pos: usize, len: usize, info: String, kind: KindOfData, understanding: Understanding) -> Self {
        Explanation {
            pos,
            len,
            info,
            kind,
            understanding,
        }
    }
}

/// Per meter AES-128 key material.
#[derive(Debug, Clone, Default)]
pub struct MeterKeys {
    pub confidentiality_key: Option<AesKey>,
    pub authentication_key: Option<AesKey>,
}

impl MeterKeys {
    pub fn has_confidentiality_key(&self) -> bool {
        self.confidentiality_key.is_some()
    }
}

/// Categorised parse failures, kept on the telegram for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelegramError {
    #[error("incomplete frame")]
    IncompleteFrame,
    #[error("bad crc")]
    BadCrc,
    #[error("bad checksum")]
    BadChecksum,
    #[error("unknown ci field 0x{0:02x}")]
    UnknownCi(u8),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("mac check failed")]
    MacFailed,
    #[error("bad frame format")]
    BadFormat,
    #[error("compact frame with unknown format signature 0x{0:04x}")]
    FormatSignatureMiss(u16),
}

/// Parsed state of one telegram.
#[derive(Debug, Default)]
pub struct Telegram {
    pub about: AboutTelegram,

    /// The ids seen across layers; the last one is the effective meter id.
    pub addresses: Vec<Address>,

    pub triggered_warning: bool,
    pub decryption_failed: bool,
    /// First categorised error, if any. Parsing continues past some errors
    /// to fill in the explanation trail.
    pub error: Option<TelegramError>,

    // DLL
    pub dll_len: usize,
    pub dll_c: u8,
    pub dll_mfct_b: [u8; 2],
    pub dll_mfct: u16,
    pub dll_a: Vec<u8>,
    pub dll_id_b: [u8; 4],
    pub dll_id: String,
    pub dll_version: u8,
    pub dll_type: u8,

    // MBus wired specifics.
    pub mbus_primary_address: u8,
    pub mbus_ci: u8,

    // ELL
    pub ell_ci: u8,
    pub ell_cc: u8,
    pub ell_acc: u8,
    pub ell_sn_b: [u8; 4],
    pub ell_sn: u32,
    pub ell_sn_session: u8,
    pub ell_sn_time: u32,
    pub ell_sn_sec: u8,
    pub ell_sec_mode: EllSecurityMode,
    pub ell_pl_crc: u16,
    pub ell_mfct_b: [u8; 2],
    pub ell_mfct: u16,
    pub ell_id_found: bool,
    pub ell_id_b: [u8; 6],

    // AFL
    pub afl_ci: u8,
    pub afl_len: u8,
    pub afl_fc: u16,
    pub afl_mcl: u8,
    pub afl_ki_found: bool,
    pub afl_ki: u16,
    pub afl_counter_found: bool,
    pub afl_counter_b: [u8; 4],
    pub afl_counter: u32,
    pub afl_mlen_found: bool,
    pub afl_mlen: usize,
    pub afl_auth_type: AflAuthenticationType,
    pub must_check_mac: bool,
    pub afl_mac_b: Vec<u8>,

    // TPL
    pub tpl_start: usize,
    pub tpl_ci: u8,
    pub tpl_acc: u8,
    pub tpl_sts: u8,
    pub tpl_sts_offset: usize,
    pub tpl_cfg: u16,
    pub tpl_sec_mode: TplSecurityMode,
    pub tpl_num_encr_blocks: usize,
    pub tpl_cfg_ext: u8,
    pub tpl_kdf_selection: u8,
    pub tpl_generated_key: Option<AesKey>,
    pub tpl_generated_mac_key: Option<AesKey>,
    pub tpl_id_found: bool,
    pub tpl_a: Vec<u8>,
    pub tpl_id_b: [u8; 4],
    pub tpl_mfct_b: [u8; 2],
    pub tpl_mfct: u16,
    pub tpl_version: u8,
    pub tpl_type: u8,

    /// Compact frame format signature, when CI 0x79 was seen.
    pub format_signature: u16,

    /// Frame content, ciphertext replaced by plaintext after decryption.
    pub frame: Vec<u8>,
    /// Size of all headers before the APL records.
    pub header_size: usize,
    /// Trailing bytes after the APL records, usually empty but can be MACs.
    pub suffix_size: usize,
    /// Index just past a 0x0F manufacturer-data marker inside the APL.
    pub mfct_0f_index: Option<usize>,
    /// Per driver legacy quirk: treat data from this APL index on as
    /// manufacturer specific even without a 0x0F marker.
    pub force_mfct_index: Option<usize>,

    /// Set once a meter has accepted the telegram.
    pub handled: bool,

    pub explanations: Vec<Explanation>,
    pub dv_entries: DvEntries,

    being_analyzed: bool,
}

impl Telegram {
    pub fn new(about: AboutTelegram) -> Telegram {
        Telegram {
            about,
            ..Telegram::default()
        }
    }

    pub fn mark_as_being_analyzed(&mut self) {
        self.being_analyzed = true;
    }

    pub fn being_analyzed(&self) -> bool {
        self.being_analyzed
    }

    pub fn add_explanation(
        &mut self,
        pos: usize,
        len: usize,
        kind: KindOfData,
        understanding: Understanding,
        info: String,
    ) {
        self.explanations.push(Explanation::new(pos, len, info, kind, understanding));
    }

    /// Ids separated by commas, for logs.
    pub fn ids_comma_separated(&self) -> String {
        Address::concat(&self.addresses)
    }

    /// The whole frame, after any in place decryption.
    pub fn extract_frame(&self) -> Vec<u8> {
        self.frame.clone()
    }

    /// The APL record bytes between header and suffix.
    pub fn extract_payload(&self) -> Vec<u8> {
        if self.header_size > self.frame.len() {
            return Vec::new();
        }
        let end = self.frame.len().saturating_sub(self.suffix_size);
        self.frame[self.header_size..end].to_vec()
    }

    /// Manufacturer specific bytes after a 0x0F marker, if present.
    pub fn extract_mfct_data(&self) -> Vec<u8> {
        match self.mfct_0f_index {
            Some(i) if self.header_size + i <= self.frame.len() => {
                self.frame[self.header_size + i..].to_vec()
            }
            _ => Vec::new(),
        }
    }

    /// Render the annotated byte-by-byte breakdown, the `analyze` view.
    pub fn analyze_parse(&self) -> String {
        let mut out = String::new();
        let mut sorted: Vec<&Explanation> = self.explanations.iter().collect();
        sorted.sort_by_key(|e| e.pos);
        for e in &sorted {
            let end = (e.pos + e.len).min(self.frame.len());
            let bytes = if e.pos < self.frame.len() {
                crate::util::hex::encode_hex_upper(&self.frame[e.pos..end])
            } else {
                String::new()
            };
            let marker = match e.understanding {
                Understanding::None => "?",
                Understanding::Encrypted => "E",
                Understanding::Compressed => "C",
                Understanding::Partial => "p",
                Understanding::Full => " ",
            };
            out.push_str(&format!("{:03} {marker} {bytes}: {}\n", e.pos, e.info));
        }
        out
    }

    /// Which registered drivers would detect this telegram?
    pub fn auto_detect_possible_drivers(&self) -> Vec<String> {
        let mut names = crate::meters::registry::drivers_detecting(self.dll_mfct, self.dll_type, self.dll_version);
        if self.tpl_id_found {
            for n in crate::meters::registry::drivers_detecting(self.tpl_mfct, self.tpl_type, self.tpl_version) {
                if !names.contains(&n) {
                    names.push(n);
                }
            }
        }
        names
    }
}
