//! # Protocol Constants
//!
//! C-field and CI-field values for EN 13757-2/3/4 framing, plus the layer
//! security enumerations carried in ELL/AFL/TPL headers.

/// Send, no reply expected. The everyday wM-Bus broadcast.
pub const C_SND_NR: u8 = 0x44;
/// Send installation request.
pub const C_SND_IR: u8 = 0x46;
/// Send user data to meter.
pub const C_SND_UD: u8 = 0x53;
/// Request user data, FCB = 0.
pub const C_REQ_UD2: u8 = 0x5b;
/// Request user data, FCB = 1.
pub const C_REQ_UD2_FCB: u8 = 0x7b;
/// Response with user data.
pub const C_RSP_UD: u8 = 0x08;
/// ACK from meter.
pub const C_ACK: u8 = 0x00;
/// Link reset.
pub const C_SND_NKE: u8 = 0x40;

/// MBus wired long/control frame start byte.
pub const MBUS_FRAME_LONG_START: u8 = 0x68;
/// MBus wired short frame start byte.
pub const MBUS_FRAME_SHORT_START: u8 = 0x10;
/// MBus wired frame stop byte.
pub const MBUS_FRAME_STOP: u8 = 0x16;
/// Single character acknowledgement.
pub const MBUS_FRAME_ACK: u8 = 0xe5;

// CI fields selecting the next layer.
pub const CI_TPL_LONG: u8 = 0x72;
pub const CI_APL_NO_TPL: u8 = 0x78;
pub const CI_TPL_COMPACT: u8 = 0x79;
pub const CI_TPL_SHORT: u8 = 0x7a;
pub const CI_ELL_2: u8 = 0x8c;
pub const CI_ELL_8: u8 = 0x8d;
pub const CI_ELL_10: u8 = 0x8e;
pub const CI_ELL_16: u8 = 0x8f;
pub const CI_AFL: u8 = 0x90;
pub const CI_AFL_FRAGMENT: u8 = 0x91;

/// Decrypted application payloads must start with two idle fillers.
pub const APL_DECRYPT_SENTINEL: [u8; 2] = [0x2f, 0x2f];

/// Is this a C-field the wM-Bus receive path accepts?
pub fn is_valid_wmbus_c_field(c: u8) -> bool {
    matches!(c, C_SND_NR | C_SND_IR | C_SND_UD | C_ACK | C_REQ_UD2 | C_REQ_UD2_FCB | C_RSP_UD)
}

/// Is this a plausible mbus wired C-field?
pub fn is_valid_mbus_c_field(c: u8) -> bool {
    (0x10..=0x5f).contains(&c) || (0x68..=0x7f).contains(&c) || c == C_RSP_UD
}

pub fn c_field_name(c: u8) -> &'static str {
    match c {
        C_SND_NR => "SND_NR",
        C_SND_IR => "SND_IR",
        C_SND_UD => "SND_UD",
        C_REQ_UD2 => "REQ_UD2",
        C_REQ_UD2_FCB => "REQ_UD2-fcb",
        C_RSP_UD => "RSP_UD",
        C_ACK => "ACK",
        C_SND_NKE => "SND_NKE",
        _ => "?",
    }
}

/// Extended link layer security, 3 bits inside the session number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EllSecurityMode {
    #[default]
    NoSecurity,
    AesCtr,
    Reserved,
}

impl EllSecurityMode {
    pub fn from_bits(bits: u8) -> EllSecurityMode {
        match bits {
            0 => EllSecurityMode::NoSecurity,
            1 => EllSecurityMode::AesCtr,
            _ => EllSecurityMode::Reserved,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EllSecurityMode::NoSecurity => "NoSecurity",
            EllSecurityMode::AesCtr => "AES_CTR",
            EllSecurityMode::Reserved => "RESERVED",
        }
    }
}

/// Transport layer security, 5 bits of the TPL configuration word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TplSecurityMode {
    #[default]
    NoSecurity,
    MfctSpecific,
    DesNoIvDeprecated,
    DesIvDeprecated,
    Specific4,
    AesCbcIv,
    Reserved6,
    AesCbcNoIv,
    AesCtrCmac,
    AesGcm,
    AesCcm,
    Reserved11,
    Reserved12,
    Specific13,
    Reserved14,
    Specific15,
    Specific16Plus,
}

impl TplSecurityMode {
    pub fn from_bits(bits: u8) -> TplSecurityMode {
        use TplSecurityMode::*;
        match bits {
            0 => NoSecurity,
            1 => MfctSpecific,
            2 => DesNoIvDeprecated,
            3 => DesIvDeprecated,
            4 => Specific4,
            5 => AesCbcIv,
            6 => Reserved6,
            7 => AesCbcNoIv,
            8 => AesCtrCmac,
            9 => AesGcm,
            10 => AesCcm,
            11 => Reserved11,
            12 => Reserved12,
            13 => Specific13,
            14 => Reserved14,
            15 => Specific15,
            _ => Specific16Plus,
        }
    }

    pub fn name(&self) -> &'static str {
        use TplSecurityMode::*;
        match self {
            NoSecurity => "NoSecurity",
            MfctSpecific => "MFCT_SPECIFIC",
            DesNoIvDeprecated => "DES_NO_IV_DEPRECATED",
            DesIvDeprecated => "DES_IV_DEPRECATED",
            Specific4 => "SPECIFIC_4",
            AesCbcIv => "AES_CBC_IV",
            Reserved6 => "RESERVED_6",
            AesCbcNoIv => "AES_CBC_NO_IV",
            AesCtrCmac => "AES_CTR_CMAC",
            AesGcm => "AES_GCM",
            AesCcm => "AES_CCM",
            Reserved11 => "RESERVED_11",
            Reserved12 => "RESERVED_12",
            Specific13 => "SPECIFIC_13",
            Reserved14 => "RESERVED_14",
            Specific15 => "SPECIFIC_15",
            Specific16Plus => "SPECIFIC_16_31",
        }
    }
}

/// AFL authentication type nibble, with the MAC length it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AflAuthenticationType {
    #[default]
    NoAuth,
    Reserved1,
    Reserved2,
    AesCmac128_2,
    AesCmac128_4,
    AesCmac128_8,
    AesCmac128_12,
    AesCmac128_16,
    AesGmac128_12,
}

impl AflAuthenticationType {
    pub fn from_bits(bits: u8) -> AflAuthenticationType {
        use AflAuthenticationType::*;
        match bits {
            0 => NoAuth,
            1 => Reserved1,
            2 => Reserved2,
            3 => AesCmac128_2,
            4 => AesCmac128_4,
            5 => AesCmac128_8,
            6 => AesCmac128_12,
            7 => AesCmac128_16,
            _ => AesGmac128_12,
        }
    }

    pub fn mac_len(&self) -> usize {
        use AflAuthenticationType::*;
        match self {
            NoAuth | Reserved1 | Reserved2 => 0,
            AesCmac128_2 => 2,
            AesCmac128_4 => 4,
            AesCmac128_8 => 8,
            AesCmac128_12 | AesGmac128_12 => 12,
            AesCmac128_16 => 16,
        }
    }
}

/// Media type names for the A-field device type byte.
pub fn media_type_name(mtype: u8) -> &'static str {
    match mtype {
        0x00 => "other",
        0x01 => "oil",
        0x02 => "electricity",
        0x03 => "gas",
        0x04 => "heat",
        0x05 => "steam",
        0x06 => "warm water",
        0x07 => "water",
        0x08 => "heat cost allocator",
        0x09 => "compressed air",
        0x0a => "cooling load volume at outlet",
        0x0b => "cooling load volume at inlet",
        0x0c => "heat volume at inlet",
        0x0d => "heat/cooling load",
        0x0e => "bus/system component",
        0x0f => "unknown",
        0x15 => "hot water",
        0x16 => "cold water",
        0x17 => "hot/cold water",
        0x18 => "pressure",
        0x19 => "a/d converter",
        0x1a => "smoke detector",
        0x1b => "room sensor",
        0x1c => "gas detector",
        0x25 => "breaker",
        0x28 => "waste water",
        0x29 => "garbage",
        0x31 => "communication controller",
        0x32 => "unidirectional repeater",
        0x33 => "bidirectional repeater",
        0x36 => "radio converter (system side)",
        0x37 => "radio converter (meter side)",
        _ => "unknown",
    }
}
