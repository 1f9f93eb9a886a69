//! # Status Bit Translation
//!
//! Drivers describe how to turn status registers into human readable
//! tokens with lookup rules. A rule applies a mask, then maps bits (or an
//! index, or a decimal value) onto tokens. Bits inside the mask that no
//! map entry names come out as `UNKNOWN_...` tokens so surprises stay
//! visible, and rules whose masks overlap each other produce `BAD_RULE_`
//! tokens since such a lookup is ambiguous by construction.

use serde::Serialize;

/// How map entries test against the masked value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestBit {
    Set,
    NotSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MapType {
    BitToString,
    IndexToString,
    DecimalsToString,
}

impl MapType {
    pub fn from_name(s: &str) -> Option<MapType> {
        match s {
            "BitToString" => Some(MapType::BitToString),
            "IndexToString" => Some(MapType::IndexToString),
            "DecimalsToString" => Some(MapType::DecimalsToString),
            _ => None,
        }
    }
}

/// When a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    #[default]
    Always,
    /// Rule only applies when these bits are set in the raw value.
    WhenBitsSet(u64),
}

#[derive(Debug, Clone)]
pub struct Map {
    pub value: u64,
    pub to: String,
    pub test: TestBit,
}

impl Map {
    pub fn set(value: u64, to: &str) -> Map {
        Map {
            value,
            to: to.to_string(),
            test: TestBit::Set,
        }
    }

    pub fn not_set(value: u64, to: &str) -> Map {
        Map {
            value,
            to: to.to_string(),
            test: TestBit::NotSet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub map_type: MapType,
    pub trigger: Trigger,
    pub mask: u64,
    pub default_message: String,
    pub maps: Vec<Map>,
}

impl Rule {
    pub fn new(name: &str, map_type: MapType, mask: u64, maps: Vec<Map>) -> Rule {
        Rule {
            name: name.to_string(),
            map_type,
            trigger: Trigger::Always,
            mask,
            default_message: "OK".to_string(),
            maps,
        }
    }

    fn triggered(&self, value: u64) -> bool {
        match self.trigger {
            Trigger::Always => true,
            Trigger::WhenBitsSet(bits) => value & bits == bits,
        }
    }

    fn translate(&self, value: u64, out: &mut Vec<String>) {
        let masked = value & self.mask;
        match self.map_type {
            MapType::BitToString => {
                let mut remaining = masked;
                for m in &self.maps {
                    match m.test {
                        TestBit::Set => {
                            if masked & m.value != 0 {
                                out.push(m.to.clone());
                                remaining &= !m.value;
                            } else {
                                remaining &= !m.value;
                            }
                        }
                        TestBit::NotSet => {
                            if masked & m.value == 0 {
                                out.push(m.to.clone());
                            }
                            remaining &= !m.value;
                        }
                    }
                }
                if remaining != 0 {
                    out.push(format!("UNKNOWN_{}(0x{remaining:X})", self.name));
                }
            }
            MapType::IndexToString => {
                match self.maps.iter().find(|m| m.value == masked) {
                    Some(m) => out.push(m.to.clone()),
                    None => out.push(format!("UNKNOWN_{}(0x{masked:X})", self.name)),
                }
            }
            MapType::DecimalsToString => {
                match self.maps.iter().find(|m| m.value == masked) {
                    Some(m) => out.push(m.to.clone()),
                    None => out.push(format!("UNKNOWN_{}({masked})", self.name)),
                }
            }
        }
    }
}

/// An ordered list of rules applied to one value.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
    pub rules: Vec<Rule>,
}

impl Lookup {
    pub fn new(rules: Vec<Rule>) -> Lookup {
        Lookup { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Translate a raw value into space separated tokens.
    ///
    /// Tokens equal to a rule's default message (typically `OK`) are only
    /// reported when nothing else fired.
    pub fn translate(&self, value: u64) -> String {
        let mut tokens: Vec<String> = Vec::new();

        // Rules with overlapping masks are a driver bug: flag them.
        for i in 0..self.rules.len() {
            for j in i + 1..self.rules.len() {
                let overlap = self.rules[i].mask & self.rules[j].mask;
                if overlap != 0 {
                    tokens.push(format!("BAD_RULE_{}(0x{overlap:X})", self.rules[j].name));
                }
            }
        }

        let mut fired: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !rule.triggered(value) {
                continue;
            }
            rule.translate(value, &mut fired);
        }

        tokens.extend(fired);
        if tokens.is_empty() {
            if let Some(first) = self.rules.first() {
                return first.default_message.clone();
            }
            return String::new();
        }
        tokens.join(" ")
    }
}

/// Decode the TPL status byte. The low five bits are standard application
/// errors; the top three are manufacturer specific and resolved through
/// the driver's lookup when one is registered.
pub fn decode_tpl_status_byte(sts: u8, mfct_lookup: Option<&Lookup>) -> String {
    let mut tokens: Vec<String> = Vec::new();

    match sts & 0x03 {
        0x01 => tokens.push("BUSY".to_string()),
        0x02 => tokens.push("ERROR".to_string()),
        0x03 => tokens.push("ALARM".to_string()),
        _ => {}
    }
    if sts & 0x04 != 0 {
        tokens.push("POWER_LOW".to_string());
    }
    if sts & 0x08 != 0 {
        tokens.push("PERMANENT_ERROR".to_string());
    }
    if sts & 0x10 != 0 {
        tokens.push("TEMPORARY_ERROR".to_string());
    }

    let mfct_bits = (sts & 0xe0) as u64;
    if mfct_bits != 0 {
        match mfct_lookup {
            Some(lookup) => {
                let translated = lookup.translate(mfct_bits);
                if translated != "OK" && !translated.is_empty() {
                    tokens.push(translated);
                }
            }
            None => tokens.push(format!("UNKNOWN_{:02X}", sts & 0xe0)),
        }
    }

    if tokens.is_empty() {
        "OK".to_string()
    } else {
        tokens.join(" ")
    }
}

/// Join two status strings, where `OK` and empty act as neutral elements.
pub fn join_status_ok_strings(a: &str, b: &str) -> String {
    let a = if a == "OK" || a == "null" { "" } else { a };
    let b = if b == "OK" || b == "null" { "" } else { b };
    match (a.is_empty(), b.is_empty()) {
        (true, true) => String::new(),
        (true, false) => b.to_string(),
        (false, true) => a.to_string(),
        (false, false) => format!("{a} {b}"),
    }
}

/// Sort tokens lexically and drop duplicates; empty becomes empty.
pub fn sort_status_string(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_flags_lookup() -> Lookup {
        Lookup::new(vec![Rule::new(
            "ERROR_FLAGS",
            MapType::BitToString,
            0xffff,
            vec![
                Map::set(0x01, "VOLTAGE_INTERRUPTED"),
                Map::set(0x02, "LOW_BATTERY_LEVEL"),
                Map::set(0x04, "SENSOR_ERROR"),
            ],
        )])
    }

    #[test]
    fn test_bit_to_string() {
        let l = error_flags_lookup();
        assert_eq!(l.translate(0x03), "VOLTAGE_INTERRUPTED LOW_BATTERY_LEVEL");
        assert_eq!(l.translate(0x00), "OK");
    }

    #[test]
    fn test_unknown_bits_flagged() {
        let l = error_flags_lookup();
        assert_eq!(
            l.translate(0x41),
            "VOLTAGE_INTERRUPTED UNKNOWN_ERROR_FLAGS(0x40)"
        );
    }

    #[test]
    fn test_overlapping_rules_flagged() {
        let l = Lookup::new(vec![
            Rule::new("A", MapType::BitToString, 0x0f, vec![Map::set(0x01, "X")]),
            Rule::new("B", MapType::BitToString, 0x03, vec![Map::set(0x02, "Y")]),
        ]);
        let s = l.translate(0x02);
        assert!(s.contains("BAD_RULE_B(0x3)"), "{s}");
        assert!(s.contains("Y"), "{s}");
    }

    #[test]
    fn test_index_to_string() {
        let l = Lookup::new(vec![Rule::new(
            "MODE",
            MapType::IndexToString,
            0xff,
            vec![Map::set(0x00, "IDLE"), Map::set(0x01, "RUNNING")],
        )]);
        assert_eq!(l.translate(0x01), "RUNNING");
        assert_eq!(l.translate(0x07), "UNKNOWN_MODE(0x7)");
    }

    #[test]
    fn test_tpl_status_decoding() {
        assert_eq!(decode_tpl_status_byte(0x00, None), "OK");
        assert_eq!(decode_tpl_status_byte(0x04, None), "POWER_LOW");
        assert_eq!(decode_tpl_status_byte(0x0c, None), "POWER_LOW PERMANENT_ERROR");
        assert_eq!(decode_tpl_status_byte(0x20, None), "UNKNOWN_20");

        let l = Lookup::new(vec![Rule::new(
            "MFCT",
            MapType::BitToString,
            0xe0,
            vec![Map::set(0x20, "LOW_BATTERY")],
        )]);
        assert_eq!(decode_tpl_status_byte(0x20, Some(&l)), "LOW_BATTERY");
    }

    #[test]
    fn test_status_joins_and_sort() {
        assert_eq!(join_status_ok_strings("OK", "LEAK"), "LEAK");
        assert_eq!(join_status_ok_strings("", ""), "");
        assert_eq!(sort_status_string("LEAK LOW_BATTERY LEAK"), "LEAK LOW_BATTERY");
    }
}
