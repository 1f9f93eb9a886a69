//! # Meter Addresses and Address Expressions
//!
//! An address expression selects which telegrams a meter decodes, and which
//! meter to poll on a wired bus. The simplest expression is a full id:
//! `12345678`. Fully qualified: `12345678.M=PII.T=1b.V=01` restricts the
//! manufacturer triplet, media type and version. Wildcards match id
//! prefixes: `12*.T=16`. A leading `!` turns the whole expression into a
//! filter-out rule, and `!=` negates a single qualifier:
//! `12345678.V!=66`.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address expression \"{0}\"")]
    InvalidExpression(String),

    #[error("Invalid manufacturer flag \"{0}\", expected three letters A-Z")]
    InvalidManufacturerFlag(String),
}

pub const ANY_MFCT: u16 = 0xffff;
pub const ANY_TYPE: u8 = 0xff;
pub const ANY_VERSION: u8 = 0xff;

/// Pack a three-letter manufacturer flag into its 15-bit code.
///
/// Each letter maps to five bits: `((c1-64)<<10) | ((c2-64)<<5) | (c3-64)`.
pub fn flag_to_manufacturer(flag: &str) -> Result<u16, AddressError> {
    let up = flag.to_ascii_uppercase();
    let bytes = up.as_bytes();
    if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
        return Err(AddressError::InvalidManufacturerFlag(flag.to_string()));
    }
    Ok((((bytes[0] - 64) as u16) << 10) | (((bytes[1] - 64) as u16) << 5) | ((bytes[2] - 64) as u16))
}

/// Unpack a 15-bit manufacturer code into its three-letter flag.
pub fn manufacturer_flag(mfct: u16) -> String {
    let m = mfct & 0x7fff;
    let c1 = ((m >> 10) & 0x1f) as u8 + 64;
    let c2 = ((m >> 5) & 0x1f) as u8 + 64;
    let c3 = (m & 0x1f) as u8 + 64;
    [c1, c2, c3].iter().map(|&c| c as char).collect()
}

/// An address seen in a telegram: the DLL or TPL id plus the manufacturer
/// triplet. For wired meters the id may be a primary address 0-250.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub id: String,
    pub mfct: u16,
    pub version: u8,
    pub mtype: u8,
    pub mbus_primary: bool,
}

impl Address {
    pub fn new(id: &str, mfct: u16, version: u8, mtype: u8) -> Self {
        Address {
            id: id.to_string(),
            mfct,
            version,
            mtype,
            mbus_primary: false,
        }
    }

    pub fn concat(addresses: &[Address]) -> String {
        addresses
            .iter()
            .map(|a| a.id.clone())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A parsed address expression, matched against telegram addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressExpression {
    pub id: String,
    pub has_wildcard: bool,
    pub mbus_primary: bool,
    pub mfct: u16,
    pub mtype: u8,
    pub version: u8,
    pub mfct_negated: bool,
    pub type_negated: bool,
    pub version_negated: bool,
    pub filter_out: bool,
}

fn is_valid_id_part(id: &str, accept_hex: bool) -> (bool, bool, bool) {
    // Returns (valid, has_wildcard, mbus_primary).
    if id == "*" {
        return (true, true, false);
    }
    let digit_ok = |c: char| {
        if accept_hex {
            c.is_ascii_hexdigit()
        } else {
            c.is_ascii_digit()
        }
    };
    if let Some(prefix) = id.strip_suffix('*') {
        // A prefix of 0 to 7 digits followed by the wildcard.
        let ok = prefix.len() <= 7 && prefix.chars().all(digit_ok) && !prefix.contains('*');
        return (ok, true, false);
    }
    if id.len() == 8 && id.chars().all(digit_ok) {
        return (true, false, false);
    }
    // An mbus primary address 0-250.
    if !id.is_empty() && id.len() <= 3 && id.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(v) = id.parse::<u16>() {
            if v <= 250 {
                return (true, false, true);
            }
        }
    }
    (false, false, false)
}

impl AddressExpression {
    /// Parse a single expression. Hex digits in ids are accepted only when
    /// `accept_hex` is set (non-compliant meters).
    pub fn parse(s: &str, accept_hex: bool) -> Result<AddressExpression, AddressError> {
        let mut rest = s;
        let filter_out = rest.starts_with('!');
        if filter_out {
            rest = &rest[1..];
        }
        if rest.starts_with('!') {
            return Err(AddressError::InvalidExpression(s.to_string()));
        }

        let mut parts = rest.split('.');
        let id_part = parts
            .next()
            .ok_or_else(|| AddressError::InvalidExpression(s.to_string()))?;
        let (valid, has_wildcard, mbus_primary) = is_valid_id_part(id_part, accept_hex);
        if !valid {
            return Err(AddressError::InvalidExpression(s.to_string()));
        }

        let mut expr = AddressExpression {
            id: id_part.to_string(),
            has_wildcard,
            mbus_primary,
            mfct: ANY_MFCT,
            mtype: ANY_TYPE,
            version: ANY_VERSION,
            mfct_negated: false,
            type_negated: false,
            version_negated: false,
            filter_out,
        };

        for q in parts {
            let (key, negated, value) = if let Some(rest) = q.get(1..).and_then(|r| r.strip_prefix("!=")) {
                (&q[..1], true, rest)
            } else if let Some(rest) = q.get(1..).and_then(|r| r.strip_prefix('=')) {
                (&q[..1], false, rest)
            } else {
                return Err(AddressError::InvalidExpression(s.to_string()));
            };
            match key {
                "M" => {
                    expr.mfct = flag_to_manufacturer(value)
                        .map_err(|_| AddressError::InvalidExpression(s.to_string()))?;
                    expr.mfct_negated = negated;
                }
                "T" => {
                    expr.mtype = u8::from_str_radix(value, 16)
                        .map_err(|_| AddressError::InvalidExpression(s.to_string()))?;
                    expr.type_negated = negated;
                }
                "V" => {
                    expr.version = u8::from_str_radix(value, 16)
                        .map_err(|_| AddressError::InvalidExpression(s.to_string()))?;
                    expr.version_negated = negated;
                }
                _ => return Err(AddressError::InvalidExpression(s.to_string())),
            }
        }

        Ok(expr)
    }

    fn id_matches(&self, id: &str) -> bool {
        if self.id == "*" {
            return true;
        }
        if self.has_wildcard {
            let prefix = &self.id[..self.id.len() - 1];
            return id.starts_with(prefix);
        }
        id == self.id
    }

    /// Does this expression (ignoring filter_out) match the given address?
    pub fn matches(&self, a: &Address) -> bool {
        if !self.id_matches(&a.id) {
            return false;
        }
        if self.mfct != ANY_MFCT {
            let eq = self.mfct == (a.mfct & 0x7fff);
            if eq == self.mfct_negated {
                return false;
            }
        }
        if self.mtype != ANY_TYPE {
            let eq = self.mtype == a.mtype;
            if eq == self.type_negated {
                return false;
            }
        }
        if self.version != ANY_VERSION {
            let eq = self.version == a.version;
            if eq == self.version_negated {
                return false;
            }
        }
        true
    }

    pub fn concat(exprs: &[AddressExpression]) -> String {
        exprs
            .iter()
            .map(|e| {
                let mut s = String::new();
                if e.filter_out {
                    s.push('!');
                }
                s.push_str(&e.id);
                s
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Split a comma separated list of expressions.
pub fn split_match_expressions(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Check a single expression for validity.
pub fn is_valid_match_expression(s: &str, accept_hex: bool) -> bool {
    AddressExpression::parse(s, accept_hex).is_ok()
}

/// Check a comma separated list of expressions.
pub fn is_valid_match_expressions(s: &str, accept_hex: bool) -> bool {
    let exprs = split_match_expressions(s);
    if exprs.is_empty() {
        return false;
    }
    exprs.iter().all(|e| is_valid_match_expression(e, accept_hex))
}

/// Match a plain id against a set of expression strings.
///
/// At least one positive expression must match and no negative expression
/// may match. `used_wildcard` reports whether only wildcard rules matched,
/// which drives driver auto-detection warnings. An exact 8-character match
/// always wins over a wildcard match.
pub fn does_id_match_expressions(
    id: &str,
    expressions: &[String],
    used_wildcard: &mut bool,
) -> bool {
    let address = Address::new(id, 0, 0, 0);
    let mut parsed = Vec::new();
    for e in expressions {
        if let Ok(ae) = AddressExpression::parse(e, true) {
            parsed.push(ae);
        }
    }
    does_address_match_expressions(&[address], &parsed, used_wildcard)
}

/// Match telegram addresses against parsed expressions. The last address in
/// the slice is the effective meter id; every address is tried.
pub fn does_address_match_expressions(
    addresses: &[Address],
    expressions: &[AddressExpression],
    used_wildcard: &mut bool,
) -> bool {
    let mut found_match = false;
    let mut found_negative_match = false;
    let mut exact_match = false;
    *used_wildcard = false;

    for expr in expressions {
        for a in addresses {
            let m = expr.matches(a);
            if expr.filter_out {
                if m {
                    found_negative_match = true;
                }
            } else if m {
                found_match = true;
                if !expr.has_wildcard {
                    exact_match = true;
                }
            }
        }
    }

    if found_negative_match {
        return false;
    }
    if found_match {
        *used_wildcard = !exact_match;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_match(id: &str, mes: &str, expected: bool, expected_uw: bool) {
        let exprs = split_match_expressions(mes);
        let mut uw = false;
        let b = does_id_match_expressions(id, &exprs, &mut uw);
        assert_eq!(b, expected, "match {id} against {mes}");
        if expected {
            assert_eq!(uw, expected_uw, "used_wildcard for {id} against {mes}");
        }
    }

    #[test]
    fn test_valid_expressions() {
        for s in ["12345678", "*", "!12345678", "12345*", "!123456*", "2222*,!22224444"] {
            assert!(is_valid_match_expressions(s, false), "{s} should be valid");
        }
        for s in [
            "1234567",
            "",
            "z1234567",
            "123456789",
            "!!12345678",
            "12345678*",
            "**",
            "123**",
        ] {
            assert!(!is_valid_match_expressions(s, false), "{s} should be invalid");
        }
    }

    #[test]
    fn test_id_matching() {
        check_match("12345678", "12345678", true, false);
        check_match("12345678", "*", true, true);
        check_match("12345678", "2*", false, false);
        check_match("12345678", "*,!2*", true, true);
        check_match("22222222", "22*,!22222222", false, false);
        check_match("22222223", "22*,!22222222", true, true);
        check_match("22222223", "*,!22*", false, false);
        check_match("12333333", "123*,!1234*,!1235*,!1236*", true, true);
        check_match("12366666", "123*,!1234*,!1235*,!1236*", false, false);
        check_match("11223344", "22*,33*,44*,55*", false, false);
        check_match("55223344", "22*,33*,44*,55*", true, true);
        check_match("78563413", "78563412,78563413", true, false);
        check_match("78563413", "*,!00156327,!00048713", true, true);
    }

    #[test]
    fn test_manufacturer_flag_round_trip() {
        let kam = flag_to_manufacturer("KAM").unwrap();
        assert_eq!(kam, 0x2c2d);
        assert_eq!(manufacturer_flag(kam), "KAM");
        assert_eq!(manufacturer_flag(flag_to_manufacturer("APA").unwrap()), "APA");
        assert!(flag_to_manufacturer("K1M").is_err());
    }

    #[test]
    fn test_qualified_expression() {
        let e = AddressExpression::parse("12345678.M=PII.T=1b.V=01", false).unwrap();
        assert_eq!(e.mfct, flag_to_manufacturer("PII").unwrap());
        assert_eq!(e.mtype, 0x1b);
        assert_eq!(e.version, 0x01);

        let a = Address::new("12345678", e.mfct, 0x01, 0x1b);
        assert!(e.matches(&a));
        let wrong_version = Address::new("12345678", e.mfct, 0x66, 0x1b);
        assert!(!e.matches(&wrong_version));
    }

    #[test]
    fn test_negated_qualifier() {
        let e = AddressExpression::parse("12345678.V!=66", false).unwrap();
        assert!(e.matches(&Address::new("12345678", 0, 0x01, 0x07)));
        assert!(!e.matches(&Address::new("12345678", 0, 0x66, 0x07)));
    }

    #[test]
    fn test_mbus_primary() {
        let e = AddressExpression::parse("250", false).unwrap();
        assert!(e.mbus_primary);
        assert!(!is_valid_match_expression("251", false));
    }
}
