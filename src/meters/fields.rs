//! # Field Schemas and Matchers
//!
//! A driver describes each printable field with a [`FieldInfo`]: what it is
//! called, its quantity and display unit, how raw values scale, and a
//! [`FieldMatcher`] rule selecting which data record feeds it. Names may
//! contain `{storage_counter}`/`{tariff_counter}`/`{subunit_counter}`
//! templates which expand per matched record.

use bitflags::bitflags;

use crate::formula::Formula;
use crate::payload::dif::MeasurementType;
use crate::payload::dvparser::{DVEntry, DifVifKey};
use crate::payload::vif::{is_inside_vif_range, VifCombinable, VifRange};
use crate::translate::Lookup;
use crate::units::{Quantity, Unit};

/// Apply the VIF-implicit scale factor or take the raw value as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VifScaling {
    #[default]
    Auto,
    None,
}

impl VifScaling {
    pub fn from_name(s: &str) -> Option<VifScaling> {
        match s {
            "Auto" => Some(VifScaling::Auto),
            "None" => Some(VifScaling::None),
            _ => None,
        }
    }
}

/// Whether binary codings sign extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DifSignedness {
    #[default]
    Signed,
    Unsigned,
}

impl DifSignedness {
    pub fn from_name(s: &str) -> Option<DifSignedness> {
        match s {
            "Signed" => Some(DifSignedness::Signed),
            "Unsigned" => Some(DifSignedness::Unsigned),
            _ => None,
        }
    }
}

bitflags! {
    /// Rendering hints attached to a field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PrintProperties: u32 {
        /// This is THE status field; only one per driver.
        const STATUS = 0x1;
        /// Join the decoded TPL status byte into this field.
        const INCLUDE_TPL_STATUS = 0x2;
        /// This field's text joins into the status field instead of
        /// printing on its own.
        const INJECT_INTO_STATUS = 0x4;
        const HIDE = 0x8;
        const DEPRECATED = 0x10;
        const REQUIRED = 0x20;
    }
}

impl PrintProperties {
    pub fn from_names(s: &str) -> Option<PrintProperties> {
        let mut p = PrintProperties::default();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            p |= match name {
                "STATUS" => PrintProperties::STATUS,
                "INCLUDE_TPL_STATUS" => PrintProperties::INCLUDE_TPL_STATUS,
                "INJECT_INTO_STATUS" => PrintProperties::INJECT_INTO_STATUS,
                "HIDE" => PrintProperties::HIDE,
                "DEPRECATED" => PrintProperties::DEPRECATED,
                "REQUIRED" => PrintProperties::REQUIRED,
                _ => return None,
            };
        }
        Some(p)
    }
}

/// Storage/tariff/subunit sentinel: match any value.
pub const ANY_NR: u64 = u64::MAX;

/// A predicate over data records. Every set constraint must hold. The
/// counter constraints default to 0..0, so a field only sees current
/// (storage 0), untariffed, main-subunit records unless its driver says
/// otherwise. Giving a counter a real range implies the field expects to
/// match several records (tariff arrays and the like).
#[derive(Debug, Clone)]
pub struct FieldMatcher {
    pub dif_vif_key: Option<DifVifKey>,
    pub measurement_type: Option<MeasurementType>,
    pub vif_range: Option<VifRange>,
    pub vif_raw: Option<u16>,
    pub storage_nr: (u64, u64),
    pub tariff_nr: (u64, u64),
    pub subunit_nr: (u64, u64),
    pub vif_combinables: Vec<VifCombinable>,
    pub vif_combinables_raw: Vec<u16>,
    /// Select the nth matching record, 1 based.
    pub index_nr: usize,
    expect_multiple: bool,
}

impl Default for FieldMatcher {
    fn default() -> Self {
        FieldMatcher {
            dif_vif_key: None,
            measurement_type: None,
            vif_range: None,
            vif_raw: None,
            storage_nr: (0, 0),
            tariff_nr: (0, 0),
            subunit_nr: (0, 0),
            vif_combinables: Vec::new(),
            vif_combinables_raw: Vec::new(),
            index_nr: 1,
            expect_multiple: false,
        }
    }
}

impl FieldMatcher {
    pub fn build() -> FieldMatcher {
        FieldMatcher::default()
    }

    pub fn dif_vif_key(mut self, key: &str) -> Self {
        self.dif_vif_key = Some(DifVifKey::new(key));
        self
    }

    pub fn measurement(mut self, mt: MeasurementType) -> Self {
        self.measurement_type = Some(mt);
        self
    }

    pub fn vif_range(mut self, r: VifRange) -> Self {
        self.vif_range = Some(r);
        self
    }

    pub fn vif_raw(mut self, vif: u16) -> Self {
        self.vif_raw = Some(vif);
        self
    }

    pub fn storage(mut self, nr: u64) -> Self {
        self.storage_nr = (nr, nr);
        self
    }

    pub fn storage_range(mut self, from: u64, to: u64) -> Self {
        self.storage_nr = (from, to);
        if from != to {
            self.expect_multiple = true;
        }
        self
    }

    pub fn any_storage(mut self) -> Self {
        self.storage_nr = (0, ANY_NR);
        self
    }

    pub fn tariff(mut self, nr: u64) -> Self {
        self.tariff_nr = (nr, nr);
        self
    }

    pub fn tariff_range(mut self, from: u64, to: u64) -> Self {
        self.tariff_nr = (from, to);
        if from != to {
            self.expect_multiple = true;
        }
        self
    }

    pub fn any_tariff(mut self) -> Self {
        self.tariff_nr = (0, ANY_NR);
        self
    }

    pub fn subunit(mut self, nr: u64) -> Self {
        self.subunit_nr = (nr, nr);
        self
    }

    pub fn subunit_range(mut self, from: u64, to: u64) -> Self {
        self.subunit_nr = (from, to);
        if from != to {
            self.expect_multiple = true;
        }
        self
    }

    pub fn combinable(mut self, c: VifCombinable) -> Self {
        self.vif_combinables.push(c);
        self
    }

    pub fn combinable_raw(mut self, raw: u16) -> Self {
        self.vif_combinables_raw.push(raw);
        self
    }

    pub fn index_nr(mut self, nr: usize) -> Self {
        self.index_nr = nr;
        self
    }

    pub fn expect_multiple(mut self) -> Self {
        self.expect_multiple = true;
        self
    }

    pub fn expected_to_match_against_multiple_entries(&self) -> bool {
        self.expect_multiple
    }

    /// Does this matcher select the given record?
    pub fn matches(&self, dve: &DVEntry) -> bool {
        // An explicit dif vif key overrides everything else.
        if let Some(key) = &self.dif_vif_key {
            return dve.dif_vif_key == *key;
        }

        if let Some(r) = self.vif_range {
            if !is_inside_vif_range(dve.vif, r) {
                return false;
            }
        }
        if let Some(v) = self.vif_raw {
            if dve.vif != v {
                return false;
            }
        }
        if let Some(mt) = self.measurement_type {
            if mt != MeasurementType::Any && dve.measurement_type != mt {
                return false;
            }
        }
        if dve.storage_nr < self.storage_nr.0 || dve.storage_nr > self.storage_nr.1 {
            return false;
        }
        let tariff = dve.tariff_nr as u64;
        if tariff < self.tariff_nr.0 || tariff > self.tariff_nr.1 {
            return false;
        }
        let subunit = dve.subunit_nr as u64;
        if subunit < self.subunit_nr.0 || subunit > self.subunit_nr.1 {
            return false;
        }

        // Combinables must be handled explicitly: a record carrying
        // combinables only matches a rule that names them, and vice versa.
        if self.vif_combinables.is_empty() && self.vif_combinables_raw.is_empty() {
            return dve.combinable_vifs.is_empty() && dve.combinable_vifs_raw.is_empty();
        }

        for raw in &self.vif_combinables_raw {
            if !dve.combinable_vifs_raw.contains(raw) {
                return false;
            }
        }
        for c in &self.vif_combinables {
            if *c != VifCombinable::Any && !dve.combinable_vifs.contains(c) {
                return false;
            }
        }
        if !self.vif_combinables.contains(&VifCombinable::Any) {
            if !self.vif_combinables.is_empty() {
                for c in &dve.combinable_vifs {
                    if !self.vif_combinables.contains(c) {
                        return false;
                    }
                }
            } else {
                for raw in &dve.combinable_vifs_raw {
                    if !self.vif_combinables_raw.contains(raw) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Schema for one printable field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub index: usize,
    /// Field name template, eg `total_energy_consumption` or
    /// `total_energy_consumption_tariff_{tariff_counter}`.
    pub vname: String,
    pub quantity: Quantity,
    pub display_unit: Unit,
    pub vif_scaling: VifScaling,
    pub dif_signedness: DifSignedness,
    /// Extra static multiplier applied after extraction. 1.0 = none.
    pub force_scale: f64,
    pub matcher: Option<FieldMatcher>,
    pub help: String,
    pub print_properties: PrintProperties,
    pub lookup: Option<Lookup>,
    /// Formula source, compiled once all fields are registered.
    pub formula_text: Option<String>,
    pub formula: Option<Formula>,
}

impl FieldInfo {
    pub fn has_matcher(&self) -> bool {
        self.matcher.is_some()
    }

    pub fn has_formula(&self) -> bool {
        self.formula_text.is_some()
    }

    pub fn matches(&self, dve: &DVEntry) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.matches(dve))
    }

    /// The printable field name for a matched record, counters expanded.
    pub fn field_name(&self, dve: Option<&DVEntry>) -> String {
        match dve {
            Some(dve) if crate::formula::has_interpolation(&self.vname) => {
                crate::formula::interpolate_field_name(&self.vname, dve)
                    .unwrap_or_else(|_| self.vname.clone())
            }
            _ => self.vname.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vif: u16, storage: u64, tariff: u32) -> DVEntry {
        DVEntry {
            offset: 0,
            dif_vif_key: DifVifKey::new("0406"),
            measurement_type: MeasurementType::Instantaneous,
            vif,
            combinable_vifs: vec![],
            combinable_vifs_raw: vec![],
            storage_nr: storage,
            tariff_nr: tariff,
            subunit_nr: 0,
            value: "2C000000".to_string(),
        }
    }

    #[test]
    fn test_default_counters_restrict_to_zero() {
        let m = FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyEnergyVIF);
        assert!(m.matches(&entry(0x06, 0, 0)));
        assert!(!m.matches(&entry(0x06, 1, 0)));
        assert!(!m.matches(&entry(0x06, 0, 2)));
    }

    #[test]
    fn test_tariff_range_expects_multiple() {
        let m = FieldMatcher::build()
            .vif_range(VifRange::AnyEnergyVIF)
            .tariff_range(1, 4);
        assert!(m.expected_to_match_against_multiple_entries());
        assert!(m.matches(&entry(0x06, 0, 1)));
        assert!(m.matches(&entry(0x06, 0, 4)));
        assert!(!m.matches(&entry(0x06, 0, 0)));
        assert!(!m.matches(&entry(0x06, 0, 5)));
    }

    #[test]
    fn test_explicit_key_bypasses_ranges() {
        let m = FieldMatcher::build().dif_vif_key("0406");
        assert!(m.matches(&entry(0x06, 0, 0)));
        let mut e = entry(0x06, 9, 9);
        e.dif_vif_key = DifVifKey::new("0406");
        assert!(m.matches(&e));
    }

    #[test]
    fn test_combinables_must_be_explicit() {
        let plain = FieldMatcher::build().vif_range(VifRange::OperatingTime).any_storage();
        let mut e = entry(0x25, 0, 0);
        e.combinable_vifs = vec![VifCombinable::Mfct21];
        e.combinable_vifs_raw = vec![0x7f21];
        assert!(!plain.matches(&e));

        let with = FieldMatcher::build()
            .vif_range(VifRange::OperatingTime)
            .combinable(VifCombinable::Mfct21);
        assert!(with.matches(&e));
        // And a record without the combinable does not match the rule
        // requiring it.
        assert!(!with.matches(&entry(0x25, 0, 0)));
    }

    #[test]
    fn test_field_name_interpolation() {
        let fi = FieldInfo {
            index: 0,
            vname: "total_energy_consumption_tariff_{tariff_counter}".to_string(),
            quantity: Quantity::Energy,
            display_unit: Unit::KWH,
            vif_scaling: VifScaling::Auto,
            dif_signedness: DifSignedness::Signed,
            force_scale: 1.0,
            matcher: None,
            help: String::new(),
            print_properties: PrintProperties::default(),
            lookup: None,
            formula_text: None,
            formula: None,
        };
        let e = entry(0x06, 0, 3);
        assert_eq!(fi.field_name(Some(&e)), "total_energy_consumption_tariff_3");
    }
}
