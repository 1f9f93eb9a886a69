//! # Meter Runtime
//!
//! A [`Meter`] binds static configuration ([`MeterInfo`]) to a registered
//! driver. Each matching telegram runs the same pipeline: address check,
//! layered parse, field extraction against the data records, optional
//! driver specific content processing, formula evaluation, and finally the
//! numeric/string value maps are updated in place for the formatters.

pub mod drivers;
pub mod dynamic;
pub mod fields;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::address::{does_address_match_expressions, AddressExpression};
use crate::bus::LinkModeSet;
use crate::constants::media_type_name;
use crate::formula::{FieldResolver, Formula};
use crate::payload::dvparser::DVEntry;
use crate::payload::vif::{default_unit_for_vif, is_inside_vif_range, VifRange};
use crate::telegram::parser::warned_for_telegram_before;
use crate::telegram::{AboutTelegram, MeterKeys, Telegram};
use crate::translate::{decode_tpl_status_byte, join_status_ok_strings, sort_status_string, Lookup};
use crate::units::{convert, default_unit_for_quantity, Quantity, Unit};
use crate::util::crypto::AesKey;

pub use fields::{DifSignedness, FieldInfo, FieldMatcher, PrintProperties, VifScaling};
pub use registry::{ContentProcessor, DriverDetect, DriverError, DriverInfo};

/// What kind of utility a meter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MeterType {
    WaterMeter,
    HeatMeter,
    ElectricityMeter,
    GasMeter,
    HeatCostAllocationMeter,
    TempHygroMeter,
    SmokeDetector,
    PulseCounter,
    UnknownMeter,
}

impl MeterType {
    pub fn from_name(s: &str) -> Option<MeterType> {
        match s {
            "WaterMeter" => Some(MeterType::WaterMeter),
            "HeatMeter" => Some(MeterType::HeatMeter),
            "ElectricityMeter" => Some(MeterType::ElectricityMeter),
            "GasMeter" => Some(MeterType::GasMeter),
            "HeatCostAllocationMeter" => Some(MeterType::HeatCostAllocationMeter),
            "TempHygroMeter" => Some(MeterType::TempHygroMeter),
            "SmokeDetector" => Some(MeterType::SmokeDetector),
            "PulseCounter" => Some(MeterType::PulseCounter),
            "UnknownMeter" => Some(MeterType::UnknownMeter),
            _ => None,
        }
    }
}

/// Static per meter configuration, immutable after startup.
#[derive(Debug, Clone, Default)]
pub struct MeterInfo {
    /// Which bus device this meter listens to; empty means all.
    pub bus: String,
    pub name: String,
    pub driver_name: String,
    pub address_expressions: Vec<AddressExpression>,
    /// AES-128 key, hex encoded. None or "NOKEY" means unencrypted.
    pub key: Option<String>,
    pub link_modes: LinkModeSet,
    pub poll_interval: Option<Duration>,
    /// Shell command lines run when the meter updates.
    pub shells: Vec<String>,
    /// `name=value` constants added to the output.
    pub extra_constant_fields: Vec<String>,
    /// `name_unit=formula` calculated fields added to the driver's.
    pub extra_calculated_fields: Vec<String>,
    /// Output field selection; empty means the driver's default fields.
    pub selected_fields: Vec<String>,
}

#[derive(Debug, Clone)]
struct NumericValue {
    /// Unit the value is stored in; converted to the display unit when
    /// rendered.
    unit: Unit,
    value: f64,
}

/// What became of one telegram offered to a meter.
#[derive(Debug)]
pub enum TelegramOutcome {
    /// Addresses did not match this meter.
    NotForMe,
    /// Matched, but parsing or decryption failed. The skeleton is kept for
    /// logging.
    ParseFailed(Telegram),
    /// Matched and updated the meter state.
    Updated(Telegram),
}

/// A runtime meter instance.
pub struct Meter {
    index: usize,
    name: String,
    driver_name: String,
    bus_alias: String,
    meter_type: MeterType,
    address_expressions: Vec<AddressExpression>,
    keys: MeterKeys,
    link_modes: LinkModeSet,
    poll_interval: Option<Duration>,

    field_infos: Vec<FieldInfo>,
    numeric_values: HashMap<(String, Unit), NumericValue>,
    string_values: HashMap<String, String>,

    datetime_of_update: Option<DateTime<Utc>>,
    num_updates: u64,
    media: String,

    mfct_tpl_status_bits: Option<Lookup>,
    content_processor: Option<Arc<dyn ContentProcessor>>,
    force_mfct_index: Option<usize>,

    shells: Vec<String>,
    extra_constant_fields: Vec<String>,
    selected_fields: Vec<String>,
}

/// Create a meter from its configuration, locating the driver in the
/// registry and letting it populate the field schemas.
pub fn create_meter(mi: &MeterInfo) -> Result<Meter, DriverError> {
    let di = registry::lookup_driver(&mi.driver_name)
        .ok_or_else(|| DriverError::UnknownDriver(mi.driver_name.clone()))?;

    let mut keys = MeterKeys::default();
    if let Some(k) = &mi.key {
        if !k.is_empty() && k != "NOKEY" {
            match AesKey::from_hex(k) {
                Ok(key) => keys.confidentiality_key = Some(key),
                Err(e) => {
                    warn!("(meter) {} bad key: {e}", mi.name);
                }
            }
        }
    }

    let mut m = Meter {
        index: 0,
        name: mi.name.clone(),
        driver_name: di.name.clone(),
        bus_alias: mi.bus.clone(),
        meter_type: di.meter_type,
        address_expressions: mi.address_expressions.clone(),
        keys,
        link_modes: if mi.link_modes.is_empty() {
            di.default_link_modes
        } else {
            mi.link_modes
        },
        poll_interval: mi.poll_interval,
        field_infos: Vec::new(),
        numeric_values: HashMap::new(),
        string_values: HashMap::new(),
        datetime_of_update: None,
        num_updates: 0,
        media: String::new(),
        mfct_tpl_status_bits: di.mfct_tpl_status_bits.clone(),
        content_processor: di.content_processor.clone(),
        force_mfct_index: di.force_mfct_index,
        shells: mi.shells.clone(),
        extra_constant_fields: mi.extra_constant_fields.clone(),
        selected_fields: if mi.selected_fields.is_empty() {
            di.default_fields.clone()
        } else {
            mi.selected_fields.clone()
        },
    };

    (di.setup_fields)(&mut m);

    for ecf in &mi.extra_calculated_fields {
        m.add_extra_calculated_field(ecf);
    }

    m.compile_formulas();
    Ok(m)
}

struct MeterFields<'a>(&'a Meter);

impl FieldResolver for MeterFields<'_> {
    fn field_unit(&self, vname: &str) -> Option<Unit> {
        self.0
            .field_infos
            .iter()
            .find(|f| f.vname == vname)
            .map(|f| f.display_unit)
    }

    fn field_value(&self, vname: &str, unit: Unit) -> Option<f64> {
        self.0.get_numeric_value(vname, unit)
    }
}

impl Meter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn bus_alias(&self) -> &str {
        &self.bus_alias
    }

    pub fn meter_type(&self) -> MeterType {
        self.meter_type
    }

    pub fn link_modes(&self) -> LinkModeSet {
        self.link_modes
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    pub fn uses_polling(&self) -> bool {
        self.poll_interval.is_some()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_index(&mut self, i: usize) {
        self.index = i;
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn datetime_of_update(&self) -> Option<DateTime<Utc>> {
        self.datetime_of_update
    }

    pub fn field_infos(&self) -> &[FieldInfo] {
        &self.field_infos
    }

    pub fn address_expressions(&self) -> &[AddressExpression] {
        &self.address_expressions
    }

    pub fn meter_keys(&self) -> &MeterKeys {
        &self.keys
    }

    pub fn shells(&self) -> &[String] {
        &self.shells
    }

    // ---- Field schema construction, called by driver setups ------------

    fn push_field(&mut self, mut fi: FieldInfo) {
        fi.index = self.field_infos.len();
        self.field_infos.push(fi);
    }

    pub fn add_numeric_field_with_extractor(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        quantity: Quantity,
        vif_scaling: VifScaling,
        dif_signedness: DifSignedness,
        matcher: FieldMatcher,
    ) {
        self.add_numeric_field_with_extractor_and_unit(
            vname,
            help,
            props,
            quantity,
            vif_scaling,
            dif_signedness,
            matcher,
            default_unit_for_quantity(quantity),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_numeric_field_with_extractor_and_unit(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        quantity: Quantity,
        vif_scaling: VifScaling,
        dif_signedness: DifSignedness,
        matcher: FieldMatcher,
        display_unit: Unit,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity,
            display_unit,
            vif_scaling,
            dif_signedness,
            force_scale: 1.0,
            matcher: Some(matcher),
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula_text: None,
            formula: None,
        });
    }

    /// A numeric field whose value is supplied by the driver's content
    /// processor rather than a matcher.
    pub fn add_numeric_field(
        &mut self,
        vname: &str,
        quantity: Quantity,
        props: PrintProperties,
        help: &str,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity,
            display_unit: default_unit_for_quantity(quantity),
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Signed,
            force_scale: 1.0,
            matcher: None,
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula_text: None,
            formula: None,
        });
    }

    pub fn add_numeric_field_with_calculator(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        quantity: Quantity,
        formula: &str,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity,
            display_unit: default_unit_for_quantity(quantity),
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Signed,
            force_scale: 1.0,
            matcher: None,
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula_text: Some(formula.to_string()),
            formula: None,
        });
    }

    pub fn add_string_field_with_extractor(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        matcher: FieldMatcher,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity: Quantity::Text,
            display_unit: Unit::Text,
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Unsigned,
            force_scale: 1.0,
            matcher: Some(matcher),
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula_text: None,
            formula: None,
        });
    }

    pub fn add_string_field_with_extractor_and_lookup(
        &mut self,
        vname: &str,
        help: &str,
        props: PrintProperties,
        matcher: FieldMatcher,
        lookup: Lookup,
    ) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity: Quantity::Text,
            display_unit: Unit::Text,
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Unsigned,
            force_scale: 1.0,
            matcher: Some(matcher),
            help: help.to_string(),
            print_properties: props,
            lookup: Some(lookup),
            formula_text: None,
            formula: None,
        });
    }

    /// A string field the content processor fills in.
    pub fn add_string_field(&mut self, vname: &str, help: &str, props: PrintProperties) {
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity: Quantity::Text,
            display_unit: Unit::Text,
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Unsigned,
            force_scale: 1.0,
            matcher: None,
            help: help.to_string(),
            print_properties: props,
            lookup: None,
            formula_text: None,
            formula: None,
        });
    }

    /// Parse `name_unit=formula` and add a calculated field.
    fn add_extra_calculated_field(&mut self, spec: &str) {
        let Some((name_unit, formula)) = spec.split_once('=') else {
            warn!("(meter) {} bad extra calculated field \"{spec}\", expected name_unit=formula", self.name);
            return;
        };
        let Some(idx) = name_unit.rfind('_') else {
            warn!("(meter) {} calculated field \"{name_unit}\" lacks a unit suffix", self.name);
            return;
        };
        let (vname, suffix) = (&name_unit[..idx], &name_unit[idx + 1..]);
        let Some(unit) = Unit::from_suffix(suffix) else {
            warn!("(meter) {} calculated field \"{name_unit}\" has unknown unit \"{suffix}\"", self.name);
            return;
        };
        self.push_field(FieldInfo {
            index: 0,
            vname: vname.to_string(),
            quantity: unit.quantity(),
            display_unit: unit,
            vif_scaling: VifScaling::None,
            dif_signedness: DifSignedness::Signed,
            force_scale: 1.0,
            matcher: None,
            help: String::new(),
            print_properties: PrintProperties::default(),
            lookup: None,
            formula_text: Some(formula.trim().to_string()),
            formula: None,
        });
    }

    pub fn set_mfct_tpl_status_bits(&mut self, lookup: Lookup) {
        self.mfct_tpl_status_bits = Some(lookup);
    }

    /// Override the static scale multiplier of a field, applied after
    /// extraction. Used by the dynamic driver loader's `force_scale`.
    pub fn set_field_force_scale(&mut self, vname: &str, scale: f64) {
        if let Some(fi) = self.field_infos.iter_mut().find(|f| f.vname == vname) {
            fi.force_scale = scale;
        }
    }

    /// Compile formula texts once all fields exist, so formulas can
    /// reference fields defined after them.
    fn compile_formulas(&mut self) {
        let mut compiled: Vec<(usize, Option<Formula>)> = Vec::new();
        {
            let resolver = MeterFields(self);
            for fi in &self.field_infos {
                if let Some(text) = &fi.formula_text {
                    match Formula::parse(text, &resolver) {
                        Ok(f) => compiled.push((fi.index, Some(f))),
                        Err(e) => {
                            warn!(
                                "(meter) {} field {} formula \"{text}\" failed to parse: {e}",
                                self.name, fi.vname
                            );
                            compiled.push((fi.index, None));
                        }
                    }
                }
            }
        }
        for (idx, f) in compiled {
            self.field_infos[idx].formula = f;
        }
    }

    // ---- Values ---------------------------------------------------------

    pub fn set_numeric_value_for_field(
        &mut self,
        fi: &FieldInfo,
        dve: Option<&DVEntry>,
        unit: Unit,
        value: f64,
    ) {
        let name = fi.field_name(dve);
        self.numeric_values
            .insert((name, fi.display_unit), NumericValue { unit, value });
    }

    /// Set a numeric value by field name, used by content processors.
    pub fn set_numeric_value(&mut self, vname: &str, unit: Unit, value: f64) {
        let Some(fi) = self.field_infos.iter().find(|f| f.vname == vname).cloned() else {
            warn!(
                "(meter) cannot set numeric value {value} {} for non-existant field \"{vname}\"",
                unit.suffix()
            );
            return;
        };
        self.set_numeric_value_for_field(&fi, None, unit, value);
    }

    pub fn get_numeric_value(&self, vname: &str, to: Unit) -> Option<f64> {
        let nv = self
            .numeric_values
            .iter()
            .find(|((name, _), _)| name == vname)
            .map(|(_, nv)| nv)?;
        convert(nv.value, nv.unit, to).ok()
    }

    pub fn set_string_value(&mut self, vname: &str, value: &str) {
        self.string_values.insert(vname.to_string(), value.to_string());
    }

    pub fn get_string_value(&self, vname: &str) -> Option<&str> {
        self.string_values.get(vname).map(String::as_str)
    }

    // ---- Telegram pipeline ----------------------------------------------

    /// Does the telegram belong to this meter, and should we warn about a
    /// driver mismatch?
    fn is_telegram_for_meter(&self, t: &Telegram) -> bool {
        let mut used_wildcard = false;
        let matched =
            does_address_match_expressions(&t.addresses, &self.address_expressions, &mut used_wildcard);
        if !matched {
            debug!("(meter) {}: not for me: no match", self.name);
            return false;
        }

        let mut valid_driver =
            registry::is_driver_valid_for(&self.driver_name, t.dll_mfct, t.dll_type, t.dll_version);
        if !valid_driver && t.tpl_id_found {
            valid_driver =
                registry::is_driver_valid_for(&self.driver_name, t.tpl_mfct, t.tpl_type, t.tpl_version);
        }

        if !valid_driver
            && t.dll_mfct != 0
            && !t.being_analyzed()
            && !warned_for_telegram_before(&t.dll_id, t.dll_mfct, t.dll_type, t.dll_version)
        {
            let possible = t.auto_detect_possible_drivers();
            warn!(
                "(meter) {}: meter detection did not match the selected driver {}! correct driver is: {}",
                self.name,
                self.driver_name,
                if possible.is_empty() {
                    "unknown!".to_string()
                } else {
                    possible.join(",")
                }
            );
        }
        true
    }

    /// Offer a telegram to this meter.
    pub fn handle_telegram(&mut self, about: &AboutTelegram, frame: &[u8]) -> TelegramOutcome {
        let mut t = Telegram::new(about.clone());
        if !t.parse_header(frame) {
            return TelegramOutcome::NotForMe;
        }
        if !self.is_telegram_for_meter(&t) {
            return TelegramOutcome::NotForMe;
        }

        debug!(
            "(meter) {}({}) {} handling telegram from {}",
            self.name,
            self.index,
            self.driver_name,
            t.ids_comma_separated()
        );

        t.force_mfct_index = self.force_mfct_index;
        if !t.parse(frame, &self.keys, true) {
            return TelegramOutcome::ParseFailed(t);
        }

        self.process_field_extractors(&t);
        if let Some(processor) = self.content_processor.clone() {
            processor.process_content(self, &t);
        }
        self.process_field_calculators();

        self.media = media_type_name(if t.tpl_id_found { t.tpl_type } else { t.dll_type }).to_string();
        self.num_updates += 1;
        self.datetime_of_update = Some(Utc::now());
        t.handled = true;
        TelegramOutcome::Updated(t)
    }

    /// Run every field matcher over the records, in telegram order.
    fn process_field_extractors(&mut self, t: &Telegram) {
        let mut sorted: Vec<&DVEntry> = t.dv_entries.values().map(|(_, e)| e).collect();
        sorted.sort_by_key(|e| e.offset);

        let field_infos = self.field_infos.clone();
        // Records consumed by a non-multi field are not offered to later
        // non-multi fields.
        let mut consumed: Vec<usize> = Vec::new();
        let mut fields_that_fired: Vec<usize> = Vec::new();

        for fi in field_infos.iter().filter(|f| f.has_matcher()) {
            let matcher = fi.matcher.as_ref().unwrap();
            let multi = matcher.expected_to_match_against_multiple_entries();
            let mut current_match_nr = 0;
            let mut extracted = false;

            for &dve in &sorted {
                if !multi && consumed.contains(&dve.offset) {
                    continue;
                }
                if !fi.matches(dve) {
                    continue;
                }
                current_match_nr += 1;
                if !multi && matcher.index_nr != current_match_nr {
                    // Matched, but the rule wants a later occurrence.
                    continue;
                }
                debug!(
                    "(meter) using field info {}[{}] to extract {} at offset {}",
                    fi.vname, fi.index, dve.dif_vif_key, dve.offset
                );
                self.perform_extraction(fi, t, Some(dve));
                extracted = true;
                if !multi {
                    consumed.push(dve.offset);
                    break;
                }
            }
            if extracted {
                fields_that_fired.push(fi.index);
            }
        }

        // Fields without a matcher, and status fields that join the tpl
        // status but whose matcher did not fire, still extract.
        for fi in &field_infos {
            if !fi.has_matcher()
                && fi.formula_text.is_none()
                && (fi.lookup.is_some()
                    || fi.print_properties.contains(PrintProperties::INCLUDE_TPL_STATUS))
            {
                self.perform_extraction(fi, t, None);
            } else if fi.has_matcher()
                && !fields_that_fired.contains(&fi.index)
                && fi.print_properties.contains(PrintProperties::INCLUDE_TPL_STATUS)
            {
                self.perform_extraction(fi, t, None);
            }
        }
    }

    /// Extract one field's value from a record (or just the tpl status when
    /// no record matched).
    fn perform_extraction(&mut self, fi: &FieldInfo, t: &Telegram, dve: Option<&DVEntry>) {
        if fi.quantity == Quantity::Text {
            self.extract_string_field(fi, t, dve);
        } else if let Some(dve) = dve {
            if let Some(formula) = &fi.formula {
                // Calculated field bound to a matched record.
                let resolver = MeterFields(self);
                match formula.evaluate(&resolver, Some(dve), fi.display_unit) {
                    Ok(Some(v)) => {
                        self.set_numeric_value_for_field(fi, Some(dve), fi.display_unit, v)
                    }
                    Ok(None) => {}
                    Err(e) => debug!("(meter) {} formula error: {e}", fi.vname),
                }
                return;
            }
            let auto = fi.vif_scaling == VifScaling::Auto;
            let signed = fi.dif_signedness == DifSignedness::Signed;
            let Some(mut value) = dve.extract_double(auto, signed) else {
                return;
            };
            value *= fi.force_scale;
            let unit = if auto {
                default_unit_for_vif(dve.vif).unwrap_or(fi.display_unit)
            } else {
                fi.display_unit
            };
            self.set_numeric_value_for_field(fi, Some(dve), unit, value);
        }
    }

    fn extract_string_field(&mut self, fi: &FieldInfo, t: &Telegram, dve: Option<&DVEntry>) {
        let mut value = String::new();

        if let Some(dve) = dve {
            if let Some(lookup) = &fi.lookup {
                if let Some(raw) = dve.extract_long() {
                    value = lookup.translate(raw);
                }
            } else if is_inside_vif_range(dve.vif, VifRange::Date)
                || is_inside_vif_range(dve.vif, VifRange::DateTime)
            {
                if let Some(d) = dve.extract_date() {
                    value = d.to_string();
                }
            } else {
                value = dve.extract_readable_string();
            }
        }

        if fi.print_properties.contains(PrintProperties::INCLUDE_TPL_STATUS) {
            let tpl = decode_tpl_status_byte(t.tpl_sts, self.mfct_tpl_status_bits.as_ref());
            value = join_status_ok_strings(&value, &tpl);
            value = sort_status_string(&value);
            if value.is_empty() {
                value = "OK".to_string();
            }
        }

        let name = fi.field_name(dve);
        self.string_values.insert(name, value);
    }

    /// Evaluate the formulas not bound to any matcher.
    fn process_field_calculators(&mut self) {
        let mut results: Vec<(FieldInfo, f64)> = Vec::new();
        {
            let resolver = MeterFields(self);
            for fi in &self.field_infos {
                if fi.has_matcher() || fi.formula.is_none() {
                    continue;
                }
                let formula = fi.formula.as_ref().unwrap();
                match formula.evaluate(&resolver, None, fi.display_unit) {
                    Ok(Some(v)) => results.push((fi.clone(), v)),
                    Ok(None) => {}
                    Err(e) => debug!("(meter) {} formula error: {e}", fi.vname),
                }
            }
        }
        for (fi, v) in results {
            self.set_numeric_value_for_field(&fi, None, fi.display_unit, v);
        }
    }

    // ---- Rendering ------------------------------------------------------

    /// The aggregated status: the STATUS field joined with every
    /// INJECT_INTO_STATUS contribution, sorted, deduplicated, `OK` when
    /// empty.
    fn aggregated_status(&self, status_field: &FieldInfo) -> String {
        let mut value = self
            .string_values
            .get(&status_field.vname)
            .cloned()
            .unwrap_or_default();
        for fi in &self.field_infos {
            if fi.print_properties.contains(PrintProperties::INJECT_INTO_STATUS) {
                if let Some(more) = self.string_values.get(&fi.vname) {
                    value = join_status_ok_strings(&value, more);
                }
            }
        }
        let value = sort_status_string(&value);
        if value.is_empty() {
            "OK".to_string()
        } else {
            value
        }
    }

    /// Render the current meter state as the canonical JSON object handed
    /// to output formatters.
    pub fn to_json(&self, t: Option<&Telegram>) -> Value {
        let mut obj = Map::new();
        obj.insert("name".to_string(), json!(self.name));
        obj.insert("meter".to_string(), json!(self.driver_name));
        if let Some(t) = t {
            if let Some(a) = t.addresses.last() {
                obj.insert("id".to_string(), json!(a.id));
            }
            if t.about.rssi_dbm != 0 {
                obj.insert("rssi_dbm".to_string(), json!(t.about.rssi_dbm));
            }
        }
        if !self.media.is_empty() {
            obj.insert("media".to_string(), json!(self.media));
        }

        for fi in &self.field_infos {
            if fi.print_properties.contains(PrintProperties::HIDE)
                || fi.print_properties.contains(PrintProperties::INJECT_INTO_STATUS)
            {
                continue;
            }
            if fi.print_properties.contains(PrintProperties::STATUS) {
                obj.insert(fi.vname.clone(), json!(self.aggregated_status(fi)));
                continue;
            }
            if fi.quantity == Quantity::Text {
                for (name, value) in &self.string_values {
                    if name == &fi.vname || is_expansion_of(&fi.vname, name) {
                        obj.insert(name.clone(), json!(value));
                    }
                }
            } else {
                for ((name, display_unit), nv) in &self.numeric_values {
                    if (name == &fi.vname || is_expansion_of(&fi.vname, name))
                        && *display_unit == fi.display_unit
                    {
                        if let Ok(v) = convert(nv.value, nv.unit, *display_unit) {
                            let key = format!("{name}_{}", display_unit.suffix());
                            if v.is_nan() {
                                obj.insert(key, Value::Null);
                            } else {
                                obj.insert(key, json!(v));
                            }
                        }
                    }
                }
            }
        }

        for ecf in &self.extra_constant_fields {
            if let Some((k, v)) = ecf.split_once('=') {
                obj.insert(k.trim().to_string(), json!(v.trim()));
            }
        }

        if let Some(ts) = self.datetime_of_update {
            obj.insert(
                "timestamp".to_string(),
                json!(ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            );
        }
        Value::Object(obj)
    }

    /// The fields chosen for compact output formats.
    pub fn selected_fields(&self) -> &[String] {
        &self.selected_fields
    }
}

/// Is `name` an expansion of a `{counter}` template, eg
/// `total_energy_consumption_tariff_2` of
/// `total_energy_consumption_tariff_{tariff_counter}`?
fn is_expansion_of(template: &str, name: &str) -> bool {
    if !crate::formula::has_interpolation(template) {
        return false;
    }
    let Some(brace) = template.find('{') else {
        return false;
    };
    let prefix = &template[..brace];
    let suffix = template[template.rfind('}').unwrap() + 1..].to_string();
    name.starts_with(prefix) && name.ends_with(&suffix) && name.len() > prefix.len() + suffix.len()
}
