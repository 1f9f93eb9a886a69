//! # Dynamic Driver Loader
//!
//! Drivers can be described in a declarative text file instead of code.
//! The format is a nested block structure:
//!
//! ```text
//! driver {
//!     name           = mywater
//!     meter_type     = WaterMeter
//!     default_fields = name,id,total_m3,timestamp
//!     detect { mvt = ABC,14,07 }
//!     library { use = total_m3,flow_temperature_c }
//!     field {
//!         name           = target
//!         quantity       = Volume
//!         info           = 'Volume recorded at the billing date.'
//!         vif_scaling    = Auto
//!         dif_signedness = Signed
//!         match {
//!             measurement_type = Instantaneous
//!             vif_range        = Volume
//!             storage_nr       = 1
//!         }
//!     }
//! }
//! ```
//!
//! Every name is validated against the closed enumerations; a bad entry
//! aborts the registration of this driver with an error naming the file,
//! the offending value and the accepted set, while other drivers continue
//! to load.

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::address::flag_to_manufacturer;
use crate::meters::drivers::{add_library_field, LIBRARY_FIELDS};
use crate::meters::fields::{DifSignedness, FieldMatcher, PrintProperties, VifScaling};
use crate::meters::registry::{register_dynamic_driver, DriverDetect, DriverInfo};
use crate::meters::{Meter, MeterType};
use crate::payload::dif::MeasurementType;
use crate::payload::vif::{VifCombinable, VifRange};
use crate::translate::{Lookup, Map, MapType, Rule};
use crate::units::{Quantity, Unit};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DynamicError {
    #[error("{file}: syntax error at line {line}: {message}")]
    Syntax {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}: missing required entry \"{entry}\"")]
    Missing { file: String, entry: String },

    #[error("{file}: field \"{field}\": bad value \"{value}\" for {entry}, expected one of: {expected}")]
    BadValue {
        file: String,
        field: String,
        entry: String,
        value: String,
        expected: String,
    },

    #[error("{file}: driver registration failed: {error}")]
    Registration { file: String, error: String },
}

/// A parsed `key = value` or `key { ... }` tree.
#[derive(Debug, Clone)]
enum Item {
    Value(String, String),
    Block(String, Vec<Item>),
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    }
}

fn unquote(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2 && t.starts_with('\'') && t.ends_with('\'') {
        t[1..t.len() - 1].to_string()
    } else {
        t.to_string()
    }
}

fn parse_inline_block(
    file: &str,
    lineno: usize,
    content: &str,
) -> Result<Vec<Item>, DynamicError> {
    let mut items: Vec<Item> = Vec::new();
    for part in content.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((k, v)) => items.push(Item::Value(k.trim().to_string(), unquote(v))),
            None => {
                // A comma inside the previous value, eg mvt = ABC,14,07.
                let Some(Item::Value(_, prev)) = items.last_mut() else {
                    return Err(DynamicError::Syntax {
                        file: file.to_string(),
                        line: lineno,
                        message: format!("expected key = value inside inline block, got \"{part}\""),
                    });
                };
                prev.push(',');
                prev.push_str(part);
            }
        }
    }
    Ok(items)
}

fn parse_items<'a>(
    file: &str,
    lines: &mut impl Iterator<Item = (usize, &'a str)>,
) -> Result<Vec<Item>, DynamicError> {
    let mut items = Vec::new();
    while let Some((lineno, raw)) = lines.next() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            return Ok(items);
        }
        if let Some(name) = line.strip_suffix('{').map(str::trim) {
            items.push(Item::Block(name.to_string(), parse_items(file, lines)?));
            continue;
        }
        if let (Some(open), Some(close)) = (line.find('{'), line.rfind('}')) {
            if open < close {
                let name = line[..open].trim().to_string();
                items.push(Item::Block(
                    name,
                    parse_inline_block(file, lineno + 1, &line[open + 1..close])?,
                ));
                continue;
            }
        }
        if let Some((k, v)) = line.split_once('=') {
            items.push(Item::Value(k.trim().to_string(), unquote(v)));
            continue;
        }
        return Err(DynamicError::Syntax {
            file: file.to_string(),
            line: lineno + 1,
            message: format!("cannot make sense of \"{line}\""),
        });
    }
    Ok(items)
}

fn value_of(items: &[Item], key: &str) -> Option<String> {
    items.iter().find_map(|i| match i {
        Item::Value(k, v) if k == key => Some(v.clone()),
        _ => None,
    })
}

fn blocks_of<'a>(items: &'a [Item], key: &str) -> Vec<&'a Vec<Item>> {
    items
        .iter()
        .filter_map(|i| match i {
            Item::Block(k, children) if k == key => Some(children),
            _ => None,
        })
        .collect()
}

fn bad_value(
    file: &str,
    field: &str,
    entry: &str,
    value: &str,
    expected: &str,
) -> DynamicError {
    DynamicError::BadValue {
        file: file.to_string(),
        field: field.to_string(),
        entry: entry.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Everything needed to recreate one field at meter construction time.
#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    quantity: Quantity,
    info: String,
    vif_scaling: VifScaling,
    dif_signedness: DifSignedness,
    display_unit: Option<Unit>,
    force_scale: Option<f64>,
    attributes: PrintProperties,
    calculate: Option<String>,
    matcher: Option<FieldMatcher>,
    lookup: Option<Lookup>,
}

fn parse_matcher(file: &str, field: &str, items: &[Item]) -> Result<FieldMatcher, DynamicError> {
    let mut m = FieldMatcher::build();
    for item in items {
        let Item::Value(k, v) = item else {
            return Err(bad_value(file, field, "match", "nested block", "key = value entries"));
        };
        match k.as_str() {
            "difvif_key" => m = m.dif_vif_key(v),
            "measurement_type" => {
                let mt = MeasurementType::from_name(v).ok_or_else(|| {
                    bad_value(file, field, "measurement_type", v, "Any, Instantaneous, Minimum, Maximum, AtError")
                })?;
                m = m.measurement(mt);
            }
            "vif_range" => {
                let r = VifRange::from_name(v).ok_or_else(|| {
                    bad_value(file, field, "vif_range", v, "a named vif range such as Volume, AnyEnergyVIF, DateTime")
                })?;
                m = m.vif_range(r);
            }
            "vif_raw" => {
                let raw = parse_u64(v)
                    .ok_or_else(|| bad_value(file, field, "vif_raw", v, "a number"))?;
                m = m.vif_raw(raw as u16);
            }
            "storage_nr" | "tariff_nr" | "subunit_nr" => {
                let (from, to) = match v.split_once(',') {
                    Some((a, b)) => (
                        parse_u64(a.trim()).ok_or_else(|| bad_value(file, field, k, v, "a number or from,to"))?,
                        parse_u64(b.trim()).ok_or_else(|| bad_value(file, field, k, v, "a number or from,to"))?,
                    ),
                    None => {
                        let n = parse_u64(v).ok_or_else(|| bad_value(file, field, k, v, "a number or from,to"))?;
                        (n, n)
                    }
                };
                m = match k.as_str() {
                    "storage_nr" => m.storage_range(from, to),
                    "tariff_nr" => m.tariff_range(from, to),
                    _ => m.subunit_range(from, to),
                };
            }
            "add_combinable" => {
                let c = VifCombinable::from_name(v).ok_or_else(|| {
                    bad_value(file, field, "add_combinable", v, "a named vif combinable such as ForwardFlow")
                })?;
                m = m.combinable(c);
            }
            "add_combinable_raw" => {
                let raw = parse_u64(v)
                    .ok_or_else(|| bad_value(file, field, "add_combinable_raw", v, "a number"))?;
                m = m.combinable_raw(raw as u16);
            }
            "index_nr" => {
                let n = parse_u64(v).ok_or_else(|| bad_value(file, field, "index_nr", v, "a number"))?;
                m = m.index_nr(n as usize);
            }
            _ => {
                return Err(bad_value(
                    file,
                    field,
                    "match entry",
                    k,
                    "difvif_key, measurement_type, vif_range, vif_raw, storage_nr, tariff_nr, subunit_nr, add_combinable, add_combinable_raw, index_nr",
                ))
            }
        }
    }
    Ok(m)
}

fn parse_lookup(file: &str, field: &str, items: &[Item]) -> Result<Lookup, DynamicError> {
    let name = value_of(items, "name")
        .ok_or_else(|| bad_value(file, field, "lookup", "", "a name entry"))?;
    let map_type_s = value_of(items, "map_type").unwrap_or_else(|| "BitToString".to_string());
    let map_type = MapType::from_name(&map_type_s).ok_or_else(|| {
        bad_value(file, field, "map_type", &map_type_s, "BitToString, IndexToString, DecimalsToString")
    })?;
    let mask_s = value_of(items, "mask_bits").unwrap_or_else(|| "0xffffffff".to_string());
    let mask = parse_u64(&mask_s)
        .ok_or_else(|| bad_value(file, field, "mask_bits", &mask_s, "a number"))?;

    let mut maps = Vec::new();
    for map_items in blocks_of(items, "map") {
        let to = value_of(map_items, "to")
            .ok_or_else(|| bad_value(file, field, "map", "", "a to entry"))?;
        let value_s = value_of(map_items, "value")
            .ok_or_else(|| bad_value(file, field, "map", "", "a value entry"))?;
        let value = parse_u64(&value_s)
            .ok_or_else(|| bad_value(file, field, "map value", &value_s, "a number"))?;
        let test_s = value_of(map_items, "test").unwrap_or_else(|| "Set".to_string());
        let map = match test_s.as_str() {
            "Set" => Map::set(value, &to),
            "NotSet" => Map::not_set(value, &to),
            _ => return Err(bad_value(file, field, "test", &test_s, "Set, NotSet")),
        };
        maps.push(map);
    }

    let mut rule = Rule::new(&name, map_type, mask, maps);
    if let Some(d) = value_of(items, "default_message") {
        rule.default_message = d;
    }
    Ok(Lookup::new(vec![rule]))
}

fn parse_field(file: &str, items: &[Item]) -> Result<FieldSpec, DynamicError> {
    let name = value_of(items, "name").ok_or_else(|| DynamicError::Missing {
        file: file.to_string(),
        entry: "field/name".to_string(),
    })?;

    let quantity_s = value_of(items, "quantity").ok_or_else(|| DynamicError::Missing {
        file: file.to_string(),
        entry: format!("field {name} quantity"),
    })?;
    let quantity = quantity_from_name(&quantity_s).ok_or_else(|| {
        bad_value(file, &name, "quantity", &quantity_s, "Energy, Volume, Power, Flow, Temperature, Pressure, Time, PointInTime, Dimensionless, Text, ...")
    })?;

    let vif_scaling_s = value_of(items, "vif_scaling").unwrap_or_else(|| "Auto".to_string());
    let vif_scaling = VifScaling::from_name(&vif_scaling_s)
        .ok_or_else(|| bad_value(file, &name, "vif_scaling", &vif_scaling_s, "Auto, None"))?;

    let signedness_s = value_of(items, "dif_signedness").unwrap_or_else(|| "Signed".to_string());
    let dif_signedness = DifSignedness::from_name(&signedness_s)
        .ok_or_else(|| bad_value(file, &name, "dif_signedness", &signedness_s, "Signed, Unsigned"))?;

    let display_unit = match value_of(items, "display_unit") {
        Some(u) => Some(
            Unit::from_suffix(&u)
                .ok_or_else(|| bad_value(file, &name, "display_unit", &u, "a unit suffix such as kwh, m3, c"))?,
        ),
        None => None,
    };

    let force_scale = match value_of(items, "force_scale") {
        Some(s) => Some(
            s.parse::<f64>()
                .map_err(|_| bad_value(file, &name, "force_scale", &s, "a number"))?,
        ),
        None => None,
    };

    let attributes = match value_of(items, "attributes") {
        Some(a) => PrintProperties::from_names(&a).ok_or_else(|| {
            bad_value(file, &name, "attributes", &a, "STATUS, INCLUDE_TPL_STATUS, INJECT_INTO_STATUS, HIDE, DEPRECATED, REQUIRED")
        })?,
        None => PrintProperties::default(),
    };

    let matcher = match blocks_of(items, "match").first() {
        Some(b) => Some(parse_matcher(file, &name, b)?),
        None => None,
    };
    let lookup = match blocks_of(items, "lookup").first() {
        Some(b) => Some(parse_lookup(file, &name, b)?),
        None => None,
    };

    Ok(FieldSpec {
        name,
        quantity,
        info: value_of(items, "info").unwrap_or_default(),
        vif_scaling,
        dif_signedness,
        display_unit,
        force_scale,
        attributes,
        calculate: value_of(items, "calculate"),
        matcher,
        lookup,
    })
}

fn quantity_from_name(s: &str) -> Option<Quantity> {
    match s {
        "Energy" => Some(Quantity::Energy),
        "Reactive_Energy" | "ReactiveEnergy" => Some(Quantity::ReactiveEnergy),
        "Apparent_Energy" | "ApparentEnergy" => Some(Quantity::ApparentEnergy),
        "Power" => Some(Quantity::Power),
        "Volume" => Some(Quantity::Volume),
        "Flow" => Some(Quantity::Flow),
        "Mass" => Some(Quantity::Mass),
        "MassFlow" => Some(Quantity::MassFlow),
        "Temperature" => Some(Quantity::Temperature),
        "Pressure" => Some(Quantity::Pressure),
        "Frequency" => Some(Quantity::Frequency),
        "Time" => Some(Quantity::Time),
        "PointInTime" => Some(Quantity::PointInTime),
        "Voltage" => Some(Quantity::Voltage),
        "Amperage" => Some(Quantity::Amperage),
        "Angle" => Some(Quantity::Angle),
        "Speed" => Some(Quantity::Speed),
        "RelativeHumidity" => Some(Quantity::RelativeHumidity),
        "HCA" => Some(Quantity::Hca),
        "Dimensionless" => Some(Quantity::Dimensionless),
        "Text" => Some(Quantity::Text),
        _ => None,
    }
}

impl FieldSpec {
    fn add_to(&self, m: &mut Meter) {
        let display_unit = self
            .display_unit
            .unwrap_or_else(|| crate::units::default_unit_for_quantity(self.quantity));

        if self.quantity == Quantity::Text {
            match (&self.matcher, &self.lookup) {
                (Some(matcher), Some(lookup)) => m.add_string_field_with_extractor_and_lookup(
                    &self.name,
                    &self.info,
                    self.attributes,
                    matcher.clone(),
                    lookup.clone(),
                ),
                (Some(matcher), None) => m.add_string_field_with_extractor(
                    &self.name,
                    &self.info,
                    self.attributes,
                    matcher.clone(),
                ),
                _ => m.add_string_field(&self.name, &self.info, self.attributes),
            }
            return;
        }

        if let Some(formula) = &self.calculate {
            m.add_numeric_field_with_calculator(
                &self.name,
                &self.info,
                self.attributes,
                self.quantity,
                formula,
            );
            return;
        }

        match &self.matcher {
            Some(matcher) => m.add_numeric_field_with_extractor_and_unit(
                &self.name,
                &self.info,
                self.attributes,
                self.quantity,
                self.vif_scaling,
                self.dif_signedness,
                matcher.clone(),
                display_unit,
            ),
            None => m.add_numeric_field(&self.name, self.quantity, self.attributes, &self.info),
        }
        if let Some(scale) = self.force_scale {
            m.set_field_force_scale(&self.name, scale);
        }
    }
}

/// Parse a driver file into a [`DriverInfo`], without registering it.
pub fn parse_driver(file: &str, content: &str) -> Result<DriverInfo, DynamicError> {
    let mut lines = content.lines().enumerate();
    let top = parse_items(file, &mut lines)?;

    let driver_blocks = blocks_of(&top, "driver");
    let items = driver_blocks.first().ok_or_else(|| DynamicError::Missing {
        file: file.to_string(),
        entry: "driver { ... }".to_string(),
    })?;

    let name = value_of(items, "name").ok_or_else(|| DynamicError::Missing {
        file: file.to_string(),
        entry: "driver/name".to_string(),
    })?;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(bad_value(file, &name, "name", &name, "lowercase letters and digits"));
    }

    let meter_type_s = value_of(items, "meter_type").ok_or_else(|| DynamicError::Missing {
        file: file.to_string(),
        entry: "driver/meter_type".to_string(),
    })?;
    let meter_type = MeterType::from_name(&meter_type_s).ok_or_else(|| {
        bad_value(file, &name, "meter_type", &meter_type_s, "WaterMeter, HeatMeter, ElectricityMeter, GasMeter, ...")
    })?;

    let mut di = DriverInfo::new(&name, meter_type);
    di.dynamic_file_name = Some(file.to_string());

    if let Some(fields) = value_of(items, "default_fields") {
        di.default_fields = fields.split(',').map(|s| s.trim().to_string()).collect();
    }

    for detect_items in blocks_of(items, "detect") {
        for item in detect_items.iter() {
            let Item::Value(k, v) = item else { continue };
            if k != "mvt" {
                continue;
            }
            // mvt = MMM,VV,TT: manufacturer flag, version, type.
            let parts: Vec<&str> = v.split(',').map(str::trim).collect();
            if parts.len() != 3 {
                return Err(bad_value(file, &name, "mvt", v, "MMM,VV,TT"));
            }
            let mfct = flag_to_manufacturer(parts[0])
                .map_err(|_| bad_value(file, &name, "mvt manufacturer", parts[0], "three letters A-Z"))?;
            let version = u8::from_str_radix(parts[1], 16)
                .map_err(|_| bad_value(file, &name, "mvt version", parts[1], "a hex byte"))?;
            let mtype = u8::from_str_radix(parts[2], 16)
                .map_err(|_| bad_value(file, &name, "mvt type", parts[2], "a hex byte"))?;
            di.detect.push(DriverDetect { mfct, mtype, version });
        }
    }

    let mut library_uses: Vec<String> = Vec::new();
    for lib_items in blocks_of(items, "library") {
        if let Some(uses) = value_of(lib_items, "use") {
            for u in uses.split(',').map(str::trim).filter(|u| !u.is_empty()) {
                if !LIBRARY_FIELDS.contains(&u) {
                    return Err(bad_value(file, &name, "library use", u, &LIBRARY_FIELDS.join(", ")));
                }
                library_uses.push(u.to_string());
            }
        }
    }

    let mut specs: Vec<FieldSpec> = Vec::new();
    for fields_items in blocks_of(items, "fields") {
        for field_items in blocks_of(fields_items, "field") {
            specs.push(parse_field(file, field_items)?);
        }
    }
    for field_items in blocks_of(items, "field") {
        specs.push(parse_field(file, field_items)?);
    }

    let specs = Arc::new(specs);
    let uses = Arc::new(library_uses);
    di.setup_fields = Arc::new(move |m: &mut Meter| {
        for u in uses.iter() {
            add_library_field(m, u);
        }
        for spec in specs.iter() {
            spec.add_to(m);
        }
    });

    debug!("(driver) parsed dynamic driver {name} from {file}");
    Ok(di)
}

/// Parse and register a driver file. A dynamic driver may replace a
/// built-in with the same name or detection triplet.
pub fn load_driver(file: &str, content: &str) -> Result<String, DynamicError> {
    let di = parse_driver(file, content)?;
    let name = di.name.clone();
    register_dynamic_driver(di).map_err(|e| DynamicError::Registration {
        file: file.to_string(),
        error: e.to_string(),
    })?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRIVER: &str = r#"
// A simple water meter driver.
driver {
    name           = aquatest
    meter_type     = WaterMeter
    default_fields = name,id,total_m3,timestamp
    detect { mvt = AQT,14,07 }
    library { use = total_m3 }
    field {
        name           = target
        quantity       = Volume
        info           = 'Volume at the billing date.'
        vif_scaling    = Auto
        dif_signedness = Signed
        match {
            measurement_type = Instantaneous
            vif_range        = Volume
            storage_nr       = 1
        }
    }
    field {
        name     = status
        quantity = Text
        info     = 'Status and error flags.'
        attributes = STATUS,INCLUDE_TPL_STATUS
        match { difvif_key = 02FF20 }
        lookup {
            name      = ERROR_FLAGS
            map_type  = BitToString
            mask_bits = 0xffff
            map { to = DRY, value = 0x01, test = Set }
            map { to = REVERSE, value = 0x02, test = Set }
        }
    }
}
"#;

    #[test]
    fn test_parse_and_build() {
        let di = parse_driver("aquatest.wmd", DRIVER).unwrap();
        assert_eq!(di.name, "aquatest");
        assert_eq!(di.meter_type, MeterType::WaterMeter);
        assert_eq!(di.detect.len(), 1);
        assert_eq!(di.detect[0].version, 0x14);
        assert_eq!(di.detect[0].mtype, 0x07);
        assert!(di.is_dynamic());
    }

    #[test]
    fn test_unknown_quantity_is_reported() {
        let bad = DRIVER.replace("quantity       = Volume", "quantity       = Volumetric");
        let err = parse_driver("aquatest.wmd", &bad).unwrap_err();
        match err {
            DynamicError::BadValue { entry, value, .. } => {
                assert_eq!(entry, "quantity");
                assert_eq!(value, "Volumetric");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unknown_vif_range_is_reported() {
        let bad = DRIVER.replace("vif_range        = Volume", "vif_range        = Volumes");
        assert!(matches!(
            parse_driver("aquatest.wmd", &bad),
            Err(DynamicError::BadValue { .. })
        ));
    }

    #[test]
    fn test_unknown_library_field_is_reported() {
        let bad = DRIVER.replace("use = total_m3", "use = bogus_field");
        assert!(matches!(
            parse_driver("aquatest.wmd", &bad),
            Err(DynamicError::BadValue { .. })
        ));
    }

    #[test]
    fn test_missing_name_is_reported() {
        let bad = DRIVER.replace("name           = aquatest", "");
        assert!(matches!(
            parse_driver("aquatest.wmd", &bad),
            Err(DynamicError::Missing { .. })
        ));
    }

    #[test]
    fn test_bad_test_bit_is_reported() {
        let bad = DRIVER.replace("test = Set", "test = Sometimes");
        assert!(matches!(
            parse_driver("aquatest.wmd", &bad),
            Err(DynamicError::BadValue { .. })
        ));
    }
}
