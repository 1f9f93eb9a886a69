//! # Built-in Drivers
//!
//! Most meters are pure data: a detection triplet plus field schemas. The
//! few that need bespoke post-processing implement
//! [`ContentProcessor`](crate::meters::registry::ContentProcessor).
//!
//! The library fields below are shared shorthands drivers (and dynamic
//! driver files) can pull in by name instead of restating the same
//! matcher over and over.

pub mod apatorna1;
pub mod iem3000;
pub mod kamheat;

use log::error;

use crate::meters::fields::{DifSignedness, FieldMatcher, PrintProperties, VifScaling};
use crate::meters::Meter;
use crate::payload::dif::MeasurementType;
use crate::payload::vif::VifRange;
use crate::units::Quantity;

/// Register every built-in driver. Called once before the registry is
/// first consulted.
pub fn register_all() {
    for result in [
        kamheat::register(),
        apatorna1::register(),
        iem3000::register(),
    ] {
        if let Err(e) = result {
            // A collision between built-in drivers is a programming error.
            error!("(driver) builtin registration failed: {e}");
        }
    }
}

/// The names [`add_library_field`] understands.
pub const LIBRARY_FIELDS: &[&str] = &[
    "total_m3",
    "total_kwh",
    "flow_temperature_c",
    "return_temperature_c",
    "flow_return_temperature_difference_c",
    "volume_flow_m3h",
    "power_kw",
    "fabrication_no",
    "meter_datetime",
    "on_time_h",
    "on_time_at_error_h",
];

/// Add one library field shorthand to a meter. Returns false for an
/// unknown name.
pub fn add_library_field(m: &mut Meter, name: &str) -> bool {
    let props = PrintProperties::default();
    match name {
        "total_m3" => m.add_numeric_field_with_extractor(
            "total",
            "The total volume recorded by this meter.",
            props,
            Quantity::Volume,
            VifScaling::Auto,
            DifSignedness::Signed,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::Volume),
        ),
        "total_kwh" => m.add_numeric_field_with_extractor(
            "total",
            "The total energy recorded by this meter.",
            props,
            Quantity::Energy,
            VifScaling::Auto,
            DifSignedness::Signed,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::AnyEnergyVIF),
        ),
        "flow_temperature_c" => m.add_numeric_field_with_extractor(
            "flow_temperature",
            "Forward media temperature.",
            props,
            Quantity::Temperature,
            VifScaling::Auto,
            DifSignedness::Signed,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::FlowTemperature),
        ),
        "return_temperature_c" => m.add_numeric_field_with_extractor(
            "return_temperature",
            "Return media temperature.",
            props,
            Quantity::Temperature,
            VifScaling::Auto,
            DifSignedness::Signed,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::ReturnTemperature),
        ),
        "flow_return_temperature_difference_c" => m.add_numeric_field_with_calculator(
            "flow_return_temperature_difference",
            "Difference between forward and return media temperatures.",
            props,
            Quantity::Temperature,
            "flow_temperature_c - return_temperature_c",
        ),
        "volume_flow_m3h" => m.add_numeric_field_with_extractor(
            "volume_flow",
            "Media volume flow.",
            props,
            Quantity::Flow,
            VifScaling::Auto,
            DifSignedness::Signed,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::VolumeFlow),
        ),
        "power_kw" => m.add_numeric_field_with_extractor(
            "power",
            "Current power consumption.",
            props,
            Quantity::Power,
            VifScaling::Auto,
            DifSignedness::Signed,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::AnyPowerVIF),
        ),
        "fabrication_no" => m.add_string_field_with_extractor(
            "fabrication_no",
            "Fabrication number.",
            props,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::FabricationNo),
        ),
        "meter_datetime" => m.add_string_field_with_extractor(
            "meter_datetime",
            "Date and time as reported by the meter.",
            props,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::DateTime),
        ),
        "on_time_h" => m.add_numeric_field_with_extractor(
            "on_time",
            "How long the meter has been powered.",
            props,
            Quantity::Time,
            VifScaling::Auto,
            DifSignedness::Unsigned,
            FieldMatcher::build()
                .measurement(MeasurementType::Instantaneous)
                .vif_range(VifRange::OnTime),
        ),
        "on_time_at_error_h" => m.add_numeric_field_with_extractor(
            "on_time_at_error",
            "How long the meter has been in an error state.",
            props,
            Quantity::Time,
            VifScaling::Auto,
            DifSignedness::Unsigned,
            FieldMatcher::build()
                .measurement(MeasurementType::AtError)
                .vif_range(VifRange::OnTime),
        ),
        _ => return false,
    }
    true
}

/// Add several comma separated library fields.
pub fn add_library_fields(m: &mut Meter, names: &str) {
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !add_library_field(m, name) {
            error!("(driver) unknown library field \"{name}\"");
        }
    }
}

/// Convenience for driver modules: a meter type plus detection triplets.
pub(crate) fn detect(mfct: &str, mtype: u8, version: u8) -> crate::meters::DriverDetect {
    crate::meters::DriverDetect {
        mfct: crate::address::flag_to_manufacturer(mfct).expect("valid flag"),
        mtype,
        version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meters::{create_meter, MeterInfo};

    #[test]
    fn test_library_fields_attach() {
        let mi = MeterInfo {
            name: "m".to_string(),
            driver_name: "kamheat".to_string(),
            ..MeterInfo::default()
        };
        let m = create_meter(&mi).unwrap();
        // The kamheat driver pulls in fabrication_no and the temperature
        // difference calculator from the library.
        assert!(m.field_infos().iter().any(|f| f.vname == "fabrication_no"));
        assert!(m
            .field_infos()
            .iter()
            .any(|f| f.vname == "flow_return_temperature_difference"));
    }

    #[test]
    fn test_unknown_library_field_is_rejected() {
        let mi = MeterInfo {
            name: "m".to_string(),
            driver_name: "kamheat".to_string(),
            ..MeterInfo::default()
        };
        let mut m = create_meter(&mi).unwrap();
        assert!(!add_library_field(&mut m, "bogus_field"));
    }
}
