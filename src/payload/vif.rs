//! # VIF Tables
//!
//! The value information field identifies what a data record measures. The
//! 7-bit primary table covers energy/volume/power/temperature and friends;
//! the markers 0xFB, 0xFD, 0xEF and 0xFF escape into extension tables where
//! the true VIF is `(first & 0x7f) << 8 | (second & 0x7f)`. VIFE bytes after
//! the value information are *combinable* modifiers (per-tariff, direction,
//! limit values, ...) kept separately from the VIF itself.

use crate::units::Unit;
use serde::Serialize;

/// Named VIF ranges. The `Any*` entries are deliberate supersets used by
/// drivers that accept any energy/volume/power coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VifRange {
    None,
    Any,
    EnergyWh,
    EnergyMJ,
    EnergyMWh,
    EnergyGJ,
    Volume,
    Mass,
    OnTime,
    OperatingTime,
    PowerW,
    PowerJh,
    VolumeFlow,
    VolumeFlowExt,
    VolumeFlowExt2,
    MassFlow,
    FlowTemperature,
    ReturnTemperature,
    TemperatureDifference,
    ExternalTemperature,
    Pressure,
    Date,
    DateTime,
    HeatCostAllocation,
    AveragingDuration,
    ActualityDuration,
    FabricationNo,
    EnhancedIdentification,
    BusAddress,
    ReactiveEnergy,
    ApparentEnergy,
    Credit,
    Debit,
    AccessNumber,
    Medium,
    Manufacturer,
    ParameterSet,
    ModelVersion,
    HardwareVersion,
    FirmwareVersion,
    SoftwareVersion,
    CustomerLocation,
    Customer,
    ErrorFlags,
    ErrorMask,
    DigitalOutput,
    DigitalInput,
    BaudRate,
    Voltage,
    Amperage,
    ResetCounter,
    CumulationCounter,
    RemainingBattery,
    AnyVolumeVIF,
    AnyEnergyVIF,
    AnyPowerVIF,
}

/// (range, from, to, default display unit). Extended VIFs are encoded with
/// the escape byte's low 7 bits shifted up: 0xFD 0x17 becomes 0x7d17.
const VIF_RANGES: &[(VifRange, u16, u16, Unit)] = &[
    (VifRange::EnergyWh, 0x00, 0x07, Unit::KWH),
    (VifRange::EnergyMJ, 0x08, 0x0f, Unit::MJ),
    (VifRange::Volume, 0x10, 0x17, Unit::M3),
    (VifRange::Mass, 0x18, 0x1f, Unit::KG),
    (VifRange::OnTime, 0x20, 0x23, Unit::Hour),
    (VifRange::OperatingTime, 0x24, 0x27, Unit::Hour),
    (VifRange::PowerW, 0x28, 0x2f, Unit::KW),
    (VifRange::PowerJh, 0x30, 0x37, Unit::KW),
    (VifRange::VolumeFlow, 0x38, 0x3f, Unit::M3H),
    (VifRange::VolumeFlowExt, 0x40, 0x47, Unit::M3H),
    (VifRange::VolumeFlowExt2, 0x48, 0x4f, Unit::M3H),
    (VifRange::MassFlow, 0x50, 0x57, Unit::KGH),
    (VifRange::FlowTemperature, 0x58, 0x5b, Unit::C),
    (VifRange::ReturnTemperature, 0x5c, 0x5f, Unit::C),
    (VifRange::TemperatureDifference, 0x60, 0x63, Unit::K),
    (VifRange::ExternalTemperature, 0x64, 0x67, Unit::C),
    (VifRange::Pressure, 0x68, 0x6b, Unit::BAR),
    (VifRange::Date, 0x6c, 0x6c, Unit::DateLT),
    (VifRange::DateTime, 0x6d, 0x6d, Unit::DateTimeLT),
    (VifRange::HeatCostAllocation, 0x6e, 0x6e, Unit::HCA),
    (VifRange::AveragingDuration, 0x70, 0x73, Unit::Hour),
    (VifRange::ActualityDuration, 0x74, 0x77, Unit::Hour),
    (VifRange::FabricationNo, 0x78, 0x78, Unit::Text),
    (VifRange::EnhancedIdentification, 0x79, 0x79, Unit::Text),
    (VifRange::BusAddress, 0x7a, 0x7a, Unit::Number),
    // First extension table, escape 0xFB.
    (VifRange::EnergyMWh, 0x7b00, 0x7b01, Unit::KWH),
    (VifRange::EnergyGJ, 0x7b08, 0x7b09, Unit::GJ),
    (VifRange::ReactiveEnergy, 0x7b82, 0x7b83, Unit::KVARH),
    (VifRange::ApparentEnergy, 0x7b94, 0x7b95, Unit::KVAH),
    // Second extension table, escape 0xFD.
    (VifRange::Credit, 0x7d00, 0x7d03, Unit::Number),
    (VifRange::Debit, 0x7d04, 0x7d07, Unit::Number),
    (VifRange::AccessNumber, 0x7d08, 0x7d08, Unit::Counter),
    (VifRange::Medium, 0x7d09, 0x7d09, Unit::Number),
    (VifRange::Manufacturer, 0x7d0a, 0x7d0a, Unit::Number),
    (VifRange::ParameterSet, 0x7d0b, 0x7d0b, Unit::Text),
    (VifRange::ModelVersion, 0x7d0c, 0x7d0c, Unit::Text),
    (VifRange::HardwareVersion, 0x7d0d, 0x7d0d, Unit::Text),
    (VifRange::FirmwareVersion, 0x7d0e, 0x7d0e, Unit::Text),
    (VifRange::SoftwareVersion, 0x7d0f, 0x7d0f, Unit::Text),
    (VifRange::CustomerLocation, 0x7d10, 0x7d10, Unit::Text),
    (VifRange::Customer, 0x7d11, 0x7d11, Unit::Text),
    (VifRange::ErrorFlags, 0x7d17, 0x7d17, Unit::Text),
    (VifRange::ErrorMask, 0x7d18, 0x7d18, Unit::Text),
    (VifRange::DigitalOutput, 0x7d1a, 0x7d1a, Unit::Number),
    (VifRange::DigitalInput, 0x7d1b, 0x7d1b, Unit::Number),
    (VifRange::BaudRate, 0x7d1c, 0x7d1c, Unit::Number),
    (VifRange::Voltage, 0x7d40, 0x7d4f, Unit::Volt),
    (VifRange::Amperage, 0x7d50, 0x7d5f, Unit::Ampere),
    (VifRange::ResetCounter, 0x7d60, 0x7d60, Unit::Counter),
    (VifRange::CumulationCounter, 0x7d61, 0x7d61, Unit::Counter),
    (VifRange::RemainingBattery, 0x7d74, 0x7d74, Unit::Day),
];

/// Is the given full VIF inside the named range?
pub fn is_inside_vif_range(vif: u16, range: VifRange) -> bool {
    match range {
        VifRange::None => return false,
        VifRange::Any => return true,
        // Supersets. More members exist in the standard and are added to
        // these lists as meters surface them.
        VifRange::AnyVolumeVIF => {
            return is_inside_vif_range(vif, VifRange::Volume);
        }
        VifRange::AnyEnergyVIF => {
            return is_inside_vif_range(vif, VifRange::EnergyWh)
                || is_inside_vif_range(vif, VifRange::EnergyMJ)
                || is_inside_vif_range(vif, VifRange::EnergyMWh)
                || is_inside_vif_range(vif, VifRange::EnergyGJ);
        }
        VifRange::AnyPowerVIF => {
            return is_inside_vif_range(vif, VifRange::PowerW)
                || is_inside_vif_range(vif, VifRange::PowerJh);
        }
        _ => {}
    }
    VIF_RANGES
        .iter()
        .any(|(r, from, to, _)| *r == range && (*from..=*to).contains(&vif))
}

/// Which named range does the VIF fall into?
pub fn vif_range_of(vif: u16) -> VifRange {
    for (r, from, to, _) in VIF_RANGES {
        if (*from..=*to).contains(&vif) {
            return *r;
        }
    }
    VifRange::None
}

/// The unit a raw value in this range scales into.
pub fn default_unit_for_vif(vif: u16) -> Option<Unit> {
    for (_, from, to, unit) in VIF_RANGES {
        if (*from..=*to).contains(&vif) {
            return Some(*unit);
        }
    }
    None
}

pub fn default_unit_for_vif_range(range: VifRange) -> Option<Unit> {
    VIF_RANGES
        .iter()
        .find(|(r, _, _, _)| *r == range)
        .map(|(_, _, _, u)| *u)
}

/// Divisor that turns the raw integer into the range's display unit.
///
/// Raw values arrive in the sub-unit selected by the low VIF bits, eg
/// volume VIF 0x13 counts litres, so the scale is 1000 to reach m3.
pub fn vif_scale(vif: u16) -> f64 {
    let n = (vif & 0x07) as i32;
    match vif {
        // Energy a * 10^(n-3) Wh, displayed in kWh.
        0x00..=0x07 => 10f64.powi(6 - n),
        // Energy a * 10^n J, displayed in MJ.
        0x08..=0x0f => 10f64.powi(6 - n),
        // Volume a * 10^(n-6) m3.
        0x10..=0x17 => 10f64.powi(6 - n),
        // Mass a * 10^(n-3) kg.
        0x18..=0x1f => 10f64.powi(3 - n),
        // Durations in seconds/minutes/hours/days, displayed in hours.
        0x20..=0x27 | 0x70..=0x77 => match vif & 0x03 {
            0x00 => 3600.0,
            0x01 => 60.0,
            0x02 => 1.0,
            _ => 1.0 / 24.0,
        },
        // Power a * 10^(n-3) W, displayed in kW.
        0x28..=0x2f => 10f64.powi(6 - n),
        // Power a * 10^n J/h, displayed in kW.
        0x30..=0x37 => 3.6e9 / 10f64.powi(n),
        // Volume flow a * 10^(n-6) m3/h.
        0x38..=0x3f => 10f64.powi(6 - n),
        // Volume flow a * 10^(n-7) m3/min, displayed in m3/h.
        0x40..=0x47 => 10f64.powi(7 - n) / 60.0,
        // Volume flow a * 10^(n-9) m3/s, displayed in m3/h.
        0x48..=0x4f => 10f64.powi(9 - n) / 3600.0,
        // Mass flow a * 10^(n-3) kg/h.
        0x50..=0x57 => 10f64.powi(3 - n),
        // Temperatures a * 10^(nn-3) C or K.
        0x58..=0x6b => 10f64.powi(3 - (vif & 0x03) as i32),
        // Energy a * 10^(n-1) MWh, displayed in kWh.
        0x7b00..=0x7b01 => 10f64.powi(1 - (vif & 0x01) as i32) / 1000.0,
        // Energy a * 10^(n-1) GJ.
        0x7b08..=0x7b09 => 10f64.powi(1 - (vif & 0x01) as i32),
        // Reactive energy a * 10^(n-3) kvarh.
        0x7b82..=0x7b83 => 10f64.powi(3 - (vif & 0x01) as i32),
        // Apparent energy a * 10^(n-3) kvah.
        0x7b94..=0x7b95 => 10f64.powi(3 - (vif & 0x01) as i32),
        // Voltage a * 10^(nnnn-9) V.
        0x7d40..=0x7d4f => 10f64.powi(9 - (vif & 0x0f) as i32),
        // Amperage a * 10^(nnnn-12) A.
        0x7d50..=0x7d5f => 10f64.powi(12 - (vif & 0x0f) as i32),
        _ => 1.0,
    }
}

/// Named combinable VIFE modifiers. Unknown codes are kept raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum VifCombinable {
    None,
    Any,
    PerSecond,
    PerMinute,
    PerHour,
    PerDay,
    PerWeek,
    PerMonth,
    PerYear,
    PerRevolution,
    IncrPerInputPulseChannel0,
    IncrPerInputPulseChannel1,
    IncrPerOutputPulseChannel0,
    IncrPerOutputPulseChannel1,
    PerLitre,
    PerM3,
    PerKg,
    PerKelvin,
    PerKWh,
    PerGJ,
    PerKW,
    PerKelvinLitre,
    PerVolt,
    PerAmpere,
    MultipliedByS,
    MultipliedBySDivV,
    MultipliedBySDivA,
    StartDateTimeOfAB,
    UncorrectedMeterUnit,
    ForwardFlow,
    BackwardFlow,
    ValueAtBaseCond,
    ObisDeclaration,
    LowerLimit,
    ExceedsLowerLimit,
    UpperLimit,
    ExceedsUpperLimit,
    Mfct21,
}

const VIF_COMBINABLES: &[(VifCombinable, u16, u16)] = &[
    (VifCombinable::PerSecond, 0x20, 0x20),
    (VifCombinable::PerMinute, 0x21, 0x21),
    (VifCombinable::PerHour, 0x22, 0x22),
    (VifCombinable::PerDay, 0x23, 0x23),
    (VifCombinable::PerWeek, 0x24, 0x24),
    (VifCombinable::PerMonth, 0x25, 0x25),
    (VifCombinable::PerYear, 0x26, 0x26),
    (VifCombinable::PerRevolution, 0x27, 0x27),
    (VifCombinable::IncrPerInputPulseChannel0, 0x28, 0x28),
    (VifCombinable::IncrPerInputPulseChannel1, 0x29, 0x29),
    (VifCombinable::IncrPerOutputPulseChannel0, 0x2a, 0x2a),
    (VifCombinable::IncrPerOutputPulseChannel1, 0x2b, 0x2b),
    (VifCombinable::PerLitre, 0x2c, 0x2c),
    (VifCombinable::PerM3, 0x2d, 0x2d),
    (VifCombinable::PerKg, 0x2e, 0x2e),
    (VifCombinable::PerKelvin, 0x2f, 0x2f),
    (VifCombinable::PerKWh, 0x30, 0x30),
    (VifCombinable::PerGJ, 0x31, 0x31),
    (VifCombinable::PerKW, 0x32, 0x32),
    (VifCombinable::PerKelvinLitre, 0x33, 0x33),
    (VifCombinable::PerVolt, 0x34, 0x34),
    (VifCombinable::PerAmpere, 0x35, 0x35),
    (VifCombinable::MultipliedByS, 0x36, 0x36),
    (VifCombinable::MultipliedBySDivV, 0x37, 0x37),
    (VifCombinable::MultipliedBySDivA, 0x38, 0x38),
    (VifCombinable::StartDateTimeOfAB, 0x39, 0x39),
    (VifCombinable::UncorrectedMeterUnit, 0x3a, 0x3a),
    (VifCombinable::ForwardFlow, 0x3b, 0x3b),
    (VifCombinable::BackwardFlow, 0x3c, 0x3c),
    (VifCombinable::ValueAtBaseCond, 0x3e, 0x3e),
    (VifCombinable::ObisDeclaration, 0x3f, 0x3f),
    (VifCombinable::ExceedsLowerLimit, 0x41, 0x41),
    (VifCombinable::ExceedsUpperLimit, 0x49, 0x49),
    (VifCombinable::LowerLimit, 0x40, 0x47),
    (VifCombinable::UpperLimit, 0x48, 0x4f),
    (VifCombinable::Mfct21, 0x7f21, 0x7f21),
];

/// Map a raw combinable code to its named variant, if any.
pub fn to_vif_combinable(code: u16) -> VifCombinable {
    for (c, from, to) in VIF_COMBINABLES {
        if (*from..=*to).contains(&code) {
            return *c;
        }
    }
    VifCombinable::None
}

impl VifCombinable {
    pub fn from_name(s: &str) -> Option<VifCombinable> {
        VIF_COMBINABLES
            .iter()
            .map(|(c, _, _)| *c)
            .find(|c| format!("{c:?}") == s)
    }
}

impl VifRange {
    pub fn from_name(s: &str) -> Option<VifRange> {
        if s == "Any" {
            return Some(VifRange::Any);
        }
        if s == "AnyVolumeVIF" {
            return Some(VifRange::AnyVolumeVIF);
        }
        if s == "AnyEnergyVIF" {
            return Some(VifRange::AnyEnergyVIF);
        }
        if s == "AnyPowerVIF" {
            return Some(VifRange::AnyPowerVIF);
        }
        VIF_RANGES
            .iter()
            .map(|(r, _, _, _)| *r)
            .find(|r| format!("{r:?}") == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_scale() {
        // VIF 0x13 counts litres.
        assert_eq!(vif_scale(0x13), 1000.0);
        assert_eq!(vif_scale(0x16), 1.0);
        assert_eq!(default_unit_for_vif(0x13), Some(Unit::M3));
    }

    #[test]
    fn test_energy_scale() {
        // VIF 0x06 counts kWh directly.
        assert_eq!(vif_scale(0x06), 1.0);
        assert_eq!(vif_scale(0x03), 1000.0); // Wh
        assert_eq!(default_unit_for_vif(0x06), Some(Unit::KWH));
    }

    #[test]
    fn test_power_scale() {
        // VIF 0x2d counts hectowatt, displayed in kW.
        assert_eq!(vif_scale(0x2d), 10.0);
    }

    #[test]
    fn test_temperature_scale() {
        // VIF 0x59 counts centidegrees.
        assert_eq!(vif_scale(0x59), 100.0);
    }

    #[test]
    fn test_supersets() {
        assert!(is_inside_vif_range(0x06, VifRange::AnyEnergyVIF));
        assert!(is_inside_vif_range(0x0d, VifRange::AnyEnergyVIF));
        assert!(is_inside_vif_range(0x13, VifRange::AnyVolumeVIF));
        assert!(is_inside_vif_range(0x2d, VifRange::AnyPowerVIF));
        assert!(!is_inside_vif_range(0x13, VifRange::AnyEnergyVIF));
    }

    #[test]
    fn test_extended_ranges() {
        assert!(is_inside_vif_range(0x7d17, VifRange::ErrorFlags));
        assert!(is_inside_vif_range(0x7d48, VifRange::Voltage));
        assert_eq!(vif_scale(0x7d48), 10.0); // decivolt
    }

    #[test]
    fn test_combinables() {
        assert_eq!(to_vif_combinable(0x3e), VifCombinable::ValueAtBaseCond);
        assert_eq!(to_vif_combinable(0x7f21), VifCombinable::Mfct21);
        assert_eq!(to_vif_combinable(0x1e), VifCombinable::None);
    }
}
