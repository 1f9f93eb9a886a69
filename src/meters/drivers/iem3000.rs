//! Schneider Electric iEM3000 series energy meters.

use std::sync::Arc;

use crate::bus::{LinkMode, LinkModeSet};
use crate::meters::fields::{DifSignedness, FieldMatcher, PrintProperties, VifScaling};
use crate::meters::registry::{register_driver, DriverError, DriverInfo};
use crate::meters::MeterType;
use crate::payload::dif::MeasurementType;
use crate::payload::vif::VifRange;
use crate::translate::{Lookup, Map, MapType, Rule};
use crate::units::{Quantity, Unit};

use super::detect;

pub fn register() -> Result<(), DriverError> {
    let mut di = DriverInfo::new("iem3000", MeterType::ElectricityMeter);
    di.default_fields = vec![
        "name".to_string(),
        "id".to_string(),
        "total_energy_consumption_kwh".to_string(),
        "timestamp".to_string(),
    ];
    di.default_link_modes = LinkModeSet::of(&[LinkMode::T1]);
    di.detect = vec![
        detect("SEC", 0x02, 0x13),
        detect("SEC", 0x02, 0x15),
        detect("SEC", 0x02, 0x18),
    ];
    di.setup_fields = Arc::new(setup_fields);
    register_driver(di)
}

fn error_code_lookup() -> Lookup {
    Lookup::new(vec![Rule::new(
        "ERROR_FLAGS",
        MapType::IndexToString,
        0xffffff,
        vec![
            Map::set(0x000000, "CODE_101_EEPROM_ERROR"),
            Map::set(0x000010, "CODE_102_NO_CALIBRATION_TABLE"),
            Map::set(0x000020, "CODE_201_MISMATCH_BETWEEN_FREQUENCY_SETTINGS_AND_FREQUENCY_MEASUREMENTS"),
            Map::set(0x000030, "CODE_202_PHASE_SEQUENCE_REVERSED"),
            Map::set(0x000040, "CODE_203_PHASE_SEQUENCE_REVERSED"),
            Map::set(0x000050, "CODE_204_TOTAL_ACTIVE_ENERGY_NEGATIVE_DUE_TO_INCORRECT_V_OR_A_CONNECTIONS"),
            Map::set(0x000060, "CODE_205_DATE_TIME_RESET_DUE_TO_POWER_FAILUER"),
            Map::set(0x000070, "CODE_206_PULSE_MISSING_DUE_TO_OVERSPEED_OF_ENERGY_PULSE_OUTPUT"),
            Map::set(0x000080, "CODE_207_ABNORMAL_INTERNAL_CLOCK_FUNCTION"),
            Map::set(0x000090, "INTERNAL_DATA_BUS_COMUNICATION_ERROR"),
        ],
    )])
}

fn setup_fields(m: &mut crate::meters::Meter) {
    super::add_library_fields(m, "meter_datetime");

    m.add_string_field(
        "status",
        "Status and error flags.",
        PrintProperties::STATUS | PrintProperties::INCLUDE_TPL_STATUS,
    );

    m.add_string_field_with_extractor_and_lookup(
        "error_flags",
        "Error flags.",
        PrintProperties::INJECT_INTO_STATUS,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::ErrorFlags),
        error_code_lookup(),
    );

    m.add_numeric_field_with_extractor(
        "total_energy_consumption",
        "Total cumulative active imported energy.",
        PrintProperties::default(),
        Quantity::Energy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyEnergyVIF),
    );

    m.add_numeric_field_with_extractor(
        "partial_energy_consumption",
        "Partial cumulative active imported energy.",
        PrintProperties::default(),
        Quantity::Energy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyEnergyVIF)
            .combinable_raw(0x7f0d),
    );

    m.add_numeric_field_with_extractor(
        "total_energy_consumption_tariff_{tariff_counter}",
        "Total cumulative active imported energy per tariff.",
        PrintProperties::default(),
        Quantity::Energy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyEnergyVIF)
            .tariff_range(1, 4),
    );

    m.add_numeric_field_with_extractor(
        "total_energy_production",
        "Total cumulative active exported energy.",
        PrintProperties::default(),
        Quantity::Energy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyEnergyVIF)
            .combinable_raw(0x7f09),
    );

    m.add_numeric_field_with_extractor(
        "total_energy_production_tariff_{tariff_counter}",
        "Total cumulative active exported energy per tariff.",
        PrintProperties::default(),
        Quantity::Energy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyEnergyVIF)
            .tariff_range(1, 4)
            .subunit(1),
    );

    m.add_numeric_field_with_extractor(
        "total_reactive_energy_consumption",
        "Total cumulative reactive imported energy.",
        PrintProperties::default(),
        Quantity::ReactiveEnergy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::ReactiveEnergy),
    );

    m.add_numeric_field_with_extractor(
        "total_reactive_energy_consumption_tariff_{tariff_counter}",
        "Total cumulative reactive imported energy per tariff.",
        PrintProperties::default(),
        Quantity::ReactiveEnergy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::ReactiveEnergy)
            .tariff_range(1, 4),
    );

    m.add_numeric_field_with_extractor_and_unit(
        "active_tariff",
        "Active tariff.",
        PrintProperties::default(),
        Quantity::Dimensionless,
        VifScaling::None,
        DifSignedness::Unsigned,
        FieldMatcher::build().dif_vif_key("03FF10"),
        Unit::Number,
    );

    m.add_numeric_field_with_extractor(
        "power",
        "Total active power.",
        PrintProperties::default(),
        Quantity::Power,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyPowerVIF),
    );
}
