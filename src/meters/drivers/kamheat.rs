//! Kamstrup Multical heat meters (302/303/403/602/603/803).

use std::sync::Arc;

use crate::bus::{LinkMode, LinkModeSet};
use crate::meters::fields::{DifSignedness, FieldMatcher, PrintProperties, VifScaling};
use crate::meters::registry::{register_driver, DriverError, DriverInfo};
use crate::meters::MeterType;
use crate::payload::dif::MeasurementType;
use crate::payload::vif::{VifCombinable, VifRange};
use crate::translate::{Lookup, Map, MapType, Rule};
use crate::units::{Quantity, Unit};

use super::{add_library_fields, detect};

pub fn register() -> Result<(), DriverError> {
    let mut di = DriverInfo::new("kamheat", MeterType::HeatMeter);
    di.name_aliases = vec![
        "multical302".to_string(),
        "multical303".to_string(),
        "multical403".to_string(),
        "multical602".to_string(),
        "multical603".to_string(),
        "multical803".to_string(),
    ];
    di.default_fields = vec![
        "name".to_string(),
        "id".to_string(),
        "total_energy_consumption_kwh".to_string(),
        "total_volume_m3".to_string(),
        "status".to_string(),
        "timestamp".to_string(),
    ];
    di.default_link_modes = LinkModeSet::of(&[LinkMode::C1, LinkMode::T1]);
    di.detect = vec![
        detect("KAM", 0x04, 0x30), // 302
        detect("KAM", 0x0d, 0x30),
        detect("KAM", 0x0c, 0x30),
        detect("KAM", 0x04, 0x40), // 303
        detect("KAM", 0x0c, 0x40),
        detect("KAM", 0x04, 0x19), // 402
        detect("KAM", 0x04, 0x34), // 403
        detect("KAM", 0x0a, 0x34),
        detect("KAM", 0x0b, 0x34),
        detect("KAM", 0x0c, 0x34),
        detect("KAM", 0x0d, 0x34),
        detect("KAM", 0x04, 0x1c), // 602
        detect("KAM", 0x04, 0x35), // 603
        detect("KAM", 0x0c, 0x35),
        detect("KAM", 0x04, 0x39), // 803
    ];
    di.setup_fields = Arc::new(setup_fields);
    register_driver(di)
}

fn error_flags_lookup() -> Lookup {
    // Multical 603 technical description 7.7.2, information code types on
    // serial communication.
    Lookup::new(vec![Rule::new(
        "ERROR_FLAGS",
        MapType::BitToString,
        0xffffffff,
        vec![
            Map::set(0x00000001, "VOLTAGE_INTERRUPTED"),
            Map::set(0x00000002, "LOW_BATTERY_LEVEL"),
            Map::set(0x00000004, "SENSOR_ERROR"),
            Map::set(0x00000008, "SENSOR_T1_ABOVE_MEASURING_RANGE"),
            Map::set(0x00000010, "SENSOR_T2_ABOVE_MEASURING_RANGE"),
            Map::set(0x00000020, "SENSOR_T1_BELOW_MEASURING_RANGE"),
            Map::set(0x00000040, "SENSOR_T2_BELOW_MEASURING_RANGE"),
            Map::set(0x00000080, "TEMP_DIFF_WRONG_POLARITY"),
            Map::set(0x00000100, "FLOW_SENSOR_WEAK_OR_AIR"),
            Map::set(0x00000200, "WRONG_FLOW_DIRECTION"),
            Map::set(0x00000800, "FLOW_INCREASED"),
            Map::set(0x00001000, "IN_A1_LEAKAGE_IN_THE_SYSTEM"),
            Map::set(0x00002000, "IN_B1_LEAKAGE_IN_THE_SYSTEM"),
            Map::set(0x00004000, "IN_A1_A2_EXTERNAL_ALARM"),
            Map::set(0x00008000, "IN_B1_B2_EXTERNAL_ALARM"),
            Map::set(0x00010000, "V1_COMMUNICATION_ERROR"),
            Map::set(0x00020000, "V1_WRONG_PULSE_FIGURE"),
            Map::set(0x00040000, "IN_A2_LEAKAGE_IN_THE_SYSTEM"),
            Map::set(0x00080000, "IN_B2_LEAKAGE_IN_THE_SYSTEM"),
            Map::set(0x00100000, "T3_ABOVE_MEASURING_RANGE_OR_SWITCHED_OFF"),
            Map::set(0x00200000, "T3_BELOW_MEASURING_RANGE_OR_SHORT_CIRCUITED"),
            Map::set(0x00400000, "V2_COMMUNICATION_ERROR"),
            Map::set(0x00800000, "V2_WRONG_PULSE_FIGURE"),
            Map::set(0x01000000, "V2_AIR"),
            Map::set(0x02000000, "V2_WRONG_FLOW_DIRECTION"),
            Map::set(0x08000000, "V2_INCREASED_FLOW"),
            Map::set(0x10000000, "V1_V2_BURST_WATER_LOSS"),
            Map::set(0x20000000, "V1_V2_BURST_WATER_PENETRATION"),
            Map::set(0x40000000, "V1_V2_LEAKAGE_WATER_LOSS"),
            Map::set(0x80000000, "V1_V2_LEAKAGE_WATER_PENETRATION"),
        ],
    )])
}

fn setup_fields(m: &mut crate::meters::Meter) {
    add_library_fields(m, "fabrication_no,meter_datetime,on_time_h,on_time_at_error_h");

    // Kamstrup names its sensors t1/t2 rather than flow/return.
    m.add_numeric_field_with_calculator(
        "flow_return_temperature_difference",
        "Difference between forward and return media temperatures.",
        PrintProperties::default(),
        Quantity::Temperature,
        "t1_temperature_c - t2_temperature_c",
    );

    m.add_string_field_with_extractor_and_lookup(
        "status",
        "Status and error flags.",
        PrintProperties::STATUS | PrintProperties::INCLUDE_TPL_STATUS,
        FieldMatcher::build().dif_vif_key("04FF22"),
        error_flags_lookup(),
    );

    m.add_numeric_field_with_extractor(
        "total_energy_consumption",
        "The total energy consumption recorded by this meter.",
        PrintProperties::default(),
        Quantity::Energy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyEnergyVIF),
    );

    m.add_numeric_field_with_extractor(
        "total_volume",
        "The volume of water (3/68/Volume V1).",
        PrintProperties::default(),
        Quantity::Volume,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::Volume),
    );

    m.add_numeric_field_with_extractor(
        "volume_flow",
        "The actual amount of water that pass through this meter (8/74/Flow V1 actual).",
        PrintProperties::default(),
        Quantity::Flow,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::VolumeFlow),
    );

    m.add_numeric_field_with_extractor(
        "power",
        "The current power flowing.",
        PrintProperties::default(),
        Quantity::Power,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyPowerVIF),
    );

    m.add_numeric_field_with_extractor(
        "max_power",
        "The maximum power supplied.",
        PrintProperties::default(),
        Quantity::Power,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Maximum)
            .vif_range(VifRange::AnyPowerVIF),
    );

    m.add_numeric_field_with_extractor(
        "t1_temperature",
        "The forward temperature of the water (6/86/t1 actual 2 decimals).",
        PrintProperties::default(),
        Quantity::Temperature,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::FlowTemperature),
    );

    m.add_numeric_field_with_extractor(
        "t2_temperature",
        "The return temperature of the water (7/87/t2 actual 2 decimals).",
        PrintProperties::default(),
        Quantity::Temperature,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::ReturnTemperature),
    );

    m.add_numeric_field_with_extractor(
        "max_flow",
        "The maximum flow of water that passed through this meter.",
        PrintProperties::default(),
        Quantity::Flow,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Maximum)
            .vif_range(VifRange::VolumeFlow),
    );

    m.add_numeric_field_with_extractor_and_unit(
        "forward_energy",
        "The forward energy of the water (4/97/Energy E8).",
        PrintProperties::default(),
        Quantity::Volume,
        VifScaling::None,
        DifSignedness::Signed,
        FieldMatcher::build().dif_vif_key("04FF07"),
        Unit::M3C,
    );

    m.add_numeric_field_with_extractor_and_unit(
        "return_energy",
        "The return energy of the water (5/110/Energy E9).",
        PrintProperties::default(),
        Quantity::Volume,
        VifScaling::None,
        DifSignedness::Signed,
        FieldMatcher::build().dif_vif_key("04FF08"),
        Unit::M3C,
    );

    m.add_string_field_with_extractor(
        "meter_date",
        "The date and time (10/348/Date and time).",
        PrintProperties::default(),
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::Date),
    );

    m.add_numeric_field_with_extractor(
        "target_energy",
        "The energy consumption recorded by this meter at the set date (11/60/Heat energy E1/026C).",
        PrintProperties::default(),
        Quantity::Energy,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::AnyEnergyVIF)
            .storage(1),
    );

    m.add_numeric_field_with_extractor(
        "target_volume",
        "The amount of water that had passed through this meter at the set date (13/68/Volume V1).",
        PrintProperties::default(),
        Quantity::Volume,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::Volume)
            .storage(1),
    );

    m.add_string_field_with_extractor(
        "target_date",
        "The most recent billing period date and time (14/348/Date and Time logged).",
        PrintProperties::default(),
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::Date)
            .storage(1),
    );

    m.add_numeric_field_with_extractor(
        "operating_time",
        "How long the meter has been collecting data.",
        PrintProperties::default(),
        Quantity::Time,
        VifScaling::Auto,
        DifSignedness::Signed,
        FieldMatcher::build()
            .measurement(MeasurementType::Instantaneous)
            .vif_range(VifRange::OperatingTime)
            .combinable(VifCombinable::Mfct21),
    );
}
