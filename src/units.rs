//! # Units and Quantities
//!
//! A closed enumeration of the units meters report in, grouped by physical
//! quantity. Every unit carries an SI dimension vector plus a scale (and
//! for temperature an offset) against the SI base, which drives both
//! `convert()` and the dimensional checks in the formula engine.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnitsError {
    #[error("Cannot convert from {0:?} to {1:?}")]
    IncompatibleUnits(Unit, Unit),

    #[error("Unknown unit \"{0}\"")]
    UnknownUnit(String),
}

/// Physical quantity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Quantity {
    Energy,
    ReactiveEnergy,
    ApparentEnergy,
    Power,
    Volume,
    Flow,
    Mass,
    MassFlow,
    Temperature,
    Pressure,
    Frequency,
    Time,
    PointInTime,
    Voltage,
    Amperage,
    Angle,
    Speed,
    RelativeHumidity,
    Hca,
    Dimensionless,
    Text,
}

/// SI dimension vector: exponents for (s, m, kg, A, K).
///
/// Mole and candela never occur on a meter bus and are left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim(pub [i8; 5]);

impl Dim {
    pub const NONE: Dim = Dim([0, 0, 0, 0, 0]);
    pub const TIME: Dim = Dim([1, 0, 0, 0, 0]);
    pub const ENERGY: Dim = Dim([-2, 2, 1, 0, 0]);
    pub const POWER: Dim = Dim([-3, 2, 1, 0, 0]);
    pub const VOLUME: Dim = Dim([0, 3, 0, 0, 0]);
    pub const FLOW: Dim = Dim([-1, 3, 0, 0, 0]);
    pub const MASS: Dim = Dim([0, 0, 1, 0, 0]);
    pub const MASS_FLOW: Dim = Dim([-1, 0, 1, 0, 0]);
    pub const TEMPERATURE: Dim = Dim([0, 0, 0, 0, 1]);
    pub const PRESSURE: Dim = Dim([-2, -1, 1, 0, 0]);
    pub const FREQUENCY: Dim = Dim([-1, 0, 0, 0, 0]);
    pub const VOLTAGE: Dim = Dim([-3, 2, 1, -1, 0]);
    pub const AMPERAGE: Dim = Dim([0, 0, 0, 1, 0]);
    pub const SPEED: Dim = Dim([-1, 1, 0, 0, 0]);
    pub const VOLUME_TEMP: Dim = Dim([0, 3, 0, 0, 1]);

    pub fn mul(self, other: Dim) -> Dim {
        let mut out = [0i8; 5];
        for i in 0..5 {
            out[i] = self.0[i] + other.0[i];
        }
        Dim(out)
    }

    pub fn div(self, other: Dim) -> Dim {
        let mut out = [0i8; 5];
        for i in 0..5 {
            out[i] = self.0[i] - other.0[i];
        }
        Dim(out)
    }

    /// Halve all exponents. Fails when any exponent is odd.
    pub fn sqrt(self) -> Option<Dim> {
        let mut out = [0i8; 5];
        for i in 0..5 {
            if self.0[i] % 2 != 0 {
                return None;
            }
            out[i] = self.0[i] / 2;
        }
        Some(Dim(out))
    }
}

/// The closed set of units the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Unit {
    KWH,
    MJ,
    GJ,
    KVARH,
    KVAH,
    M3,
    L,
    KG,
    KGH,
    W,
    KW,
    C,
    K,
    M3H,
    LH,
    BAR,
    PA,
    HZ,
    Second,
    Minute,
    Hour,
    Day,
    Volt,
    Ampere,
    Degree,
    MS,
    M3C,
    RH,
    HCA,
    Factor,
    Number,
    Percent,
    Counter,
    /// Date in local time, type G.
    DateLT,
    /// Date and time in local time, type F.
    DateTimeLT,
    DateTimeUT,
    DateTimeUTC,
    UnixTimestamp,
    Text,
}

impl Unit {
    pub fn quantity(self) -> Quantity {
        use Unit::*;
        match self {
            KWH | MJ | GJ => Quantity::Energy,
            KVARH => Quantity::ReactiveEnergy,
            KVAH => Quantity::ApparentEnergy,
            M3 | L | M3C => Quantity::Volume,
            KG => Quantity::Mass,
            KGH => Quantity::MassFlow,
            W | KW => Quantity::Power,
            C | K => Quantity::Temperature,
            M3H | LH => Quantity::Flow,
            BAR | PA => Quantity::Pressure,
            HZ => Quantity::Frequency,
            Second | Minute | Hour | Day => Quantity::Time,
            Volt => Quantity::Voltage,
            Ampere => Quantity::Amperage,
            Degree => Quantity::Angle,
            MS => Quantity::Speed,
            RH => Quantity::RelativeHumidity,
            HCA => Quantity::Hca,
            Factor | Number | Percent | Counter => Quantity::Dimensionless,
            DateLT | DateTimeLT | DateTimeUT | DateTimeUTC | UnixTimestamp => Quantity::PointInTime,
            Text => Quantity::Text,
        }
    }

    /// SI dimension, scale and offset. `value_in_si = value * scale + offset`.
    pub fn si(self) -> (Dim, f64, f64) {
        use Unit::*;
        match self {
            KWH => (Dim::ENERGY, 3.6e6, 0.0),
            MJ => (Dim::ENERGY, 1.0e6, 0.0),
            GJ => (Dim::ENERGY, 1.0e9, 0.0),
            KVARH => (Dim::ENERGY, 3.6e6, 0.0),
            KVAH => (Dim::ENERGY, 3.6e6, 0.0),
            M3 => (Dim::VOLUME, 1.0, 0.0),
            L => (Dim::VOLUME, 1.0e-3, 0.0),
            KG => (Dim::MASS, 1.0, 0.0),
            KGH => (Dim::MASS_FLOW, 1.0 / 3600.0, 0.0),
            W => (Dim::POWER, 1.0, 0.0),
            KW => (Dim::POWER, 1000.0, 0.0),
            C => (Dim::TEMPERATURE, 1.0, 273.15),
            K => (Dim::TEMPERATURE, 1.0, 0.0),
            M3H => (Dim::FLOW, 1.0 / 3600.0, 0.0),
            LH => (Dim::FLOW, 1.0e-3 / 3600.0, 0.0),
            BAR => (Dim::PRESSURE, 1.0e5, 0.0),
            PA => (Dim::PRESSURE, 1.0, 0.0),
            HZ => (Dim::FREQUENCY, 1.0, 0.0),
            Second => (Dim::TIME, 1.0, 0.0),
            Minute => (Dim::TIME, 60.0, 0.0),
            Hour => (Dim::TIME, 3600.0, 0.0),
            Day => (Dim::TIME, 86400.0, 0.0),
            Volt => (Dim::VOLTAGE, 1.0, 0.0),
            Ampere => (Dim::AMPERAGE, 1.0, 0.0),
            Degree => (Dim::NONE, 1.0, 0.0),
            MS => (Dim::SPEED, 1.0, 0.0),
            M3C => (Dim::VOLUME_TEMP, 1.0, 0.0),
            RH | HCA | Factor | Number | Percent | Counter => (Dim::NONE, 1.0, 0.0),
            DateLT | DateTimeLT | DateTimeUT | DateTimeUTC | UnixTimestamp => {
                (Dim::TIME, 1.0, 0.0)
            }
            Text => (Dim::NONE, 1.0, 0.0),
        }
    }

    /// Lower-case suffix appended to numeric field names, eg
    /// `total_volume_m3`.
    pub fn suffix(self) -> &'static str {
        use Unit::*;
        match self {
            KWH => "kwh",
            MJ => "mj",
            GJ => "gj",
            KVARH => "kvarh",
            KVAH => "kvah",
            M3 => "m3",
            L => "l",
            KG => "kg",
            KGH => "kgh",
            W => "w",
            KW => "kw",
            C => "c",
            K => "k",
            M3H => "m3h",
            LH => "lh",
            BAR => "bar",
            PA => "pa",
            HZ => "hz",
            Second => "s",
            Minute => "min",
            Hour => "h",
            Day => "d",
            Volt => "v",
            Ampere => "a",
            Degree => "deg",
            MS => "ms",
            M3C => "m3c",
            RH => "rh",
            HCA => "hca",
            Factor => "factor",
            Number => "number",
            Percent => "pct",
            Counter => "counter",
            DateLT => "date",
            DateTimeLT | DateTimeUT | DateTimeUTC => "datetime",
            UnixTimestamp => "ut",
            Text => "txt",
        }
    }

    /// Parse a unit suffix as written in formulas and field names.
    pub fn from_suffix(s: &str) -> Option<Unit> {
        use Unit::*;
        for u in ALL_UNITS {
            if u.suffix() == s {
                return Some(*u);
            }
        }
        // A few spellings accepted for convenience.
        match s {
            "kWh" | "KWH" => Some(KWH),
            "seconds" => Some(Second),
            "hours" => Some(Hour),
            _ => None,
        }
    }
}

pub const ALL_UNITS: &[Unit] = &[
    Unit::KWH,
    Unit::MJ,
    Unit::GJ,
    Unit::KVARH,
    Unit::KVAH,
    Unit::M3,
    Unit::L,
    Unit::KG,
    Unit::KGH,
    Unit::W,
    Unit::KW,
    Unit::C,
    Unit::K,
    Unit::M3H,
    Unit::LH,
    Unit::BAR,
    Unit::PA,
    Unit::HZ,
    Unit::Second,
    Unit::Minute,
    Unit::Hour,
    Unit::Day,
    Unit::Volt,
    Unit::Ampere,
    Unit::Degree,
    Unit::MS,
    Unit::M3C,
    Unit::RH,
    Unit::HCA,
    Unit::Factor,
    Unit::Number,
    Unit::Percent,
    Unit::Counter,
    Unit::DateLT,
    Unit::DateTimeLT,
    Unit::DateTimeUT,
    Unit::DateTimeUTC,
    Unit::UnixTimestamp,
    Unit::Text,
];

/// The canonical display unit for a quantity.
pub fn default_unit_for_quantity(q: Quantity) -> Unit {
    use Quantity::*;
    match q {
        Energy => Unit::KWH,
        ReactiveEnergy => Unit::KVARH,
        ApparentEnergy => Unit::KVAH,
        Power => Unit::KW,
        Volume => Unit::M3,
        Flow => Unit::M3H,
        Mass => Unit::KG,
        MassFlow => Unit::KGH,
        Temperature => Unit::C,
        Pressure => Unit::BAR,
        Frequency => Unit::HZ,
        Time => Unit::Hour,
        PointInTime => Unit::DateTimeLT,
        Voltage => Unit::Volt,
        Amperage => Unit::Ampere,
        Angle => Unit::Degree,
        Speed => Unit::MS,
        RelativeHumidity => Unit::RH,
        Hca => Unit::HCA,
        Dimensionless => Unit::Number,
        Text => Unit::Text,
    }
}

/// Convert a value between two units of the same dimension.
///
/// Temperature is the only affine unit; everything else is a pure scale.
pub fn convert(value: f64, from: Unit, to: Unit) -> Result<f64, UnitsError> {
    if from == to {
        return Ok(value);
    }
    let (fd, fs, fo) = from.si();
    let (td, ts, to_off) = to.si();
    if fd != td {
        return Err(UnitsError::IncompatibleUnits(from, to));
    }
    Ok((value * fs + fo - to_off) / ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_conversions() {
        assert_eq!(convert(1.0, Unit::KWH, Unit::MJ).unwrap(), 3.6);
        assert!((convert(3600.0, Unit::MJ, Unit::KWH).unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_temperature_is_affine() {
        assert!((convert(0.0, Unit::C, Unit::K).unwrap() - 273.15).abs() < 1e-9);
        assert!((convert(300.0, Unit::K, Unit::C).unwrap() - 26.85).abs() < 1e-9);
    }

    #[test]
    fn test_incompatible_units() {
        assert!(matches!(
            convert(1.0, Unit::KWH, Unit::M3),
            Err(UnitsError::IncompatibleUnits(Unit::KWH, Unit::M3))
        ));
    }

    #[test]
    fn test_volume_and_flow() {
        assert_eq!(convert(1500.0, Unit::L, Unit::M3).unwrap(), 1.5);
        assert!((convert(1.0, Unit::M3H, Unit::LH).unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_dim_arithmetic() {
        assert_eq!(Dim::VOLUME.div(Dim::TIME), Dim::FLOW);
        assert_eq!(Dim::POWER.mul(Dim::TIME), Dim::ENERGY);
        assert_eq!(Dim::VOLUME.mul(Dim::TEMPERATURE), Dim::VOLUME_TEMP);
        assert!(Dim([1, 0, 0, 0, 0]).sqrt().is_none());
        assert_eq!(Dim([2, 0, 0, 0, 0]).sqrt(), Some(Dim::TIME));
    }

    #[test]
    fn test_default_units() {
        assert_eq!(default_unit_for_quantity(Quantity::Energy), Unit::KWH);
        assert_eq!(default_unit_for_quantity(Quantity::Flow), Unit::M3H);
    }
}
