//! Quantities and display units for extracted meter values.
//!
//! Every numeric value decoded from a telegram is normalized to the
//! canonical unit of its quantity (kWh, m³, m³/h, ...) by the VIF scaling
//! and can then be converted to the display unit a driver declares.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Energy,
    Power,
    Volume,
    Flow,
    Mass,
    MassFlow,
    Temperature,
    Pressure,
    Time,
    PointInTime,
    Text,
    Counter,
    Hca,
    Voltage,
    Amperage,
    RelativeHumidity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Kwh,
    Mwh,
    Gj,
    Mj,
    Kw,
    W,
    M3,
    L,
    M3h,
    Lh,
    Kg,
    T,
    KgH,
    C,
    K,
    Bar,
    Hpa,
    Second,
    Minute,
    Hour,
    Day,
    DateLT,
    DateTimeLT,
    Txt,
    Counter,
    Hca,
    Volt,
    Ampere,
    Rh,
    Unknown,
}

impl Unit {
    pub fn quantity(&self) -> Quantity {
        match self {
            Unit::Kwh | Unit::Mwh => Quantity::Energy,
            Unit::Gj | Unit::Mj => Quantity::Energy,
            Unit::Kw | Unit::W => Quantity::Power,
            Unit::M3 | Unit::L => Quantity::Volume,
            Unit::M3h | Unit::Lh => Quantity::Flow,
            Unit::Kg | Unit::T => Quantity::Mass,
            Unit::KgH => Quantity::MassFlow,
            Unit::C | Unit::K => Quantity::Temperature,
            Unit::Bar | Unit::Hpa => Quantity::Pressure,
            Unit::Second | Unit::Minute | Unit::Hour | Unit::Day => Quantity::Time,
            Unit::DateLT | Unit::DateTimeLT => Quantity::PointInTime,
            Unit::Txt => Quantity::Text,
            Unit::Counter => Quantity::Counter,
            Unit::Hca => Quantity::Hca,
            Unit::Volt => Quantity::Voltage,
            Unit::Ampere => Quantity::Amperage,
            Unit::Rh => Quantity::RelativeHumidity,
            Unit::Unknown => Quantity::Counter,
        }
    }

    /* Lowercase suffix used in field names like total_m3, flow_temperature_c. */
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::Kwh => "kwh",
            Unit::Mwh => "mwh",
            Unit::Gj => "gj",
            Unit::Mj => "mj",
            Unit::Kw => "kw",
            Unit::W => "w",
            Unit::M3 => "m3",
            Unit::L => "l",
            Unit::M3h => "m3h",
            Unit::Lh => "lh",
            Unit::Kg => "kg",
            Unit::T => "t",
            Unit::KgH => "kgh",
            Unit::C => "c",
            Unit::K => "k",
            Unit::Bar => "bar",
            Unit::Hpa => "hpa",
            Unit::Second => "s",
            Unit::Minute => "min",
            Unit::Hour => "h",
            Unit::Day => "d",
            Unit::DateLT => "date",
            Unit::DateTimeLT => "datetime",
            Unit::Txt => "txt",
            Unit::Counter => "counter",
            Unit::Hca => "hca",
            Unit::Volt => "v",
            Unit::Ampere => "a",
            Unit::Rh => "rh",
            Unit::Unknown => "unknown",
        }
    }

    /* Factor from this unit into the canonical unit of its quantity. */
    fn si_factor(&self) -> f64 {
        match self {
            Unit::Kwh => 1.0,
            Unit::Mwh => 1000.0,
            Unit::Gj => 1000.0,
            Unit::Mj => 1.0,
            Unit::Kw => 1.0,
            Unit::W => 0.001,
            Unit::M3 => 1.0,
            Unit::L => 0.001,
            Unit::M3h => 1.0,
            Unit::Lh => 0.001,
            Unit::Kg => 1.0,
            Unit::T => 1000.0,
            Unit::KgH => 1.0,
            Unit::Bar => 1.0,
            Unit::Hpa => 0.001,
            Unit::Second => 1.0 / 3600.0,
            Unit::Minute => 1.0 / 60.0,
            Unit::Hour => 1.0,
            Unit::Day => 24.0,
            _ => 1.0,
        }
    }
}

/* Convert between two units of the same quantity. Mismatched quantities
   leave the value untouched, the record extraction already warned. */
pub fn convert(value: f64, from: Unit, to: Unit) -> f64 {
    if from == to {
        return value;
    }
    if from.quantity() != to.quantity() {
        return value;
    }
    if from.quantity() == Quantity::Temperature {
        /* Affine, not a pure factor. Canonical is celsius. */
        let celsius = match from {
            Unit::K => value - 273.15,
            _ => value,
        };
        return match to {
            Unit::K => celsius + 273.15,
            _ => celsius,
        };
    }
    value * from.si_factor() / to.si_factor()
}

#[cfg(test)]
mod units_tests {
    use super::*;

    #[test]
    fn pure_power_of_ten_conversions_are_exact() {
        assert_eq!(convert(1.234, Unit::M3, Unit::L), 1234.0);
        assert_eq!(convert(1234.0, Unit::L, Unit::M3), 1.234);
        assert_eq!(convert(1.0, Unit::Mwh, Unit::Kwh), 1000.0);
        assert_eq!(convert(500.0, Unit::W, Unit::Kw), 0.5);
    }

    #[test]
    fn temperature_is_affine() {
        assert_eq!(convert(0.0, Unit::C, Unit::K), 273.15);
        assert!((convert(293.15, Unit::K, Unit::C) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn time_conversions() {
        assert_eq!(convert(2.0, Unit::Hour, Unit::Minute), 120.0);
        assert_eq!(convert(1.0, Unit::Day, Unit::Hour), 24.0);
    }
}
