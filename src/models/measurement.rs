use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

fn decimal_op(a: f64, b: f64, op: fn(Decimal, Decimal) -> Option<Decimal>) -> Option<f64> {
    op(Decimal::from_f64(a)?, Decimal::from_f64(b)?)?.to_f64()
}

/// `a + b` computed in decimal, so adding and then removing an amount gives
/// back the starting value.
pub fn add_amounts(a: f64, b: f64) -> f64 {
    decimal_op(a, b, Decimal::checked_add).unwrap_or(a + b)
}

/// `a - b` computed in decimal.
pub fn subtract_amounts(a: f64, b: f64) -> f64 {
    decimal_op(a, b, Decimal::checked_sub).unwrap_or(a - b)
}

/// Converts a measurement to money arithmetic, treating non-finite values as zero.
pub fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

/// A measurement dimension. An item is tracked on exactly one axis at a time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Axis {
    #[default]
    Quantity,
    Weight,
    Length,
    Area,
    Volume,
}

impl Axis {
    /// Name of the measurement field carrying this axis on items and lines.
    pub fn field(&self) -> &'static str {
        match self {
            Axis::Quantity => "quantity",
            Axis::Weight => "weight",
            Axis::Length => "length",
            Axis::Area => "area",
            Axis::Volume => "volume",
        }
    }

    /// Name of the unit field paired with this axis, if it has one.
    pub fn unit_field(&self) -> Option<&'static str> {
        match self {
            Axis::Quantity => None,
            Axis::Weight => Some("weightUnit"),
            Axis::Length => Some("lengthUnit"),
            Axis::Area => Some("areaUnit"),
            Axis::Volume => Some("volumeUnit"),
        }
    }
}

/// Five-axis measurement bundle with units, shared by items, lines and relationships.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Measurements {
    pub quantity: f64,
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_unit: Option<String>,
    pub length: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_unit: Option<String>,
    pub area: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_unit: Option<String>,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_unit: Option<String>,
}

impl Measurements {
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::Quantity => self.quantity,
            Axis::Weight => self.weight,
            Axis::Length => self.length,
            Axis::Area => self.area,
            Axis::Volume => self.volume,
        }
    }

    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::Quantity => self.quantity = value,
            Axis::Weight => self.weight = value,
            Axis::Length => self.length = value,
            Axis::Area => self.area = value,
            Axis::Volume => self.volume = value,
        }
    }

    pub fn unit(&self, axis: Axis) -> Option<&str> {
        match axis {
            Axis::Quantity => None,
            Axis::Weight => self.weight_unit.as_deref(),
            Axis::Length => self.length_unit.as_deref(),
            Axis::Area => self.area_unit.as_deref(),
            Axis::Volume => self.volume_unit.as_deref(),
        }
    }

    /// A bundle carrying a single axis value and the unit it was measured in.
    pub fn single(axis: Axis, value: f64, unit: Option<String>) -> Self {
        let mut measurements = Self::default();
        measurements.set(axis, value);
        match axis {
            Axis::Quantity => {}
            Axis::Weight => measurements.weight_unit = unit,
            Axis::Length => measurements.length_unit = unit,
            Axis::Area => measurements.area_unit = unit,
            Axis::Volume => measurements.volume_unit = unit,
        }
        measurements
    }

    /// Copies the unit labels (not the values) from another bundle.
    pub fn with_units_of(mut self, other: &Measurements) -> Self {
        self.weight_unit = other.weight_unit.clone();
        self.length_unit = other.length_unit.clone();
        self.area_unit = other.area_unit.clone();
        self.volume_unit = other.volume_unit.clone();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn axis_round_trips_through_its_name() {
        for axis in [Axis::Quantity, Axis::Weight, Axis::Length, Axis::Area, Axis::Volume] {
            assert_eq!(Axis::from_str(axis.field()).unwrap(), axis);
            assert_eq!(axis.to_string(), axis.field());
        }
    }

    #[test]
    fn single_sets_only_the_requested_axis() {
        let m = Measurements::single(Axis::Weight, 4.0, Some("lb".into()));
        assert_eq!(m.weight, 4.0);
        assert_eq!(m.quantity, 0.0);
        assert_eq!(m.unit(Axis::Weight), Some("lb"));
        assert_eq!(m.unit(Axis::Quantity), None);
    }

    #[test]
    fn decimal_arithmetic_undoes_exactly() {
        let start = 0.1;
        let raised = add_amounts(start, 0.2);
        assert_eq!(raised, 0.3);
        assert_eq!(subtract_amounts(raised, 0.2), start);
        assert_eq!(to_decimal(f64::NAN), Decimal::ZERO);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let m: Measurements = serde_json::from_value(serde_json::json!({"quantity": 3})).unwrap();
        assert_eq!(m.quantity, 3.0);
        assert_eq!(m.volume, 0.0);
        assert!(m.weight_unit.is_none());
    }
}
