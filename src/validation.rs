//! Reading validation, run before any dimension resolution or write
//!
//! Structural problems (blank names, non-finite numbers) are reported as
//! `InvalidInput` before any range is looked at.

use crate::db::dimensions::{normalize_name, DimensionKind};
use crate::db::observations::ObservationValues;
use crate::error::StorageError;

/// Inclusive bounds for one numeric field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericBounds {
    pub field: &'static str,
    pub min: f64,
    /// `None` when unbounded above
    pub max: Option<f64>,
}

pub const MOISTURE: NumericBounds = NumericBounds { field: "moisture", min: 0.0, max: None };
pub const TEMPERATURE: NumericBounds = NumericBounds { field: "temperature", min: -50.0, max: Some(80.0) };
pub const HUMIDITY: NumericBounds = NumericBounds { field: "humidity", min: 0.0, max: Some(100.0) };

impl NumericBounds {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && self.max.map_or(true, |max| value <= max)
    }

    fn check_finite(&self, value: f64) -> Result<(), StorageError> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(StorageError::InvalidInput(format!("{} must be a finite number, got {}", self.field, value)))
        }
    }

    fn check_range(&self, value: f64) -> Result<(), StorageError> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(StorageError::InvalidRange {
                field: self.field,
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// Validate the three measured quantities
pub fn validate(moisture: f64, temperature: f64, humidity: f64) -> Result<(), StorageError> {
    let fields = [(MOISTURE, moisture), (TEMPERATURE, temperature), (HUMIDITY, humidity)];

    for (bounds, value) in fields {
        bounds.check_finite(value)?;
    }
    for (bounds, value) in fields {
        bounds.check_range(value)?;
    }
    Ok(())
}

/// Validate the measured quantities of a reading
pub fn validate_values(values: &ObservationValues) -> Result<(), StorageError> {
    validate(values.moisture, values.temperature, values.humidity)
}

/// Validate the three dimension names of a reading
pub fn validate_names(crop: &str, soil: &str, stage: &str) -> Result<(), StorageError> {
    normalize_name(DimensionKind::Crop, crop)?;
    normalize_name(DimensionKind::Soil, soil)?;
    normalize_name(DimensionKind::Stage, stage)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_field(err: StorageError) -> (&'static str, f64) {
        match err {
            StorageError::InvalidRange { field, value, .. } => (field, value),
            other => panic!("expected InvalidRange, got {other}"),
        }
    }

    #[test]
    fn test_accepts_bounds_inclusive() {
        validate(0.0, -50.0, 0.0).unwrap();
        validate(1e6, 80.0, 100.0).unwrap();
        validate(12.5, 24.0, 55.0).unwrap();
    }

    #[test]
    fn test_humidity_out_of_range() {
        let err = validate(12.5, 24.0, 150.0).unwrap_err();
        match err {
            StorageError::InvalidRange { field, value, min, max } => {
                assert_eq!(field, "humidity");
                assert_eq!(value, 150.0);
                assert_eq!(min, 0.0);
                assert_eq!(max, Some(100.0));
            }
            other => panic!("expected InvalidRange, got {other}"),
        }
        assert_eq!(range_field(validate(12.5, 24.0, -0.1).unwrap_err()), ("humidity", -0.1));
    }

    #[test]
    fn test_temperature_out_of_range() {
        assert_eq!(range_field(validate(1.0, -50.5, 50.0).unwrap_err()), ("temperature", -50.5));
        assert_eq!(range_field(validate(1.0, 80.1, 50.0).unwrap_err()), ("temperature", 80.1));
    }

    #[test]
    fn test_negative_moisture() {
        assert_eq!(range_field(validate(-0.01, 20.0, 50.0).unwrap_err()), ("moisture", -0.01));
    }

    #[test]
    fn test_non_finite_is_structural() {
        // NaN humidity is reported even though moisture is also out of range
        let err = validate(-5.0, 20.0, f64::NAN).unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));

        let err = validate(1.0, f64::INFINITY, 50.0).unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
    }

    #[test]
    fn test_blank_names() {
        validate_names("Maize", "Loam", "Seedling").unwrap();
        let err = validate_names("Maize", " ", "Seedling").unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(msg) if msg.contains("soil")));
    }
}
