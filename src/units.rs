//! Temperature unit handling.
//!
//! Temperatures are charted in both Fahrenheit and Celsius, so they are first filtered with a
//! range wide enough to hold either (`(10, 130)`), then converted to Celsius, then filtered again
//! with a Celsius-only range (`(20, 50)`) to catch readings with the wrong unit.
use crate::{extract::FirstReadings, ArcStr, ValidRange};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Accepts the spellings seen in `valueuom`: `?F`, `°F`, `F`, `Deg. F`, `deg F`, `Fahrenheit`...
static FAHRENHEIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(\?|°|º|deg\.?|degrees?)?\s*f(ahrenheit)?\s*$").unwrap()
});

pub const CELSIUS: &str = "°C";

/// Range for temperatures in either unit, before conversion.
pub const RAW_TEMPERATURE_RANGE: ValidRange = ValidRange::new(10., 130.);

/// Range for temperatures after conversion to Celsius.
pub const CELSIUS_TEMPERATURE_RANGE: ValidRange = ValidRange::new(20., 50.);

/// A unit conversion applied to a variable after its first readings are chosen.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    /// Convert Fahrenheit readings to Celsius, then drop readings outside `valid_range`.
    FahrenheitToCelsius { valid_range: ValidRange },
}

impl Normalization {
    pub fn apply(&self, readings: FirstReadings) -> FirstReadings {
        match self {
            Normalization::FahrenheitToCelsius { valid_range } => {
                normalize_temperature(readings, *valid_range)
            }
        }
    }
}

pub fn is_fahrenheit(unit: &str) -> bool {
    FAHRENHEIT.is_match(unit)
}

pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.) * 5. / 9.
}

/// Convert readings tagged as Fahrenheit to Celsius. Other readings are left as they are.
pub fn convert_to_celsius(readings: FirstReadings) -> FirstReadings {
    readings.map(|mut obs| {
        if matches!(obs.unit.as_deref(), Some(unit) if is_fahrenheit(unit)) {
            obs.value = obs.value.map(fahrenheit_to_celsius);
            obs.unit = Some(ArcStr::from(CELSIUS));
        }
        obs
    })
}

/// Drop readings outside `range` (exclusive), and readings without a value.
pub fn post_conversion_plausibility_filter(
    readings: FirstReadings,
    range: ValidRange,
) -> FirstReadings {
    readings.filter(|obs| matches!(obs.value, Some(v) if range.contains(v)))
}

pub fn normalize_temperature(readings: FirstReadings, celsius_range: ValidRange) -> FirstReadings {
    post_conversion_plausibility_filter(convert_to_celsius(readings), celsius_range)
}
