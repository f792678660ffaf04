use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatType {
    Core,
    Bgc,
    Deep,
}

impl FloatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FloatType::Core => "core",
            FloatType::Bgc => "BGC",
            FloatType::Deep => "deep",
        }
    }
}

/// One depth level of a profile. Values are post-fill-erasure: a fill-valued
/// scalar is `None`, never zero and never the sentinel.
#[derive(Debug, Clone, Default)]
pub struct MeasurementRecord {
    pub level_index: i32,
    pub pressure: Option<f64>,
    pub temperature: Option<f64>,
    pub salinity: Option<f64>,
    pub dissolved_oxygen: Option<f64>,
    pub chlorophyll: Option<f64>,
    pub nitrate: Option<f64>,
    pub ph_in_situ: Option<f64>,
    pub backscatter: Option<f64>,
    pub irradiance: Option<f64>,
    pub pressure_qc: Option<i16>,
    pub temperature_qc: Option<i16>,
    pub salinity_qc: Option<i16>,
    pub is_outlier: bool,
}

impl MeasurementRecord {
    pub fn is_empty(&self) -> bool {
        self.pressure.is_none()
            && self.temperature.is_none()
            && self.salinity.is_none()
            && self.dissolved_oxygen.is_none()
            && self.chlorophyll.is_none()
            && self.nitrate.is_none()
            && self.ph_in_situ.is_none()
            && self.backscatter.is_none()
            && self.irradiance.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub cycle_number: i32,
    pub juld_raw: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub timestamp_missing: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub position_invalid: bool,
    pub data_mode: char,
    pub levels: Vec<MeasurementRecord>,
}

#[derive(Debug, Clone)]
pub struct FloatHeader {
    pub platform_number: String,
    pub float_type: FloatType,
}

/// Structured output of parsing one profile file: one float header plus its
/// profile records in file order.
#[derive(Debug)]
pub struct ParseResult {
    pub header: FloatHeader,
    pub variables: Vec<String>,
    pub profiles: Vec<ProfileRecord>,
}

impl ParseResult {
    pub fn measurement_count(&self) -> usize {
        self.profiles.iter().map(|p| p.levels.len()).sum()
    }
}
