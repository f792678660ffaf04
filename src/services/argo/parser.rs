//! ARGO profile-file semantics on top of the classic NetCDF reader.
//!
//! Reads every variable without scaling, erases declared fill values to
//! `None`, decodes QC bytes as ASCII digits, and resolves JULD against the
//! 1950-01-01 epoch.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::Path;

use super::netcdf::{NetcdfError, NetcdfFile};
use super::types::{FloatHeader, FloatType, MeasurementRecord, ParseResult, ProfileRecord};

pub const MANDATORY_VARIABLES: &[&str] = &[
    "PRES",
    "TEMP",
    "PSAL",
    "CYCLE_NUMBER",
    "JULD",
    "LATITUDE",
    "LONGITUDE",
    "PLATFORM_NUMBER",
    "DATA_MODE",
];

/// Optional biogeochemical variables, paired with the measurement field they
/// populate.
const BGC_VARIABLES: &[&str] = &[
    "DOXY",
    "CHLA",
    "NITRATE",
    "PH_IN_SITU_TOTAL",
    "BBP700",
    "DOWNWELLING_PAR",
];

/// JULD fill used when the file does not declare one.
const DEFAULT_JULD_FILL: f64 = 999_999.0;

/// Pressure beyond which a non-BGC float is classified as a deep float.
const DEEP_PRESSURE_DBAR: f64 = 2_500.0;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Missing required variable: {0}")]
    MissingVariable(&'static str),
    #[error("trajectory files are not supported; upload a profile file")]
    TrajectoryFile,
    #[error("malformed profile file: {0}")]
    Malformed(String),
    #[error(transparent)]
    Netcdf(#[from] NetcdfError),
}

pub fn parse_file(path: &Path) -> Result<ParseResult, ParseError> {
    let file = NetcdfFile::open(path)?;
    parse_netcdf(&file)
}

pub fn parse_bytes(bytes: Vec<u8>) -> Result<ParseResult, ParseError> {
    let file = NetcdfFile::from_bytes(bytes)?;
    parse_netcdf(&file)
}

fn parse_netcdf(file: &NetcdfFile) -> Result<ParseResult, ParseError> {
    if file.has_dimension("N_MEASUREMENT") && !file.has_dimension("N_PROF") {
        return Err(ParseError::TrajectoryFile);
    }
    let n_prof = file
        .dimension_len("N_PROF")
        .ok_or_else(|| ParseError::Malformed("missing N_PROF dimension".to_string()))?;
    let n_levels = file
        .dimension_len("N_LEVELS")
        .ok_or_else(|| ParseError::Malformed("missing N_LEVELS dimension".to_string()))?;

    for name in MANDATORY_VARIABLES {
        if file.variable(name).is_none() {
            return Err(ParseError::MissingVariable(name));
        }
    }

    let platform_number = read_first_string(file, "PLATFORM_NUMBER", n_prof)?;
    if platform_number.is_empty() {
        return Err(ParseError::Malformed("blank PLATFORM_NUMBER".to_string()));
    }

    let cycles = read_int_series(file, "CYCLE_NUMBER", n_prof)?;
    let juld_var = file
        .variable("JULD")
        .ok_or(ParseError::MissingVariable("JULD"))?;
    let juld_fill = juld_var.fill_value().unwrap_or(DEFAULT_JULD_FILL);
    let julds = file.read_doubles(juld_var)?;
    let latitudes = read_filled_series(file, "LATITUDE", n_prof)?;
    let longitudes = read_filled_series(file, "LONGITUDE", n_prof)?;
    let data_modes = read_char_series(file, "DATA_MODE", n_prof)?;

    let pres = LevelSeries::load(file, "PRES", n_prof, n_levels)?;
    let temp = LevelSeries::load(file, "TEMP", n_prof, n_levels)?;
    let psal = LevelSeries::load(file, "PSAL", n_prof, n_levels)?;
    let pres_qc = QcSeries::load(file, "PRES_QC", n_prof, n_levels);
    let temp_qc = QcSeries::load(file, "TEMP_QC", n_prof, n_levels);
    let psal_qc = QcSeries::load(file, "PSAL_QC", n_prof, n_levels);

    let mut bgc: Vec<(&'static str, LevelSeries)> = Vec::new();
    for name in BGC_VARIABLES {
        if file.variable(name).is_some() {
            bgc.push((name, LevelSeries::load(file, name, n_prof, n_levels)?));
        }
    }

    let mut variables: Vec<String> = vec![
        "PRES".to_string(),
        "TEMP".to_string(),
        "PSAL".to_string(),
    ];
    variables.extend(bgc.iter().map(|(name, _)| name.to_string()));

    let mut max_pressure = f64::MIN;
    let mut profiles = Vec::with_capacity(n_prof);
    for p in 0..n_prof {
        let juld_raw = julds.get(p).copied();
        let timestamp_missing = match juld_raw {
            Some(raw) => raw == juld_fill || !raw.is_finite(),
            None => true,
        };
        let timestamp = if timestamp_missing {
            None
        } else {
            juld_raw.and_then(juld_to_utc)
        };

        let latitude = latitudes.get(p).copied().flatten();
        let longitude = longitudes.get(p).copied().flatten();
        let position_invalid = !matches!(
            (latitude, longitude),
            (Some(lat), Some(lon)) if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
        );

        let mut levels = Vec::with_capacity(n_levels);
        for l in 0..n_levels {
            let mut record = MeasurementRecord {
                level_index: l as i32,
                pressure: pres.get(p, l),
                temperature: temp.get(p, l),
                salinity: psal.get(p, l),
                pressure_qc: pres_qc.get(p, l),
                temperature_qc: temp_qc.get(p, l),
                salinity_qc: psal_qc.get(p, l),
                ..Default::default()
            };
            for (name, series) in &bgc {
                let value = series.get(p, l);
                match *name {
                    "DOXY" => record.dissolved_oxygen = value,
                    "CHLA" => record.chlorophyll = value,
                    "NITRATE" => record.nitrate = value,
                    "PH_IN_SITU_TOTAL" => record.ph_in_situ = value,
                    "BBP700" => record.backscatter = value,
                    "DOWNWELLING_PAR" => record.irradiance = value,
                    _ => {}
                }
            }
            if let Some(pressure) = record.pressure {
                max_pressure = max_pressure.max(pressure);
            }
            // Padded tail levels carry fill in every variable; drop them.
            if !record.is_empty() {
                levels.push(record);
            }
        }

        profiles.push(ProfileRecord {
            cycle_number: cycles.get(p).copied().unwrap_or(0) as i32,
            juld_raw,
            timestamp,
            timestamp_missing,
            latitude,
            longitude,
            position_invalid,
            data_mode: data_modes.get(p).copied().unwrap_or('R'),
            levels,
        });
    }

    let float_type = if !bgc.is_empty() {
        FloatType::Bgc
    } else if max_pressure > DEEP_PRESSURE_DBAR {
        FloatType::Deep
    } else {
        FloatType::Core
    };

    Ok(ParseResult {
        header: FloatHeader {
            platform_number,
            float_type,
        },
        variables,
        profiles,
    })
}

/// Days since 1950-01-01T00:00:00Z, carried to millisecond precision.
fn juld_to_utc(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let epoch = Utc.with_ymd_and_hms(1950, 1, 1, 0, 0, 0).single()?;
    let millis = (raw * 86_400_000.0).round();
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    epoch.checked_add_signed(Duration::milliseconds(millis as i64))
}

/// A (N_PROF, N_LEVELS) numeric variable with its declared fill erased.
struct LevelSeries {
    values: Vec<Option<f64>>,
    n_levels: usize,
}

impl LevelSeries {
    fn load(
        file: &NetcdfFile,
        name: &'static str,
        n_prof: usize,
        n_levels: usize,
    ) -> Result<Self, ParseError> {
        let var = file
            .variable(name)
            .ok_or(ParseError::MissingVariable(name))?;
        let fill = var.fill_value();
        let raw = file.read_doubles(var)?;
        if raw.len() < n_prof * n_levels {
            return Err(ParseError::Malformed(format!(
                "variable {name} holds {} values, expected {}",
                raw.len(),
                n_prof * n_levels
            )));
        }
        let values = raw.into_iter().map(|v| erase_fill(v, fill)).collect();
        Ok(Self { values, n_levels })
    }

    fn get(&self, prof: usize, level: usize) -> Option<f64> {
        self.values
            .get(prof * self.n_levels + level)
            .copied()
            .flatten()
    }
}

/// QC characters for a (N_PROF, N_LEVELS) variable. Absent variables yield
/// all-None; QC bytes are decoded as digit characters, never cast directly.
struct QcSeries {
    values: Option<Vec<u8>>,
    n_levels: usize,
}

impl QcSeries {
    fn load(file: &NetcdfFile, name: &str, _n_prof: usize, n_levels: usize) -> Self {
        let values = file
            .variable(name)
            .and_then(|var| file.read_chars(var).ok());
        Self { values, n_levels }
    }

    fn get(&self, prof: usize, level: usize) -> Option<i16> {
        let byte = *self
            .values
            .as_ref()?
            .get(prof * self.n_levels + level)?;
        decode_qc_byte(byte)
    }
}

/// `b'4'` means QC code 4; the raw byte value is never used as the code.
fn decode_qc_byte(byte: u8) -> Option<i16> {
    (byte as char).to_digit(10).map(|d| d as i16)
}

fn erase_fill(value: f64, fill: Option<f64>) -> Option<f64> {
    if !value.is_finite() {
        return None;
    }
    match fill {
        Some(fill) if value == fill => None,
        _ => Some(value),
    }
}

fn read_filled_series(
    file: &NetcdfFile,
    name: &'static str,
    n_prof: usize,
) -> Result<Vec<Option<f64>>, ParseError> {
    let var = file
        .variable(name)
        .ok_or(ParseError::MissingVariable(name))?;
    let fill = var.fill_value();
    let raw = file.read_doubles(var)?;
    if raw.len() < n_prof {
        return Err(ParseError::Malformed(format!(
            "variable {name} holds {} values, expected {n_prof}",
            raw.len()
        )));
    }
    Ok(raw.into_iter().map(|v| erase_fill(v, fill)).collect())
}

fn read_int_series(
    file: &NetcdfFile,
    name: &'static str,
    n_prof: usize,
) -> Result<Vec<i64>, ParseError> {
    let var = file
        .variable(name)
        .ok_or(ParseError::MissingVariable(name))?;
    let raw = file.read_ints(var)?;
    if raw.len() < n_prof {
        return Err(ParseError::Malformed(format!(
            "variable {name} holds {} values, expected {n_prof}",
            raw.len()
        )));
    }
    Ok(raw)
}

fn read_char_series(
    file: &NetcdfFile,
    name: &'static str,
    n_prof: usize,
) -> Result<Vec<char>, ParseError> {
    let var = file
        .variable(name)
        .ok_or(ParseError::MissingVariable(name))?;
    let raw = file.read_chars(var)?;
    if raw.len() < n_prof {
        return Err(ParseError::Malformed(format!(
            "variable {name} holds {} values, expected {n_prof}",
            raw.len()
        )));
    }
    Ok(raw.into_iter().map(|b| b as char).collect())
}

/// First row of a (N_PROF, STRING*) char variable, whitespace- and
/// NUL-stripped.
fn read_first_string(
    file: &NetcdfFile,
    name: &'static str,
    n_prof: usize,
) -> Result<String, ParseError> {
    let var = file
        .variable(name)
        .ok_or(ParseError::MissingVariable(name))?;
    let shape = file.shape(var);
    let raw = file.read_chars(var)?;
    let row_len = match shape.len() {
        2 if n_prof > 0 => shape[1],
        1 => shape[0],
        _ => raw.len(),
    };
    let row = raw.get(0..row_len.min(raw.len())).unwrap_or(&raw);
    Ok(String::from_utf8_lossy(row)
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::netcdf_fixture::NetcdfBuilder;

    fn profile_fixture() -> Vec<u8> {
        // One float, two profiles, three levels. Second profile has a fill
        // JULD and an out-of-range latitude.
        NetcdfBuilder::new()
            .dimension("N_PROF", 2)
            .dimension("N_LEVELS", 3)
            .dimension("STRING8", 8)
            .char_var("PLATFORM_NUMBER", &["N_PROF", "STRING8"], b"2902746 2902746 ")
            .int_var("CYCLE_NUMBER", &["N_PROF"], &[12, 13])
            .double_var(
                "JULD",
                &["N_PROF"],
                Some(999999.0),
                &[26_000.5, 999999.0],
            )
            .double_var("LATITUDE", &["N_PROF"], Some(99999.0), &[7.9, 95.0])
            .double_var("LONGITUDE", &["N_PROF"], Some(99999.0), &[80.7, 81.0])
            .char_var("DATA_MODE", &["N_PROF"], b"DR")
            .float_var(
                "PRES",
                &["N_PROF", "N_LEVELS"],
                Some(99999.0),
                &[5.0, 100.0, 99999.0, 5.0, 200.0, 99999.0],
            )
            .float_var(
                "TEMP",
                &["N_PROF", "N_LEVELS"],
                Some(99999.0),
                &[28.4, 12.1, 99999.0, 27.8, 10.2, 99999.0],
            )
            .float_var(
                "PSAL",
                &["N_PROF", "N_LEVELS"],
                Some(99999.0),
                &[35.1, 34.9, 99999.0, 35.0, 34.8, 99999.0],
            )
            .char_var("TEMP_QC", &["N_PROF", "N_LEVELS"], b"14 21 ")
            .build()
    }

    #[test]
    fn parses_profiles_with_fill_erasure() {
        let result = parse_bytes(profile_fixture()).unwrap();
        assert_eq!(result.header.platform_number, "2902746");
        assert_eq!(result.header.float_type, FloatType::Core);
        assert_eq!(result.profiles.len(), 2);

        let first = &result.profiles[0];
        assert_eq!(first.cycle_number, 12);
        assert!(!first.timestamp_missing);
        assert!(!first.position_invalid);
        assert_eq!(first.data_mode, 'D');
        // Third level is all fill and gets dropped.
        assert_eq!(first.levels.len(), 2);
        assert_eq!(first.levels[0].pressure, Some(5.0));
        assert!(first.levels[0].temperature.unwrap() > 28.0);

        let second = &result.profiles[1];
        assert!(second.timestamp_missing);
        assert!(second.timestamp.is_none());
        assert!(second.position_invalid, "latitude 95 is outside [-90, 90]");
    }

    #[test]
    fn juld_epoch_resolution() {
        let result = parse_bytes(profile_fixture()).unwrap();
        let ts = result.profiles[0].timestamp.expect("timestamp");
        // 26000.5 days after 1950-01-01T00:00:00Z.
        let expected = Utc.with_ymd_and_hms(1950, 1, 1, 0, 0, 0).unwrap()
            + Duration::milliseconds((26_000.5_f64 * 86_400_000.0) as i64);
        assert_eq!(ts, expected);
    }

    #[test]
    fn qc_bytes_decode_as_digits() {
        let result = parse_bytes(profile_fixture()).unwrap();
        let first = &result.profiles[0];
        assert_eq!(first.levels[0].temperature_qc, Some(1));
        assert_eq!(first.levels[1].temperature_qc, Some(4));
        assert_eq!(decode_qc_byte(b'9'), Some(9));
        assert_eq!(decode_qc_byte(b' '), None);
        // The raw byte 0x04 is an unprintable control byte, not QC code 4.
        assert_eq!(decode_qc_byte(0x04), None);
    }

    #[test]
    fn missing_mandatory_variable_is_a_stable_error() {
        let bytes = NetcdfBuilder::new()
            .dimension("N_PROF", 1)
            .dimension("N_LEVELS", 1)
            .dimension("STRING8", 8)
            .char_var("PLATFORM_NUMBER", &["N_PROF", "STRING8"], b"2902746 ")
            .int_var("CYCLE_NUMBER", &["N_PROF"], &[1])
            .double_var("JULD", &["N_PROF"], None, &[26_000.0])
            .double_var("LATITUDE", &["N_PROF"], None, &[1.0])
            .double_var("LONGITUDE", &["N_PROF"], None, &[1.0])
            .char_var("DATA_MODE", &["N_PROF"], b"R")
            .float_var("PRES", &["N_PROF", "N_LEVELS"], None, &[5.0])
            .float_var("TEMP", &["N_PROF", "N_LEVELS"], None, &[28.0])
            .build();
        let err = parse_bytes(bytes).unwrap_err();
        assert_eq!(err.to_string(), "Missing required variable: PSAL");
    }

    #[test]
    fn trajectory_files_are_rejected() {
        let bytes = NetcdfBuilder::new()
            .dimension("N_MEASUREMENT", 10)
            .double_var("JULD", &["N_MEASUREMENT"], None, &[0.0; 10])
            .build();
        let err = parse_bytes(bytes).unwrap_err();
        assert!(matches!(err, ParseError::TrajectoryFile));
    }

    #[test]
    fn boundary_coordinates_are_valid() {
        let bytes = NetcdfBuilder::new()
            .dimension("N_PROF", 1)
            .dimension("N_LEVELS", 1)
            .dimension("STRING8", 8)
            .char_var("PLATFORM_NUMBER", &["N_PROF", "STRING8"], b"5904321 ")
            .int_var("CYCLE_NUMBER", &["N_PROF"], &[1])
            .double_var("JULD", &["N_PROF"], None, &[26_000.0])
            .double_var("LATITUDE", &["N_PROF"], None, &[-90.0])
            .double_var("LONGITUDE", &["N_PROF"], None, &[180.0])
            .char_var("DATA_MODE", &["N_PROF"], b"A")
            .float_var("PRES", &["N_PROF", "N_LEVELS"], None, &[10.0])
            .float_var("TEMP", &["N_PROF", "N_LEVELS"], None, &[2.0])
            .float_var("PSAL", &["N_PROF", "N_LEVELS"], None, &[34.5])
            .build();
        let result = parse_bytes(bytes).unwrap();
        assert!(!result.profiles[0].position_invalid);
    }

    #[test]
    fn bgc_variables_mark_the_float_bgc() {
        let bytes = NetcdfBuilder::new()
            .dimension("N_PROF", 1)
            .dimension("N_LEVELS", 1)
            .dimension("STRING8", 8)
            .char_var("PLATFORM_NUMBER", &["N_PROF", "STRING8"], b"6901234 ")
            .int_var("CYCLE_NUMBER", &["N_PROF"], &[7])
            .double_var("JULD", &["N_PROF"], None, &[26_000.0])
            .double_var("LATITUDE", &["N_PROF"], None, &[0.0])
            .double_var("LONGITUDE", &["N_PROF"], None, &[0.0])
            .char_var("DATA_MODE", &["N_PROF"], b"R")
            .float_var("PRES", &["N_PROF", "N_LEVELS"], None, &[10.0])
            .float_var("TEMP", &["N_PROF", "N_LEVELS"], None, &[25.0])
            .float_var("PSAL", &["N_PROF", "N_LEVELS"], None, &[35.0])
            .float_var("DOXY", &["N_PROF", "N_LEVELS"], Some(99999.0), &[210.0])
            .build();
        let result = parse_bytes(bytes).unwrap();
        assert_eq!(result.header.float_type, FloatType::Bgc);
        assert_eq!(result.profiles[0].levels[0].dissolved_oxygen, Some(210.0));
        assert!(result.variables.iter().any(|v| v == "DOXY"));
    }
}
