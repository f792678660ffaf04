//! Range screening over parsed profiles. Out-of-range values are flagged,
//! never dropped; the flag travels with the row so downstream queries can
//! filter or inspect outliers explicitly.

use std::collections::BTreeMap;

use crate::config::OutlierBounds;

use super::types::ParseResult;

#[derive(Debug, Default)]
pub struct CleanReport {
    pub levels_total: u64,
    pub levels_flagged: u64,
    pub flagged_by_variable: BTreeMap<&'static str, u64>,
}

pub fn clean(parse: &mut ParseResult, bounds: &OutlierBounds) -> CleanReport {
    let mut report = CleanReport::default();
    for profile in &mut parse.profiles {
        for level in &mut profile.levels {
            report.levels_total += 1;
            let mut flagged = false;
            let checks: [(&'static str, Option<f64>, (f64, f64)); 7] = [
                ("temperature", level.temperature, bounds.temperature),
                ("salinity", level.salinity, bounds.salinity),
                ("pressure", level.pressure, bounds.pressure),
                (
                    "dissolved_oxygen",
                    level.dissolved_oxygen,
                    bounds.dissolved_oxygen,
                ),
                ("chlorophyll", level.chlorophyll, bounds.chlorophyll),
                ("nitrate", level.nitrate, bounds.nitrate),
                ("ph", level.ph_in_situ, bounds.ph),
            ];
            for (name, value, (lower, upper)) in checks {
                if let Some(value) = value {
                    if value < lower || value > upper {
                        *report.flagged_by_variable.entry(name).or_insert(0) += 1;
                        flagged = true;
                    }
                }
            }
            if flagged {
                level.is_outlier = true;
                report.levels_flagged += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::argo::types::{
        FloatHeader, FloatType, MeasurementRecord, ProfileRecord,
    };

    fn single_level(level: MeasurementRecord) -> ParseResult {
        ParseResult {
            header: FloatHeader {
                platform_number: "2902746".to_string(),
                float_type: FloatType::Core,
            },
            variables: vec!["PRES".to_string(), "TEMP".to_string(), "PSAL".to_string()],
            profiles: vec![ProfileRecord {
                cycle_number: 1,
                juld_raw: Some(26_000.0),
                timestamp: None,
                timestamp_missing: false,
                latitude: Some(0.0),
                longitude: Some(0.0),
                position_invalid: false,
                data_mode: 'R',
                levels: vec![level],
            }],
        }
    }

    #[test]
    fn zero_pressure_is_not_an_outlier() {
        let mut parse = single_level(MeasurementRecord {
            pressure: Some(0.0),
            temperature: Some(10.0),
            salinity: Some(35.0),
            ..Default::default()
        });
        let report = clean(&mut parse, &OutlierBounds::default());
        assert_eq!(report.levels_flagged, 0);
        assert!(!parse.profiles[0].levels[0].is_outlier);
    }

    #[test]
    fn negative_pressure_is_flagged_but_retained() {
        let mut parse = single_level(MeasurementRecord {
            pressure: Some(-1.0),
            temperature: Some(10.0),
            salinity: Some(35.0),
            ..Default::default()
        });
        let report = clean(&mut parse, &OutlierBounds::default());
        assert_eq!(report.levels_flagged, 1);
        assert_eq!(report.flagged_by_variable.get("pressure"), Some(&1));
        let level = &parse.profiles[0].levels[0];
        assert!(level.is_outlier);
        assert_eq!(level.pressure, Some(-1.0), "value survives flagging");
    }

    #[test]
    fn multiple_variables_count_separately() {
        let mut parse = single_level(MeasurementRecord {
            pressure: Some(10.0),
            temperature: Some(45.0),
            salinity: Some(50.0),
            ph_in_situ: Some(6.2),
            ..Default::default()
        });
        let report = clean(&mut parse, &OutlierBounds::default());
        assert_eq!(report.levels_flagged, 1);
        assert_eq!(report.flagged_by_variable.get("temperature"), Some(&1));
        assert_eq!(report.flagged_by_variable.get("salinity"), Some(&1));
        assert_eq!(report.flagged_by_variable.get("ph"), Some(&1));
    }

    #[test]
    fn bounds_are_inclusive_at_both_ends() {
        let mut parse = single_level(MeasurementRecord {
            pressure: Some(12_000.0),
            temperature: Some(-2.5),
            salinity: Some(42.0),
            ..Default::default()
        });
        let report = clean(&mut parse, &OutlierBounds::default());
        assert_eq!(report.levels_flagged, 0);
    }

    #[test]
    fn absent_values_are_never_flagged() {
        let mut parse = single_level(MeasurementRecord::default());
        let report = clean(&mut parse, &OutlierBounds::default());
        assert_eq!(report.levels_flagged, 0);
    }
}
