//! The process-wide schema prompt. Built exactly once at first use and shared
//! by every request; nothing rebuilds it per query.

use std::sync::OnceLock;

use super::validator::WHITELISTED_TABLES;

/// NL→SQL few-shot catalogue. Each pair is (question, SQL); the SQL follows
/// every convention the prompt teaches.
pub const FEW_SHOT_EXAMPLES: &[(&str, &str)] = &[
    (
        "Show temperature profiles near Sri Lanka in 2023",
        "SELECT p.platform_number, p.cycle_number, p.timestamp, m.pressure, m.temperature \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE ST_DWithin(p.geom, ST_SetSRID(ST_MakePoint(80.7, 7.9), 4326)::geography, 300000) \
         AND p.timestamp >= '2023-01-01' AND p.timestamp < '2024-01-01' \
         AND m.temperature IS NOT NULL ORDER BY p.timestamp, m.pressure",
    ),
    (
        "Which floats are in the Arabian Sea?",
        "SELECT DISTINCT fp.platform_number FROM float_positions fp \
         JOIN ocean_regions r ON r.name = 'Arabian Sea' \
         WHERE ST_Covers(r.boundary, fp.geom)",
    ),
    (
        "How many profiles were collected in March 2023?",
        "SELECT count(*) FROM profiles \
         WHERE timestamp >= '2023-03-01' AND timestamp < '2023-04-01'",
    ),
    (
        "Salinity between 100 and 500 dbar for float 2902746",
        "SELECT p.cycle_number, m.pressure, m.salinity \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE p.platform_number = '2902746' \
         AND m.pressure BETWEEN 100 AND 500 AND m.salinity IS NOT NULL \
         ORDER BY p.cycle_number, m.pressure",
    ),
    (
        "Where is dissolved oxygen below 60 umol/kg?",
        "SELECT p.platform_number, p.latitude, p.longitude, m.pressure, m.dissolved_oxygen \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE m.dissolved_oxygen IS NOT NULL AND m.dissolved_oxygen < 60 \
         AND m.is_outlier = FALSE",
    ),
    (
        "Which datasets include nitrate measurements?",
        "SELECT name, date_range_start, date_range_end FROM datasets \
         WHERE 'NITRATE' = ANY(variables) AND is_active = TRUE",
    ),
    (
        "List BGC floats and their latest position",
        "SELECT f.platform_number, f.float_type, lp.latitude, lp.longitude, lp.timestamp \
         FROM floats f JOIN mv_float_latest_position lp \
         ON lp.platform_number = f.platform_number \
         WHERE f.float_type = 'BGC'",
    ),
    (
        "Trajectory of float 2902746",
        "SELECT cycle_number, latitude, longitude, timestamp FROM float_positions \
         WHERE platform_number = '2902746' ORDER BY cycle_number",
    ),
    (
        "Surface temperature in the Bay of Bengal",
        "SELECT p.platform_number, p.timestamp, m.temperature \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE ST_DWithin(p.geom, ST_SetSRID(ST_MakePoint(88.0, 15.0), 4326)::geography, 500000) \
         AND m.pressure < 10 AND m.temperature IS NOT NULL",
    ),
    (
        "Deep measurements below 1500 dbar from the last year",
        "SELECT p.platform_number, p.timestamp, m.pressure, m.temperature, m.salinity \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE m.pressure > 1500 AND p.timestamp > now() - interval '1 year'",
    ),
    (
        "Temperature-salinity pairs for float 5904321 cycle 42",
        "SELECT m.pressure, m.temperature, m.salinity \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE p.platform_number = '5904321' AND p.cycle_number = 42 \
         AND m.temperature IS NOT NULL AND m.salinity IS NOT NULL \
         ORDER BY m.pressure",
    ),
    (
        "Average surface salinity by month in 2023",
        "SELECT date_trunc('month', p.timestamp) AS month, avg(m.salinity) AS avg_salinity \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE m.pressure < 10 AND m.salinity IS NOT NULL \
         AND p.timestamp >= '2023-01-01' AND p.timestamp < '2024-01-01' \
         GROUP BY month ORDER BY month",
    ),
    (
        "Summary statistics for every active dataset",
        "SELECT name, dataset_version, float_count, profile_count, measurement_count, \
         outlier_count FROM mv_dataset_stats WHERE is_active = TRUE",
    ),
    (
        "Floats within 200 km of the Maldives",
        "SELECT DISTINCT platform_number FROM float_positions \
         WHERE ST_DWithin(geom, ST_SetSRID(ST_MakePoint(73.2, 3.2), 4326)::geography, 200000)",
    ),
    (
        "Only trustworthy temperature readings near the equator",
        "SELECT p.platform_number, p.latitude, m.pressure, m.temperature \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE p.latitude BETWEEN -5 AND 5 \
         AND m.temperature_qc IN (1, 2) AND m.is_outlier = FALSE",
    ),
    (
        "Profiles with missing timestamps",
        "SELECT platform_number, cycle_number, juld_raw FROM profiles \
         WHERE timestamp_missing = TRUE",
    ),
    (
        "Which sub-regions of the Indian Ocean do we know about?",
        "SELECT child.name FROM ocean_regions child \
         JOIN ocean_regions parent ON child.parent_id = parent.id \
         WHERE parent.name = 'Indian Ocean'",
    ),
    (
        "Count of measurements per float, largest first",
        "SELECT p.platform_number, count(m.id) AS measurement_count \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         GROUP BY p.platform_number ORDER BY measurement_count DESC",
    ),
    (
        "Delayed-mode profiles from dataset 'indian-ocean-2023'",
        "SELECT p.platform_number, p.cycle_number, p.timestamp \
         FROM profiles p JOIN datasets d ON d.id = p.dataset_id \
         WHERE d.name = 'indian-ocean-2023' AND p.data_mode = 'D'",
    ),
    (
        "Chlorophyll maximum depth per profile in the Arabian Sea",
        "WITH chl AS (\
         SELECT p.id, p.platform_number, p.cycle_number, m.pressure, m.chlorophyll, \
         row_number() OVER (PARTITION BY p.id ORDER BY m.chlorophyll DESC) AS rank \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         JOIN ocean_regions r ON r.name = 'Arabian Sea' \
         WHERE ST_Covers(r.boundary, p.geom) AND m.chlorophyll IS NOT NULL) \
         SELECT platform_number, cycle_number, pressure, chlorophyll \
         FROM chl WHERE rank = 1",
    ),
    (
        "Most recent profile for each float",
        "SELECT platform_number, cycle_number, latitude, longitude, timestamp \
         FROM mv_float_latest_position ORDER BY timestamp DESC",
    ),
    (
        "pH readings flagged as outliers",
        "SELECT p.platform_number, p.cycle_number, m.pressure, m.ph_in_situ \
         FROM profiles p JOIN measurements m ON m.profile_id = p.id \
         WHERE m.ph_in_situ IS NOT NULL AND m.is_outlier = TRUE",
    ),
];

fn build_schema_prompt() -> String {
    let mut prompt = String::with_capacity(16 * 1024);
    prompt.push_str(
        "You are a PostgreSQL query generator for an ARGO oceanographic float database. \
         Respond with a single SQL SELECT statement and nothing else: no prose, no \
         markdown fences, no explanations.\n\n",
    );

    prompt.push_str("Tables:\n");
    prompt.push_str(
        "- floats: one row per float. Columns: id, platform_number (text identity), \
         wmo_id, float_type ('core' | 'BGC' | 'deep'), deployment_date, \
         deployment_latitude, deployment_longitude, program.\n\
         - profiles: one row per (platform_number, cycle_number). Columns: id, float_id, \
         dataset_id, platform_number, cycle_number, juld_raw, timestamp (timestamptz), \
         timestamp_missing, latitude, longitude, position_invalid, geom \
         (geography point, NULL when the position is invalid), data_mode ('R'|'A'|'D').\n\
         - measurements: one row per depth level. Columns: id, profile_id, level_index, \
         pressure (dbar), temperature (deg C), salinity (PSU), dissolved_oxygen, \
         chlorophyll, nitrate, ph_in_situ, backscatter, irradiance, pressure_qc, \
         temperature_qc, salinity_qc, is_outlier.\n\
         - datasets: one row per ingested file. Columns: id, name, source_filename, \
         date_range_start, date_range_end, bbox (geography polygon), float_count, \
         profile_count, variables (text[]), summary, is_active, dataset_version.\n\
         - float_positions: denormalized (platform_number, cycle_number) positions with \
         geom and timestamp for fast map queries.\n\
         - ocean_regions: named region polygons; parent_id links sub-regions to basins.\n\
         - mv_float_latest_position: latest position per platform_number.\n\
         - mv_dataset_stats: per-dataset aggregates including measurement_count and \
         outlier_count.\n\n",
    );

    prompt.push_str("Conventions:\n");
    prompt.push_str(
        "- Filter time on profiles.timestamp, never on juld_raw.\n\
         - Pressure is in decibars and is a depth proxy: surface < 10 dbar, deep > 1000 dbar.\n\
         - QC flags 1 and 2 are trustworthy; filter with *_qc IN (1, 2) when asked for \
         good data, and exclude is_outlier = TRUE unless outliers are requested.\n\
         - All spatial predicates use the spherical geography type: cast with ::geography, \
         never ::geometry.\n\
         - Build points longitude first: ST_SetSRID(ST_MakePoint(longitude, latitude), 4326).\n\
         - Resolve named seas and basins through the ocean_regions table with ST_Covers.\n\
         - Distances for ST_DWithin are in meters.\n\n",
    );

    prompt.push_str("Only these tables may be referenced: ");
    prompt.push_str(&WHITELISTED_TABLES.join(", "));
    prompt.push_str(".\n\nExamples:\n");
    for (question, sql) in FEW_SHOT_EXAMPLES {
        prompt.push_str("Q: ");
        prompt.push_str(question);
        prompt.push_str("\nSQL: ");
        prompt.push_str(sql);
        prompt.push_str("\n\n");
    }
    prompt
}

/// The schema prompt, built once per process.
pub fn schema_prompt() -> &'static str {
    static PROMPT: OnceLock<String> = OnceLock::new();
    PROMPT.get_or_init(build_schema_prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::nl::validator;

    #[test]
    fn prompt_is_built_once() {
        let first = schema_prompt().as_ptr();
        let second = schema_prompt().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn prompt_carries_whitelist_and_conventions() {
        let prompt = schema_prompt();
        for table in WHITELISTED_TABLES {
            assert!(prompt.contains(table), "missing table {table}");
        }
        assert!(prompt.contains("::geography"));
        assert!(prompt.contains("longitude first"));
        assert!(prompt.contains("timestamp, never on juld_raw"));
        assert!(prompt.contains("decibars"));
    }

    #[test]
    fn at_least_twenty_examples() {
        assert!(FEW_SHOT_EXAMPLES.len() >= 20, "{}", FEW_SHOT_EXAMPLES.len());
    }

    #[test]
    fn every_example_passes_the_validator() {
        for (question, sql) in FEW_SHOT_EXAMPLES {
            let report = validator::validate(sql);
            assert!(
                report.valid,
                "example for {question:?} failed: {:?}",
                report.error
            );
            assert!(
                report.warnings.is_empty(),
                "example for {question:?} warned: {:?}",
                report.warnings
            );
        }
    }
}
