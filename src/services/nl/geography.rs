//! Known-place lookup for query text. A fixed lowercase-keyed table is built
//! once at startup; matching is case-insensitive substring scanning and
//! unknown names are silently ignored. Nothing here can fail a query.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Name, latitude, longitude. Coordinates are representative points, not
/// boundaries; region polygons live in the ocean_regions table.
const PLACES: &[(&str, f64, f64)] = &[
    ("arabian sea", 15.0, 65.0),
    ("bay of bengal", 15.0, 88.0),
    ("indian ocean", -20.0, 80.0),
    ("southern ocean", -60.0, 90.0),
    ("pacific ocean", 0.0, -160.0),
    ("north pacific", 30.0, -170.0),
    ("south pacific", -30.0, -140.0),
    ("atlantic ocean", 0.0, -30.0),
    ("north atlantic", 35.0, -40.0),
    ("south atlantic", -30.0, -15.0),
    ("mediterranean sea", 35.0, 18.0),
    ("red sea", 20.0, 38.0),
    ("persian gulf", 26.5, 52.0),
    ("gulf of aden", 12.0, 48.0),
    ("gulf of mexico", 25.0, -90.0),
    ("caribbean sea", 15.0, -75.0),
    ("south china sea", 12.0, 113.0),
    ("east china sea", 29.0, 125.0),
    ("sea of japan", 40.0, 135.0),
    ("coral sea", -18.0, 152.0),
    ("tasman sea", -40.0, 160.0),
    ("andaman sea", 10.0, 96.0),
    ("laccadive sea", 8.0, 75.0),
    ("mozambique channel", -18.0, 41.0),
    ("drake passage", -58.0, -65.0),
    ("weddell sea", -73.0, -45.0),
    ("ross sea", -75.0, -175.0),
    ("labrador sea", 57.0, -53.0),
    ("norwegian sea", 68.0, 2.0),
    ("barents sea", 75.0, 40.0),
    ("bering sea", 58.0, -178.0),
    ("sri lanka", 7.9, 80.7),
    ("maldives", 3.2, 73.2),
    ("madagascar", -19.0, 46.5),
    ("seychelles", -4.7, 55.5),
    ("mauritius", -20.3, 57.6),
    ("india", 15.0, 77.0),
    ("australia", -25.0, 135.0),
    ("japan", 36.0, 138.0),
    ("hawaii", 20.5, -157.0),
    ("azores", 38.5, -28.0),
    ("galapagos", -0.6, -90.4),
    ("equator", 0.0, 0.0),
];

fn table() -> &'static HashMap<&'static str, (f64, f64)> {
    static TABLE: OnceLock<HashMap<&'static str, (f64, f64)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        PLACES
            .iter()
            .map(|(name, lat, lon)| (*name, (*lat, *lon)))
            .collect()
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoMatch {
    pub name: &'static str,
    pub latitude: f64,
    pub longitude: f64,
}

/// All known places mentioned in the query, ordered by where they appear.
pub fn resolve(query: &str) -> Vec<GeoMatch> {
    let lowered = query.to_lowercase();
    let mut matches: Vec<(usize, GeoMatch)> = table()
        .iter()
        .filter_map(|(name, (lat, lon))| {
            lowered.find(name).map(|pos| {
                (
                    pos,
                    GeoMatch {
                        name,
                        latitude: *lat,
                        longitude: *lon,
                    },
                )
            })
        })
        .collect();
    matches.sort_by_key(|(pos, m)| (*pos, m.name));
    matches.into_iter().map(|(_, m)| m).collect()
}

/// Prompt snippet for every resolved place, or `None` when nothing matched.
pub fn coordinate_hint(query: &str) -> Option<String> {
    let matches = resolve(query);
    if matches.is_empty() {
        return None;
    }
    let lines: Vec<String> = matches
        .iter()
        .map(|m| {
            format!(
                "Geographic context: '{}' is at latitude {}, longitude {}. \
                 Use ST_MakePoint with longitude first.",
                m.name, m.latitude, m.longitude
            )
        })
        .collect();
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_are_case_insensitive_substrings() {
        let matches = resolve("Show TEMPERATURE near SRI LANKA in 2023");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "sri lanka");
        assert!((matches[0].latitude - 7.9).abs() < f64::EPSILON);
        assert!((matches[0].longitude - 80.7).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_names_are_silently_ignored() {
        assert!(resolve("floats near atlantis").is_empty());
        assert!(coordinate_hint("floats near atlantis").is_none());
    }

    #[test]
    fn multiple_places_ordered_by_position() {
        let matches = resolve("compare the bay of bengal with the arabian sea");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].name, "bay of bengal");
        assert_eq!(matches[1].name, "arabian sea");
    }

    #[test]
    fn hint_mentions_longitude_first_convention() {
        let hint = coordinate_hint("salinity near the maldives").unwrap();
        assert!(hint.contains("'maldives' is at latitude 3.2, longitude 73.2"));
        assert!(hint.contains("longitude first"));
    }
}
