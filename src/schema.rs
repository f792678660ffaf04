use anyhow::{Context, Result};
use sqlx::PgPool;

/// DDL applied at startup on the direct (migration) connection. Every
/// statement is idempotent so repeated boots are safe. Ordering follows
/// foreign-key dependencies.
const DDL: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS postgis",
    r#"
    CREATE TABLE IF NOT EXISTS floats (
        id BIGSERIAL PRIMARY KEY,
        platform_number TEXT NOT NULL UNIQUE,
        wmo_id TEXT,
        float_type TEXT NOT NULL DEFAULT 'core',
        deployment_date TIMESTAMPTZ,
        deployment_latitude DOUBLE PRECISION,
        deployment_longitude DOUBLE PRECISION,
        program TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS datasets (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        source_filename TEXT NOT NULL,
        object_key TEXT,
        ingested_at TIMESTAMPTZ,
        date_range_start TIMESTAMPTZ,
        date_range_end TIMESTAMPTZ,
        bbox GEOGRAPHY(POLYGON, 4326),
        float_count INTEGER NOT NULL DEFAULT 0,
        profile_count INTEGER NOT NULL DEFAULT 0,
        variables TEXT[] NOT NULL DEFAULT '{}',
        summary TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        dataset_version INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    // Version bookkeeping for re-ingested logical datasets. The increment is
    // wired from the dataset-management surface, not from ingestion.
    // TODO(dataset-management): write rows here when a logical dataset is
    // re-ingested under a new dataset id.
    r#"
    CREATE TABLE IF NOT EXISTS dataset_versions (
        id BIGSERIAL PRIMARY KEY,
        dataset_name TEXT NOT NULL,
        dataset_version INTEGER NOT NULL,
        dataset_id UUID REFERENCES datasets(id),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (dataset_name, dataset_version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id BIGSERIAL PRIMARY KEY,
        float_id BIGINT NOT NULL REFERENCES floats(id),
        dataset_id UUID REFERENCES datasets(id),
        platform_number TEXT NOT NULL,
        cycle_number INTEGER NOT NULL,
        juld_raw DOUBLE PRECISION,
        timestamp TIMESTAMPTZ,
        timestamp_missing BOOLEAN NOT NULL DEFAULT FALSE,
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        position_invalid BOOLEAN NOT NULL DEFAULT FALSE,
        geom GEOGRAPHY(POINT, 4326),
        data_mode TEXT NOT NULL DEFAULT 'R',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (platform_number, cycle_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS measurements (
        id BIGSERIAL PRIMARY KEY,
        profile_id BIGINT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
        level_index INTEGER NOT NULL,
        pressure DOUBLE PRECISION,
        temperature DOUBLE PRECISION,
        salinity DOUBLE PRECISION,
        dissolved_oxygen DOUBLE PRECISION,
        chlorophyll DOUBLE PRECISION,
        nitrate DOUBLE PRECISION,
        ph_in_situ DOUBLE PRECISION,
        backscatter DOUBLE PRECISION,
        irradiance DOUBLE PRECISION,
        pressure_qc SMALLINT,
        temperature_qc SMALLINT,
        salinity_qc SMALLINT,
        is_outlier BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS float_positions (
        id BIGSERIAL PRIMARY KEY,
        platform_number TEXT NOT NULL,
        cycle_number INTEGER NOT NULL,
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        geom GEOGRAPHY(POINT, 4326),
        timestamp TIMESTAMPTZ,
        UNIQUE (platform_number, cycle_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingestion_jobs (
        id UUID PRIMARY KEY,
        dataset_id UUID REFERENCES datasets(id),
        status TEXT NOT NULL DEFAULT 'pending',
        progress_percent REAL NOT NULL DEFAULT 0,
        profiles_total INTEGER NOT NULL DEFAULT 0,
        profiles_ingested INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        retry_at TIMESTAMPTZ,
        object_key TEXT,
        source_filename TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingestion_job_events (
        id BIGSERIAL PRIMARY KEY,
        job_id UUID NOT NULL REFERENCES ingestion_jobs(id),
        kind TEXT NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ocean_regions (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        parent_id BIGINT REFERENCES ocean_regions(id),
        boundary GEOGRAPHY(POLYGON, 4326)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dataset_embeddings (
        dataset_id UUID PRIMARY KEY REFERENCES datasets(id),
        embedded_text TEXT NOT NULL,
        embedding REAL[],
        status TEXT NOT NULL DEFAULT 'indexed',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS float_embeddings (
        float_id BIGINT PRIMARY KEY REFERENCES floats(id),
        embedded_text TEXT NOT NULL,
        embedding REAL[],
        status TEXT NOT NULL DEFAULT 'indexed',
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_profiles_timestamp ON profiles (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_profiles_dataset ON profiles (dataset_id)",
    "CREATE INDEX IF NOT EXISTS idx_profiles_geom ON profiles USING GIST (geom)",
    "CREATE INDEX IF NOT EXISTS idx_measurements_profile ON measurements (profile_id)",
    "CREATE INDEX IF NOT EXISTS idx_float_positions_geom ON float_positions USING GIST (geom)",
    "CREATE INDEX IF NOT EXISTS idx_ocean_regions_boundary ON ocean_regions USING GIST (boundary)",
    "CREATE INDEX IF NOT EXISTS idx_datasets_bbox ON datasets USING GIST (bbox)",
    "CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_status ON ingestion_jobs (status, created_at)",
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS mv_float_latest_position AS
    SELECT DISTINCT ON (fp.platform_number)
        fp.platform_number,
        fp.cycle_number,
        fp.latitude,
        fp.longitude,
        fp.geom,
        fp.timestamp
    FROM float_positions fp
    ORDER BY fp.platform_number, fp.timestamp DESC NULLS LAST, fp.cycle_number DESC
    "#,
    // Concurrent refresh requires a unique index on each materialized view.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_mv_float_latest_position_platform
    ON mv_float_latest_position (platform_number)
    "#,
    r#"
    CREATE MATERIALIZED VIEW IF NOT EXISTS mv_dataset_stats AS
    SELECT
        d.id AS dataset_id,
        d.name,
        d.dataset_version,
        d.is_active,
        d.date_range_start,
        d.date_range_end,
        d.float_count,
        d.profile_count,
        count(m.id) AS measurement_count,
        count(m.id) FILTER (WHERE m.is_outlier) AS outlier_count
    FROM datasets d
    LEFT JOIN profiles p ON p.dataset_id = d.id
    LEFT JOIN measurements m ON m.profile_id = p.id
    GROUP BY d.id
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_mv_dataset_stats_dataset
    ON mv_dataset_stats (dataset_id)
    "#,
];

/// Baseline region polygons for region-scoped queries and reverse lookup.
/// Coarse boxes that stay clear of the antimeridian; finer boundaries can be
/// loaded over them later. Conflict-free on re-run.
const SEED: &[&str] = &[
    r#"
    INSERT INTO ocean_regions (name, parent_id, boundary)
    VALUES ('Indian Ocean', NULL,
        ST_GeogFromText('POLYGON((20 -60, 120 -60, 120 30, 20 30, 20 -60))'))
    ON CONFLICT (name) DO NOTHING
    "#,
    r#"
    INSERT INTO ocean_regions (name, parent_id, boundary)
    SELECT 'Arabian Sea', id,
        ST_GeogFromText('POLYGON((50 0, 78 0, 78 27, 50 27, 50 0))')
    FROM ocean_regions WHERE name = 'Indian Ocean'
    ON CONFLICT (name) DO NOTHING
    "#,
    r#"
    INSERT INTO ocean_regions (name, parent_id, boundary)
    SELECT 'Bay of Bengal', id,
        ST_GeogFromText('POLYGON((78 0, 100 0, 100 23, 78 23, 78 0))')
    FROM ocean_regions WHERE name = 'Indian Ocean'
    ON CONFLICT (name) DO NOTHING
    "#,
    r#"
    INSERT INTO ocean_regions (name, parent_id, boundary)
    VALUES ('North Atlantic', NULL,
        ST_GeogFromText('POLYGON((-80 0, 0 0, 0 65, -80 65, -80 0))'))
    ON CONFLICT (name) DO NOTHING
    "#,
    r#"
    INSERT INTO ocean_regions (name, parent_id, boundary)
    VALUES ('South Atlantic', NULL,
        ST_GeogFromText('POLYGON((-70 -60, 20 -60, 20 0, -70 0, -70 -60))'))
    ON CONFLICT (name) DO NOTHING
    "#,
    r#"
    INSERT INTO ocean_regions (name, parent_id, boundary)
    VALUES ('Mediterranean Sea', NULL,
        ST_GeogFromText('POLYGON((-6 30, 36 30, 36 46, -6 46, -6 30))'))
    ON CONFLICT (name) DO NOTHING
    "#,
];

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in DDL.iter().chain(SEED) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| {
                let head: String = statement.trim().chars().take(60).collect();
                format!("schema statement failed: {head}")
            })?;
    }
    tracing::info!(statements = DDL.len() + SEED.len(), "schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_is_idempotent_by_construction() {
        for statement in DDL {
            let trimmed = statement.trim_start();
            assert!(
                trimmed.starts_with("CREATE EXTENSION IF NOT EXISTS")
                    || trimmed.starts_with("CREATE TABLE IF NOT EXISTS")
                    || trimmed.starts_with("CREATE INDEX IF NOT EXISTS")
                    || trimmed.starts_with("CREATE UNIQUE INDEX IF NOT EXISTS")
                    || trimmed.starts_with("CREATE MATERIALIZED VIEW IF NOT EXISTS"),
                "non-idempotent DDL statement: {trimmed}"
            );
        }
    }

    #[test]
    fn seeds_never_conflict_on_rerun() {
        for statement in SEED {
            assert!(statement.contains("ON CONFLICT (name) DO NOTHING"));
        }
    }

    #[test]
    fn measurements_cascade_from_profiles() {
        let measurements = DDL
            .iter()
            .find(|s| s.contains("CREATE TABLE IF NOT EXISTS measurements"))
            .unwrap();
        assert!(measurements.contains("ON DELETE CASCADE"));
    }
}
