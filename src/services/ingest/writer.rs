//! Transactional row writes for parse results. Every function here runs
//! against a caller-owned transaction; the orchestrator commits or rolls
//! back, so a failing job leaves no partial rows behind.

use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::services::argo::types::{MeasurementRecord, ParseResult, ProfileRecord};

#[derive(Debug, Default)]
pub struct WriteSummary {
    pub float_id: i64,
    pub profiles_written: usize,
    pub measurements_written: usize,
}

/// Insert-if-absent keyed on platform number, then read the id back.
pub async fn upsert_float(
    tx: &mut Transaction<'_, Postgres>,
    platform_number: &str,
    float_type: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO floats (platform_number, wmo_id, float_type, created_at, updated_at)
        VALUES ($1, $1, $2, now(), now())
        ON CONFLICT (platform_number) DO NOTHING
        "#,
    )
    .bind(platform_number)
    .bind(float_type)
    .execute(&mut **tx)
    .await?;

    let (id,): (i64,) = sqlx::query_as(
        r#"
        SELECT id FROM floats WHERE platform_number = $1
        "#,
    )
    .bind(platform_number)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

/// One row per (platform, cycle); re-ingestion updates in place. The spatial
/// point is computed longitude-first and only when the position is valid.
pub async fn upsert_profile(
    tx: &mut Transaction<'_, Postgres>,
    profile: &ProfileRecord,
    platform_number: &str,
    float_id: i64,
    dataset_id: Uuid,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO profiles (
            float_id, dataset_id, platform_number, cycle_number,
            juld_raw, timestamp, timestamp_missing,
            latitude, longitude, position_invalid, geom, data_mode,
            created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
            CASE WHEN $10 THEN NULL
                 ELSE ST_SetSRID(ST_MakePoint($9, $8), 4326)::geography END,
            $11, now(), now()
        )
        ON CONFLICT (platform_number, cycle_number) DO UPDATE SET
            float_id = EXCLUDED.float_id,
            dataset_id = EXCLUDED.dataset_id,
            juld_raw = EXCLUDED.juld_raw,
            timestamp = EXCLUDED.timestamp,
            timestamp_missing = EXCLUDED.timestamp_missing,
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            position_invalid = EXCLUDED.position_invalid,
            geom = EXCLUDED.geom,
            data_mode = EXCLUDED.data_mode,
            updated_at = now()
        RETURNING id
        "#,
    )
    .bind(float_id)
    .bind(dataset_id)
    .bind(platform_number)
    .bind(profile.cycle_number)
    .bind(profile.juld_raw)
    .bind(profile.timestamp)
    .bind(profile.timestamp_missing)
    .bind(profile.latitude)
    .bind(profile.longitude)
    .bind(profile.position_invalid)
    .bind(profile.data_mode.to_string())
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

/// Full replacement of a profile's measurements: delete, then batched
/// multi-row inserts. One statement per batch, never one per row.
pub async fn write_measurements(
    tx: &mut Transaction<'_, Postgres>,
    profile_id: i64,
    levels: &[MeasurementRecord],
    batch_size: usize,
) -> Result<usize, sqlx::Error> {
    sqlx::query("DELETE FROM measurements WHERE profile_id = $1")
        .bind(profile_id)
        .execute(&mut **tx)
        .await?;

    let batch_size = batch_size.max(1);
    for chunk in levels.chunks(batch_size) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO measurements (
                profile_id, level_index, pressure, temperature, salinity,
                dissolved_oxygen, chlorophyll, nitrate, ph_in_situ,
                backscatter, irradiance,
                pressure_qc, temperature_qc, salinity_qc, is_outlier
            ) ",
        );
        qb.push_values(chunk, |mut b, level| {
            b.push_bind(profile_id)
                .push_bind(level.level_index)
                .push_bind(level.pressure)
                .push_bind(level.temperature)
                .push_bind(level.salinity)
                .push_bind(level.dissolved_oxygen)
                .push_bind(level.chlorophyll)
                .push_bind(level.nitrate)
                .push_bind(level.ph_in_situ)
                .push_bind(level.backscatter)
                .push_bind(level.irradiance)
                .push_bind(level.pressure_qc)
                .push_bind(level.temperature_qc)
                .push_bind(level.salinity_qc)
                .push_bind(level.is_outlier);
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(levels.len())
}

/// Denormalized map row per (platform, cycle), kept in step with profiles.
pub async fn upsert_float_position(
    tx: &mut Transaction<'_, Postgres>,
    profile: &ProfileRecord,
    platform_number: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO float_positions (
            platform_number, cycle_number, latitude, longitude, geom, timestamp
        ) VALUES (
            $1, $2, $3, $4,
            CASE WHEN $5 THEN NULL
                 ELSE ST_SetSRID(ST_MakePoint($4, $3), 4326)::geography END,
            $6
        )
        ON CONFLICT (platform_number, cycle_number) DO UPDATE SET
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            geom = EXCLUDED.geom,
            timestamp = EXCLUDED.timestamp
        "#,
    )
    .bind(platform_number)
    .bind(profile.cycle_number)
    .bind(profile.latitude)
    .bind(profile.longitude)
    .bind(profile.position_invalid)
    .bind(profile.timestamp)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Writes one parse result in FK-dependency order: float, then each profile
/// with its measurements and position row.
pub async fn write_parse_result(
    tx: &mut Transaction<'_, Postgres>,
    parse: &ParseResult,
    dataset_id: Uuid,
    batch_size: usize,
) -> Result<WriteSummary, sqlx::Error> {
    let platform = parse.header.platform_number.as_str();
    let float_id = upsert_float(tx, platform, parse.header.float_type.as_str()).await?;

    let mut summary = WriteSummary {
        float_id,
        ..Default::default()
    };
    for profile in &parse.profiles {
        let profile_id = upsert_profile(tx, profile, platform, float_id, dataset_id).await?;
        summary.measurements_written +=
            write_measurements(tx, profile_id, &profile.levels, batch_size).await?;
        upsert_float_position(tx, profile, platform).await?;
        summary.profiles_written += 1;
    }
    Ok(summary)
}

/// Created at upload time, before any job runs; the orchestrator only ever
/// updates this row.
pub async fn create_dataset(
    db: &PgPool,
    dataset_id: Uuid,
    name: &str,
    source_filename: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO datasets (id, name, source_filename, created_at, updated_at)
        VALUES ($1, $2, $3, now(), now())
        "#,
    )
    .bind(dataset_id)
    .bind(name)
    .bind(source_filename)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_dataset_object_key(
    db: &PgPool,
    dataset_id: Uuid,
    object_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE datasets
        SET object_key = $2,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(dataset_id)
    .bind(object_key)
    .execute(db)
    .await?;
    Ok(())
}
