use anyhow::{Context, Result};

/// Outlier bounds applied by the cleaner. All ranges are inclusive; values
/// outside are flagged, never dropped.
#[derive(Debug, Clone, Copy)]
pub struct OutlierBounds {
    pub temperature: (f64, f64),
    pub salinity: (f64, f64),
    pub pressure: (f64, f64),
    pub dissolved_oxygen: (f64, f64),
    pub chlorophyll: (f64, f64),
    pub nitrate: (f64, f64),
    pub ph: (f64, f64),
}

impl Default for OutlierBounds {
    fn default() -> Self {
        Self {
            temperature: (-2.5, 40.0),
            salinity: (0.0, 42.0),
            pressure: (0.0, 12_000.0),
            dissolved_oxygen: (0.0, 600.0),
            chlorophyll: (0.0, 100.0),
            nitrate: (0.0, 50.0),
            ph: (7.0, 8.5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub read_database_url: String,
    pub direct_database_url: String,

    pub s3_endpoint: String,
    pub s3_bucket: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_region: String,
    pub s3_allow_http: bool,

    pub redis_url: Option<String>,

    pub llm_provider: String,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_timeout_seconds: u64,

    pub embedding_base_url: String,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dimension: usize,

    pub max_upload_bytes: u64,
    pub admin_api_key: Option<String>,

    pub query_row_limit: i64,
    pub query_max_row_limit: i64,
    pub query_timeout_ms: u64,
    pub confirm_row_threshold: i64,

    pub context_max_turns: usize,
    pub context_recent_turns: usize,
    pub context_ttl_seconds: u64,

    pub ingest_max_concurrent_jobs: usize,
    pub ingest_poll_interval_ms: u64,
    pub ingest_max_retries: u32,
    pub ingest_stale_after_seconds: u64,
    pub ingest_sweep_interval_seconds: u64,
    pub measurement_batch_size: usize,

    pub outlier_bounds: OutlierBounds,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("FLOATCORE_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("FLOATCORE_DATABASE_URL must be set (write-capable role)")?;
        // The read-only and direct URLs default to the write URL so a
        // single-role dev setup still boots; production sets all three.
        let read_database_url = env_string("FLOATCORE_READ_DATABASE_URL", &database_url);
        let direct_database_url = env_string("FLOATCORE_DIRECT_DATABASE_URL", &database_url);

        let s3_endpoint = env_string("FLOATCORE_S3_ENDPOINT", "http://127.0.0.1:9000");
        let s3_bucket = env_string("FLOATCORE_S3_BUCKET", "argo-raw");
        let s3_access_key = env_string("FLOATCORE_S3_ACCESS_KEY", "minioadmin");
        let s3_secret_key = env_string("FLOATCORE_S3_SECRET_KEY", "minioadmin");
        let s3_region = env_string("FLOATCORE_S3_REGION", "us-east-1");
        let s3_allow_http = env_bool("FLOATCORE_S3_ALLOW_HTTP", true);

        let redis_url = env_optional_string("FLOATCORE_REDIS_URL");

        let llm_provider = env_string("FLOATCORE_LLM_PROVIDER", "openai");
        let llm_base_url = env_string("FLOATCORE_LLM_BASE_URL", "https://api.openai.com/v1");
        let llm_api_key = env_optional_string("FLOATCORE_LLM_API_KEY");
        let llm_model = env_string("FLOATCORE_LLM_MODEL", "gpt-4o-mini");
        let llm_timeout_seconds = env_u64("FLOATCORE_LLM_TIMEOUT_SECONDS", 30).clamp(5, 300);

        let embedding_base_url =
            env_string("FLOATCORE_EMBEDDING_BASE_URL", llm_base_url.trim_end_matches('/'));
        let embedding_api_key =
            env_optional_string("FLOATCORE_EMBEDDING_API_KEY").or_else(|| llm_api_key.clone());
        let embedding_model =
            env_string("FLOATCORE_EMBEDDING_MODEL", "text-embedding-3-small");
        let embedding_dimension =
            env_u64("FLOATCORE_EMBEDDING_DIMENSION", 1536).clamp(8, 8192) as usize;

        let max_upload_bytes = env_u64("FLOATCORE_MAX_UPLOAD_MB", 512).clamp(1, 10_240) * 1024 * 1024;
        let admin_api_key = env_optional_string("FLOATCORE_ADMIN_API_KEY");

        let query_row_limit = env_u64("FLOATCORE_QUERY_ROW_LIMIT", 10_000).clamp(1, 100_000) as i64;
        let query_max_row_limit =
            env_u64("FLOATCORE_QUERY_MAX_ROW_LIMIT", 100_000).clamp(1, 1_000_000) as i64;
        let query_timeout_ms = env_u64("FLOATCORE_QUERY_TIMEOUT_MS", 30_000).clamp(100, 600_000);
        let confirm_row_threshold =
            env_u64("FLOATCORE_CONFIRM_ROW_THRESHOLD", 50_000).max(1) as i64;

        let context_max_turns = env_u64("FLOATCORE_CONTEXT_MAX_TURNS", 10).clamp(1, 100) as usize;
        let context_recent_turns =
            env_u64("FLOATCORE_CONTEXT_RECENT_TURNS", 3).clamp(1, 20) as usize;
        let context_ttl_seconds = env_u64("FLOATCORE_CONTEXT_TTL_SECONDS", 3600).max(60);

        let ingest_max_concurrent_jobs =
            env_u64("FLOATCORE_INGEST_MAX_CONCURRENT_JOBS", 2).clamp(1, 16) as usize;
        let ingest_poll_interval_ms =
            env_u64("FLOATCORE_INGEST_POLL_INTERVAL_MS", 500).clamp(50, 10_000);
        let ingest_max_retries = env_u64("FLOATCORE_INGEST_MAX_RETRIES", 3).clamp(0, 10) as u32;
        let ingest_stale_after_seconds =
            env_u64("FLOATCORE_INGEST_STALE_AFTER_SECONDS", 3600).max(60);
        let ingest_sweep_interval_seconds =
            env_u64("FLOATCORE_INGEST_SWEEP_INTERVAL_SECONDS", 300).max(10);
        let measurement_batch_size =
            env_u64("FLOATCORE_MEASUREMENT_BATCH_SIZE", 1000).clamp(50, 10_000) as usize;

        let defaults = OutlierBounds::default();
        let outlier_bounds = OutlierBounds {
            temperature: env_bounds("FLOATCORE_OUTLIER_TEMPERATURE", defaults.temperature),
            salinity: env_bounds("FLOATCORE_OUTLIER_SALINITY", defaults.salinity),
            pressure: env_bounds("FLOATCORE_OUTLIER_PRESSURE", defaults.pressure),
            dissolved_oxygen: env_bounds("FLOATCORE_OUTLIER_DOXY", defaults.dissolved_oxygen),
            chlorophyll: env_bounds("FLOATCORE_OUTLIER_CHLA", defaults.chlorophyll),
            nitrate: env_bounds("FLOATCORE_OUTLIER_NITRATE", defaults.nitrate),
            ph: env_bounds("FLOATCORE_OUTLIER_PH", defaults.ph),
        };

        Ok(Self {
            database_url,
            read_database_url,
            direct_database_url,
            s3_endpoint,
            s3_bucket,
            s3_access_key,
            s3_secret_key,
            s3_region,
            s3_allow_http,
            redis_url,
            llm_provider,
            llm_base_url,
            llm_api_key,
            llm_model,
            llm_timeout_seconds,
            embedding_base_url,
            embedding_api_key,
            embedding_model,
            embedding_dimension,
            max_upload_bytes,
            admin_api_key,
            query_row_limit,
            query_max_row_limit,
            query_timeout_ms,
            confirm_row_threshold,
            context_max_turns,
            context_recent_turns,
            context_ttl_seconds,
            ingest_max_concurrent_jobs,
            ingest_poll_interval_ms,
            ingest_max_retries,
            ingest_stale_after_seconds,
            ingest_sweep_interval_seconds,
            measurement_batch_size,
            outlier_bounds,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Bounds overrides use a "lower,upper" pair, e.g. `FLOATCORE_OUTLIER_PH=6.5,9`.
/// Malformed or inverted pairs fall back to the default.
fn env_bounds(key: &str, default: (f64, f64)) -> (f64, f64) {
    let Some(raw) = env_optional_string(key) else {
        return default;
    };
    let mut parts = raw.splitn(2, ',');
    let lower = parts.next().and_then(|v| v.trim().parse::<f64>().ok());
    let upper = parts.next().and_then(|v| v.trim().parse::<f64>().ok());
    match (lower, upper) {
        (Some(lo), Some(hi)) if lo < hi => (lo, hi),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring malformed outlier bounds override");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bounds_match_qc_table() {
        let bounds = OutlierBounds::default();
        assert_eq!(bounds.temperature, (-2.5, 40.0));
        assert_eq!(bounds.salinity, (0.0, 42.0));
        assert_eq!(bounds.pressure, (0.0, 12_000.0));
        assert_eq!(bounds.ph, (7.0, 8.5));
    }

    #[test]
    fn malformed_bounds_fall_back() {
        assert_eq!(env_bounds("FLOATCORE_TEST_UNSET_BOUNDS", (1.0, 2.0)), (1.0, 2.0));
    }
}
