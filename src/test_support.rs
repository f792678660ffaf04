use std::sync::Arc;

use crate::config::CoreConfig;
use crate::db;
use crate::services::index::embeddings::EmbeddingClient;
use crate::services::index::IndexerService;
use crate::services::nl::context::ContextStore;
use crate::services::nl::executor::QueryExecutor;
use crate::services::nl::llm::LlmRegistry;
use crate::services::nl::NlPipeline;
use crate::services::object_store::{ObjectStorage, ObjectStorageConfig};
use crate::state::AppState;

pub fn test_config() -> CoreConfig {
    CoreConfig {
        database_url: "postgresql://floatcore@localhost/floatcore".to_string(),
        read_database_url: "postgresql://floatcore_ro@localhost/floatcore".to_string(),
        direct_database_url: "postgresql://floatcore@localhost/floatcore".to_string(),
        s3_endpoint: "http://127.0.0.1:9000".to_string(),
        s3_bucket: "argo-raw".to_string(),
        s3_access_key: "minioadmin".to_string(),
        s3_secret_key: "minioadmin".to_string(),
        s3_region: "us-east-1".to_string(),
        s3_allow_http: true,
        redis_url: None,
        llm_provider: "openai".to_string(),
        llm_base_url: "http://127.0.0.1:4010/v1".to_string(),
        llm_api_key: None,
        llm_model: "test-model".to_string(),
        llm_timeout_seconds: 30,
        embedding_base_url: "http://127.0.0.1:4010/v1".to_string(),
        embedding_api_key: None,
        embedding_model: "test-embedding".to_string(),
        embedding_dimension: 8,
        max_upload_bytes: 8 * 1024 * 1024,
        admin_api_key: Some("test-admin-key".to_string()),
        query_row_limit: 10_000,
        query_max_row_limit: 100_000,
        query_timeout_ms: 30_000,
        confirm_row_threshold: 50_000,
        context_max_turns: 10,
        context_recent_turns: 3,
        context_ttl_seconds: 3600,
        ingest_max_concurrent_jobs: 1,
        ingest_poll_interval_ms: 250,
        ingest_max_retries: 3,
        ingest_stale_after_seconds: 3600,
        ingest_sweep_interval_seconds: 300,
        measurement_batch_size: 1000,
        outlier_bounds: Default::default(),
    }
}

/// App state over lazy pools and a disabled context store; nothing here
/// touches the network until a test actually drives it.
pub async fn test_state() -> AppState {
    let config = test_config();
    let pool = db::connect_lazy(&config.database_url).expect("connect_lazy");
    let read_pool = db::connect_lazy_read_only(&config.read_database_url).expect("read pool");
    let http = reqwest::Client::new();

    let storage = Arc::new(
        ObjectStorage::new(&ObjectStorageConfig::from_core(&config)).expect("object storage"),
    );
    let context = Arc::new(
        ContextStore::connect(
            None,
            config.context_max_turns,
            config.context_recent_turns,
            config.context_ttl_seconds,
        )
        .await,
    );
    let registry = Arc::new(LlmRegistry::from_config(&config, http.clone()));
    let pipeline = Arc::new(NlPipeline::new(registry, context.clone()));
    let executor = Arc::new(QueryExecutor::new(
        read_pool.clone(),
        config.query_row_limit,
        config.query_max_row_limit,
        config.query_timeout_ms,
    ));
    let embeddings = Arc::new(EmbeddingClient::from_config(&config, http.clone()));
    let indexer = Arc::new(IndexerService::new(pool.clone(), embeddings));

    AppState {
        config,
        db: pool,
        read_db: read_pool,
        storage,
        context,
        pipeline,
        executor,
        indexer,
        http,
    }
}

/// Builds classic CDF-1 files byte-for-byte, independently of the reader, so
/// parser tests exercise real on-disk structure.
pub mod netcdf_fixture {
    use byteorder::{BigEndian, ByteOrder};

    enum Data {
        Chars(Vec<u8>),
        Ints(Vec<i32>),
        Floats(Vec<f32>),
        Doubles(Vec<f64>),
    }

    impl Data {
        fn type_code(&self) -> u32 {
            match self {
                Data::Chars(_) => 2,
                Data::Ints(_) => 4,
                Data::Floats(_) => 5,
                Data::Doubles(_) => 6,
            }
        }

        fn byte_len(&self) -> usize {
            match self {
                Data::Chars(v) => v.len(),
                Data::Ints(v) => v.len() * 4,
                Data::Floats(v) => v.len() * 4,
                Data::Doubles(v) => v.len() * 8,
            }
        }

        fn write(&self, out: &mut Vec<u8>) {
            match self {
                Data::Chars(v) => out.extend_from_slice(v),
                Data::Ints(v) => {
                    for x in v {
                        let mut buf = [0u8; 4];
                        BigEndian::write_i32(&mut buf, *x);
                        out.extend_from_slice(&buf);
                    }
                }
                Data::Floats(v) => {
                    for x in v {
                        let mut buf = [0u8; 4];
                        BigEndian::write_f32(&mut buf, *x);
                        out.extend_from_slice(&buf);
                    }
                }
                Data::Doubles(v) => {
                    for x in v {
                        let mut buf = [0u8; 8];
                        BigEndian::write_f64(&mut buf, *x);
                        out.extend_from_slice(&buf);
                    }
                }
            }
        }
    }

    struct VarSpec {
        name: String,
        dims: Vec<String>,
        fill: Option<f64>,
        data: Data,
    }

    pub struct NetcdfBuilder {
        dims: Vec<(String, usize)>,
        global_attrs: Vec<(String, String)>,
        vars: Vec<VarSpec>,
    }

    impl Default for NetcdfBuilder {
        fn default() -> Self {
            Self::new()
        }
    }

    impl NetcdfBuilder {
        pub fn new() -> Self {
            Self {
                dims: Vec::new(),
                global_attrs: Vec::new(),
                vars: Vec::new(),
            }
        }

        pub fn dimension(mut self, name: &str, len: usize) -> Self {
            self.dims.push((name.to_string(), len));
            self
        }

        pub fn global_text_attr(mut self, name: &str, value: &str) -> Self {
            self.global_attrs.push((name.to_string(), value.to_string()));
            self
        }

        pub fn char_var(mut self, name: &str, dims: &[&str], data: &[u8]) -> Self {
            self.vars.push(VarSpec {
                name: name.to_string(),
                dims: dims.iter().map(|d| d.to_string()).collect(),
                fill: None,
                data: Data::Chars(data.to_vec()),
            });
            self
        }

        pub fn int_var(mut self, name: &str, dims: &[&str], data: &[i32]) -> Self {
            self.vars.push(VarSpec {
                name: name.to_string(),
                dims: dims.iter().map(|d| d.to_string()).collect(),
                fill: None,
                data: Data::Ints(data.to_vec()),
            });
            self
        }

        pub fn float_var(
            mut self,
            name: &str,
            dims: &[&str],
            fill: Option<f64>,
            data: &[f64],
        ) -> Self {
            self.vars.push(VarSpec {
                name: name.to_string(),
                dims: dims.iter().map(|d| d.to_string()).collect(),
                fill,
                data: Data::Floats(data.iter().map(|x| *x as f32).collect()),
            });
            self
        }

        pub fn double_var(
            mut self,
            name: &str,
            dims: &[&str],
            fill: Option<f64>,
            data: &[f64],
        ) -> Self {
            self.vars.push(VarSpec {
                name: name.to_string(),
                dims: dims.iter().map(|d| d.to_string()).collect(),
                fill,
                data: Data::Doubles(data.to_vec()),
            });
            self
        }

        pub fn build(self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(b"CDF\x01");
            write_u32(&mut out, 0); // numrecs

            // Dimension list.
            if self.dims.is_empty() {
                write_u32(&mut out, 0);
                write_u32(&mut out, 0);
            } else {
                write_u32(&mut out, 0x0A);
                write_u32(&mut out, self.dims.len() as u32);
                for (name, len) in &self.dims {
                    write_name(&mut out, name);
                    write_u32(&mut out, *len as u32);
                }
            }

            // Global attributes (text only; enough for fixtures).
            if self.global_attrs.is_empty() {
                write_u32(&mut out, 0);
                write_u32(&mut out, 0);
            } else {
                write_u32(&mut out, 0x0C);
                write_u32(&mut out, self.global_attrs.len() as u32);
                for (name, value) in &self.global_attrs {
                    write_name(&mut out, name);
                    write_u32(&mut out, 2); // char
                    write_u32(&mut out, value.len() as u32);
                    out.extend_from_slice(value.as_bytes());
                    pad(&mut out, value.len());
                }
            }

            // Variable list with begin offsets patched afterwards.
            let mut begin_positions = Vec::with_capacity(self.vars.len());
            if self.vars.is_empty() {
                write_u32(&mut out, 0);
                write_u32(&mut out, 0);
            } else {
                write_u32(&mut out, 0x0B);
                write_u32(&mut out, self.vars.len() as u32);
                for var in &self.vars {
                    write_name(&mut out, &var.name);
                    write_u32(&mut out, var.dims.len() as u32);
                    for dim in &var.dims {
                        let id = self
                            .dims
                            .iter()
                            .position(|(name, _)| name == dim)
                            .expect("fixture references unknown dimension");
                        write_u32(&mut out, id as u32);
                    }
                    match var.fill {
                        Some(fill) => {
                            write_u32(&mut out, 0x0C);
                            write_u32(&mut out, 1);
                            write_name(&mut out, "_FillValue");
                            write_u32(&mut out, var.data.type_code());
                            write_u32(&mut out, 1);
                            match var.data {
                                Data::Floats(_) => {
                                    let mut buf = [0u8; 4];
                                    BigEndian::write_f32(&mut buf, fill as f32);
                                    out.extend_from_slice(&buf);
                                }
                                Data::Doubles(_) => {
                                    let mut buf = [0u8; 8];
                                    BigEndian::write_f64(&mut buf, fill);
                                    out.extend_from_slice(&buf);
                                }
                                Data::Ints(_) => {
                                    let mut buf = [0u8; 4];
                                    BigEndian::write_i32(&mut buf, fill as i32);
                                    out.extend_from_slice(&buf);
                                }
                                Data::Chars(_) => panic!("char fixture vars take no fill"),
                            }
                        }
                        None => {
                            write_u32(&mut out, 0);
                            write_u32(&mut out, 0);
                        }
                    }
                    write_u32(&mut out, var.data.type_code());
                    write_u32(&mut out, pad4(var.data.byte_len()) as u32);
                    begin_positions.push(out.len());
                    write_u32(&mut out, 0); // begin placeholder
                }
            }

            // Data sections, each padded to a four-byte boundary.
            for (var, begin_pos) in self.vars.iter().zip(begin_positions) {
                let begin = out.len() as u32;
                BigEndian::write_u32(&mut out[begin_pos..begin_pos + 4], begin);
                let len_before = out.len();
                var.data.write(&mut out);
                let written = out.len() - len_before;
                pad(&mut out, written);
            }

            out
        }
    }

    fn write_u32(out: &mut Vec<u8>, value: u32) {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        out.extend_from_slice(&buf);
    }

    fn write_name(out: &mut Vec<u8>, name: &str) {
        write_u32(out, name.len() as u32);
        out.extend_from_slice(name.as_bytes());
        pad(out, name.len());
    }

    fn pad(out: &mut Vec<u8>, consumed: usize) {
        let rem = consumed % 4;
        if rem != 0 {
            out.extend(std::iter::repeat(0u8).take(4 - rem));
        }
    }

    fn pad4(n: usize) -> usize {
        (n + 3) & !3
    }
}
