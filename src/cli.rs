use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "floatcore",
    version,
    about = "ARGO float ingestion and natural-language query backend"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    /// Apply schema DDL on the direct database connection and exit.
    #[arg(long, default_value_t = false)]
    pub migrate_only: bool,
}
