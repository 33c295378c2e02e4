use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreKind {
    /// Everything lives in process memory and is lost on restart.
    Memory,
    /// Tables in DynamoDB, configured from the standard AWS environment.
    Dynamodb,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "runboard")]
#[command(about = "Runs API collections and tracks their health")]
pub struct Config {
    /// Address the HTTP server listens on
    #[arg(long, env = "RUNBOARD_BIND", default_value = "0.0.0.0:4000")]
    pub bind: String,

    /// Directory holding uploaded documents and run reports
    #[arg(long, env = "UPLOAD_DIR", default_value = "./uploads")]
    pub upload_dir: PathBuf,

    #[arg(long, env = "RUNBOARD_STORE", value_enum, default_value_t = StoreKind::Memory)]
    pub store: StoreKind,

    /// Runs whose p95 latency exceeds this are reported as degraded
    #[arg(long, env = "RUNBOARD_P95_SLA_MS")]
    pub p95_sla_ms: Option<u64>,

    #[arg(long, env = "MAX_UPLOAD_MB", default_value_t = 10)]
    pub max_upload_mb: usize,
}
