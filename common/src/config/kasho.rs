//! Process-level configuration structs shared by `kasho-capture-server` and
//! `kasho-apply`. Each binary's own `clap::Parser` args are the source of
//! truth (env-var fallback per field); these structs are just the shape
//! passed down into the crates that need them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryConfig {
    pub database_url: String,
    /// `"postgres"` or `"mysql"`.
    pub dialect: String,
    pub slot_name: Option<String>,
    pub publication_name: Option<String>,
    pub server_id: Option<u32>,
    pub include_table_regex: Option<String>,
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            dialect: "postgres".to_string(),
            slot_name: None,
            publication_name: None,
            server_id: None,
            include_table_regex: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub database_url: String,
    /// `"postgres"` or `"mysql"`.
    pub dialect: String,
    pub stop_on_error: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            dialect: "postgres".to_string(),
            stop_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub url: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcConfig {
    pub port: u16,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self { port: 50051 }
    }
}
