mod error;
mod replica;

use std::path::PathBuf;

use clap::Parser;
use common::config::kasho::ReplicaConfig;
use common::log::tracing_factory::{OutputType, TracingFactory, TracingFactoryOptions};
use common::retry::Backoff;
use kasho_dialect::Dialect;
use kasho_model::{Change, Payload};
use kasho_proto::capture_service_client::CaptureServiceClient;
use kasho_proto::StreamRequest;
use kasho_transform::{Evaluator, TransformConfig, TransformErrorPolicy};
use tracing::{error, info, warn};

use crate::error::ApplyError;
use crate::replica::Replica;

#[derive(Parser, Debug, Clone)]
#[command(name = "kasho-apply")]
#[command(about = "Consumes captured changes, transforms them, and applies them to a replica database")]
struct CliArgs {
    #[arg(long, env = "REPLICA_DATABASE_URL")]
    replica_database_url: String,

    #[arg(long, env = "REPLICA_DIALECT", default_value = "postgres")]
    replica_dialect: String,

    #[arg(long, env = "CAPTURE_ADDR", default_value = "http://127.0.0.1:50051")]
    capture_addr: String,

    #[arg(long, env = "TRANSFORM_CONFIG_FILE")]
    transform_config_file: Option<PathBuf>,

    #[arg(long, env = "STOP_ON_ERROR", default_value_t = false)]
    stop_on_error: bool,

    /// Per-column transform failures normally abort the whole row (the
    /// change is skipped and the cursor still advances past it); set this
    /// to fall back to each failing column's original value instead.
    #[arg(long, env = "TRANSFORM_FALLBACK_ON_ERROR", default_value_t = false)]
    transform_fallback_on_error: bool,

    #[arg(short, long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();
    TracingFactory::init_log_with_options(TracingFactoryOptions::new(args.debug, OutputType::STDOUT, None));

    let replica_config = ReplicaConfig {
        database_url: args.replica_database_url.clone(),
        dialect: args.replica_dialect.clone(),
        stop_on_error: args.stop_on_error,
    };

    let transform_config = match &args.transform_config_file {
        Some(path) => TransformConfig::load(path)?,
        None => TransformConfig::parse("major_version: 1\ntables: {}\n")?,
    };

    info!(dialect = %replica_config.dialect, capture_addr = %args.capture_addr, "starting kasho-apply");

    let replica = Replica::connect(&replica_config.dialect, &replica_config.database_url).await?;
    replica.ensure_cursor_table().await?;
    replica.setup_connection().await?;
    replica.resync_sequences().await?;

    let mut last_position = replica.read_cursor().await?.unwrap_or_default();

    let transform_policy = if args.transform_fallback_on_error {
        TransformErrorPolicy::FallbackOriginal
    } else {
        TransformErrorPolicy::AbortRow
    };

    let mut client = CaptureServiceClient::connect(args.capture_addr.clone()).await?;
    let evaluator = Evaluator::new();
    let mut backoff = Backoff::capped_30s();

    loop {
        // Always resume from the most recently applied position, not the
        // one read at startup — a mid-stream reconnect must not replay
        // changes already committed to the replica.
        let request = StreamRequest { last_position: last_position.clone() };
        let response = match client.stream(request).await {
            Ok(response) => {
                backoff.reset();
                response
            }
            Err(status) => {
                let delay = backoff.next();
                warn!(error = %status, delay_ms = delay.as_millis() as u64, "stream RPC failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let mut stream = response.into_inner();
        loop {
            match stream.message().await {
                Ok(Some(envelope)) => {
                    match apply_one(&replica, &evaluator, &transform_config, transform_policy, &envelope.change_json)
                        .await
                    {
                        Ok(position) => last_position = position,
                        Err(err) => {
                            error!(error = %err, "failed to apply change");
                            if replica_config.stop_on_error || !err.is_recoverable() {
                                return Err(Box::new(err));
                            }
                        }
                    }
                }
                Ok(None) => {
                    warn!("capture stream ended, reconnecting");
                    break;
                }
                Err(status) => {
                    warn!(error = %status, "capture stream errored, reconnecting");
                    break;
                }
            }
        }

        let delay = backoff.next();
        tokio::time::sleep(delay).await;
    }
}

/// Applies one envelope and returns its position on success — including
/// when a row is skipped under `TransformErrorPolicy::AbortRow`, since
/// that still counts as "handled" and must not be replayed forever.
async fn apply_one(
    replica: &Replica,
    evaluator: &Evaluator,
    transform_config: &TransformConfig,
    transform_policy: TransformErrorPolicy,
    change_json: &[u8],
) -> Result<String, ApplyError> {
    let change = Change::decode(change_json)?;

    let sql = match change.payload {
        Payload::Dml(mut dml) => {
            match evaluator.apply_with_policy(transform_config, &mut dml, transform_policy) {
                Ok(()) => Some(replica.dialect().render_dml(&dml)?),
                Err(err) if matches!(transform_policy, TransformErrorPolicy::AbortRow) => {
                    warn!(error = %err, table = %dml.table, position = %change.position, "aborting row, skipping");
                    None
                }
                Err(err) => return Err(err.into()),
            }
        }
        Payload::Ddl(ddl) => Some(replica.dialect().render_ddl(&ddl)),
    };

    if let Some(sql) = sql {
        replica.execute(&sql).await?;
    }
    replica.write_cursor(&change.position).await?;
    Ok(change.position)
}
