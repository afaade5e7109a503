//! The replica-side half of the apply loop: owns the connection, the
//! `kasho_apply_cursor` progress table, and statement execution, for both
//! supported engines behind one enum (mirrors `kasho_capture::Capture`'s
//! two-variant split, but as a concrete enum rather than a trait object —
//! `mysql_async::Pool`/`tokio_postgres::Client` have different enough
//! connection lifetimes that a shared trait would mostly be boilerplate).

use kasho_dialect::{Dialect, MySql, Postgres, SequenceTarget};
use mysql_async::prelude::Queryable;
use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::error::ApplyError;

const CURSOR_ROW_ID: i32 = 1;

pub enum Replica {
    Postgres { client: tokio_postgres::Client, dialect: Postgres },
    MySql { pool: mysql_async::Pool, dialect: MySql },
}

impl Replica {
    pub async fn connect(dialect_name: &str, database_url: &str) -> Result<Self, ApplyError> {
        match dialect_name {
            "postgres" | "pg" | "postgresql" => {
                let (client, connection) = tokio_postgres::connect(database_url, NoTls)
                    .await
                    .map_err(|err| ApplyError::Sql { table: "<connect>".to_string(), source: Box::new(err) })?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        warn!(error = %err, "postgres replica connection closed with error");
                    }
                });
                Ok(Replica::Postgres { client, dialect: Postgres })
            }
            "mysql" => {
                let pool = mysql_async::Pool::new(database_url);
                Ok(Replica::MySql { pool, dialect: MySql })
            }
            other => Err(ApplyError::UnsupportedDialect(other.to_string())),
        }
    }

    pub fn dialect(&self) -> &dyn Dialect {
        match self {
            Replica::Postgres { dialect, .. } => dialect,
            Replica::MySql { dialect, .. } => dialect,
        }
    }

    pub async fn setup_connection(&self) -> Result<(), ApplyError> {
        self.execute(self.dialect().setup_connection()).await
    }

    pub async fn ensure_cursor_table(&self) -> Result<(), ApplyError> {
        match self {
            Replica::Postgres { client, .. } => {
                client
                    .batch_execute(
                        "CREATE TABLE IF NOT EXISTS kasho_apply_cursor ( \
                            id int PRIMARY KEY, \
                            position text NOT NULL, \
                            updated_at timestamptz NOT NULL DEFAULT now() \
                        );",
                    )
                    .await
                    .map_err(|err| sql_error("kasho_apply_cursor", err))?;
            }
            Replica::MySql { pool, .. } => {
                let mut conn = pool.get_conn().await.map_err(|err| sql_error("kasho_apply_cursor", err))?;
                conn.query_drop(
                    "CREATE TABLE IF NOT EXISTS kasho_apply_cursor ( \
                        id int PRIMARY KEY, \
                        position text NOT NULL, \
                        updated_at timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP \
                            ON UPDATE CURRENT_TIMESTAMP \
                    );",
                )
                .await
                .map_err(|err| sql_error("kasho_apply_cursor", err))?;
            }
        }
        Ok(())
    }

    /// The last-applied position, or `None` if the cursor has never been
    /// written (fresh replica, apply from the beginning).
    pub async fn read_cursor(&self) -> Result<Option<String>, ApplyError> {
        match self {
            Replica::Postgres { client, .. } => {
                let row = client
                    .query_opt(
                        "SELECT position FROM kasho_apply_cursor WHERE id = $1",
                        &[&CURSOR_ROW_ID],
                    )
                    .await
                    .map_err(|err| sql_error("kasho_apply_cursor", err))?;
                Ok(row.map(|row| row.get::<_, String>(0)))
            }
            Replica::MySql { pool, .. } => {
                let mut conn = pool.get_conn().await.map_err(|err| sql_error("kasho_apply_cursor", err))?;
                let position: Option<String> = conn
                    .exec_first(
                        "SELECT position FROM kasho_apply_cursor WHERE id = ?",
                        (CURSOR_ROW_ID,),
                    )
                    .await
                    .map_err(|err| sql_error("kasho_apply_cursor", err))?;
                Ok(position)
            }
        }
    }

    pub async fn write_cursor(&self, position: &str) -> Result<(), ApplyError> {
        match self {
            Replica::Postgres { client, .. } => {
                client
                    .execute(
                        "INSERT INTO kasho_apply_cursor (id, position, updated_at) VALUES ($1, $2, now()) \
                         ON CONFLICT (id) DO UPDATE SET position = excluded.position, updated_at = now()",
                        &[&CURSOR_ROW_ID, &position],
                    )
                    .await
                    .map_err(|err| sql_error("kasho_apply_cursor", err))?;
            }
            Replica::MySql { pool, .. } => {
                let mut conn = pool.get_conn().await.map_err(|err| sql_error("kasho_apply_cursor", err))?;
                conn.exec_drop(
                    "INSERT INTO kasho_apply_cursor (id, position) VALUES (?, ?) \
                     ON DUPLICATE KEY UPDATE position = VALUES(position)",
                    (CURSOR_ROW_ID, position),
                )
                .await
                .map_err(|err| sql_error("kasho_apply_cursor", err))?;
            }
        }
        Ok(())
    }

    pub async fn execute(&self, sql: &str) -> Result<(), ApplyError> {
        match self {
            Replica::Postgres { client, .. } => {
                client
                    .batch_execute(sql)
                    .await
                    .map_err(|err| sql_error(sql, err))?;
            }
            Replica::MySql { pool, .. } => {
                let mut conn = pool.get_conn().await.map_err(|err| sql_error(sql, err))?;
                conn.query_drop(sql).await.map_err(|err| sql_error(sql, err))?;
            }
        }
        Ok(())
    }

    /// Discovers sequence/auto-increment columns and resyncs each to the
    /// max value currently present on the replica. Run once at startup,
    /// covering the case where a bulk bootstrap load wrote rows directly
    /// and left the replica's sequences/auto-increments behind.
    pub async fn resync_sequences(&self) -> Result<(), ApplyError> {
        let targets = self.discover_sequence_targets().await?;
        for target in targets {
            let Some(max_value) = self.max_column_value(&target).await? else {
                continue;
            };
            let statement = self.dialect().sync_sequence_statement(&target, max_value);
            self.execute(&statement).await?;
            info!(table = %target.table, column = %target.column, max_value, "resynced sequence");
        }
        Ok(())
    }

    async fn discover_sequence_targets(&self) -> Result<Vec<SequenceTarget>, ApplyError> {
        let query = self.dialect().sequence_discovery_query();
        match self {
            Replica::Postgres { client, .. } => {
                let rows = client.query(query, &[]).await.map_err(|err| sql_error(query, err))?;
                Ok(rows
                    .iter()
                    .map(|row| SequenceTarget {
                        table: format!("{}.{}", row.get::<_, String>(0), row.get::<_, String>(1)),
                        column: row.get::<_, String>(2),
                        sequence: Some(row.get::<_, String>(3)),
                    })
                    .collect())
            }
            Replica::MySql { pool, .. } => {
                let mut conn = pool.get_conn().await.map_err(|err| sql_error(query, err))?;
                let rows: Vec<(String, String, String)> =
                    conn.query(query).await.map_err(|err| sql_error(query, err))?;
                Ok(rows
                    .into_iter()
                    .map(|(schema, table, column)| SequenceTarget {
                        table: format!("{schema}.{table}"),
                        column,
                        sequence: None,
                    })
                    .collect())
            }
        }
    }

    async fn max_column_value(&self, target: &SequenceTarget) -> Result<Option<i64>, ApplyError> {
        let quoted_column = self.dialect().quote_identifier(&target.column);
        let query = format!("SELECT MAX({}) FROM {}", quoted_column, target.table);
        match self {
            Replica::Postgres { client, .. } => {
                let row = client.query_one(&query, &[]).await.map_err(|err| sql_error(&query, err))?;
                Ok(row.get::<_, Option<i64>>(0))
            }
            Replica::MySql { pool, .. } => {
                let mut conn = pool.get_conn().await.map_err(|err| sql_error(&query, err))?;
                let value: Option<Option<i64>> =
                    conn.query_first(&query).await.map_err(|err| sql_error(&query, err))?;
                Ok(value.flatten())
            }
        }
    }
}

fn sql_error(table: &str, source: impl std::error::Error + Send + Sync + 'static) -> ApplyError {
    ApplyError::Sql { table: table.to_string(), source: Box::new(source) }
}
