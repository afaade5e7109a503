//! Renders `kasho_model::Change` values into dialect-correct SQL, and
//! exposes the per-dialect session setup / sequence-resync primitives the
//! apply loop needs.

mod error;
mod mysql;
mod postgres;

pub use error::DialectError;
pub use mysql::MySql;
pub use postgres::Postgres;

use kasho_model::{ColumnValue, DdlChange, DmlChange, DmlKind};

/// A sequence or auto-increment column discovered on the replica, whose
/// value must be resynced after a bulk load. Discovery (querying
/// `pg_depend` / `information_schema`) is the apply loop's job; the
/// dialect only knows how to render the resync statement once the target
/// is known.
#[derive(Debug, Clone)]
pub struct SequenceTarget {
    pub table: String,
    pub column: String,
    /// The PG sequence name backing this column, if any (MySQL has none —
    /// `AUTO_INCREMENT` is a table property).
    pub sequence: Option<String>,
}

pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;
    fn driver_name(&self) -> &'static str;

    /// Wraps `ident` in this dialect's quoting, doubling any embedded quote
    /// character. Used by sequence discovery/resync and other
    /// schema-introspection call sites that assemble identifiers from
    /// discovered names — not by `render_dml`, whose column/table names
    /// come straight off the wire and are rendered verbatim (matching the
    /// plain `INSERT INTO public.users (id, name) VALUES (...)` shape the
    /// rest of this pipeline expects).
    fn quote_identifier(&self, ident: &str) -> String;

    fn format_value(&self, value: &ColumnValue) -> String;

    /// Statement(s) to run once per replica connection before applying
    /// changes (suppress triggers/FKs so replayed writes don't cascade).
    fn setup_connection(&self) -> &'static str;

    /// Query returning every user table's qualified name, for discovery
    /// at startup.
    fn user_tables_query(&self) -> &'static str;

    /// Query the apply loop runs to discover sequence/auto-increment
    /// targets needing resync after bootstrap.
    fn sequence_discovery_query(&self) -> &'static str;

    /// The statement that resyncs one sequence/auto-increment column to
    /// `max_value`.
    fn sync_sequence_statement(&self, target: &SequenceTarget, max_value: i64) -> String;

    fn render_ddl(&self, change: &DdlChange) -> String {
        change.ddl.clone()
    }

    fn render_dml(&self, change: &DmlChange) -> Result<String, DialectError> {
        change.validate()?;
        match change.kind {
            DmlKind::Insert => Ok(self.render_insert(change)),
            DmlKind::Update => self.render_update(change),
            DmlKind::Delete => self.render_delete(change),
        }
    }

    fn render_insert(&self, change: &DmlChange) -> String {
        let cols = change.column_names.join(", ");
        let vals = change
            .column_values
            .iter()
            .map(|v| self.format_value(v))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} ({}) VALUES ({});", change.table, cols, vals)
    }

    fn render_update(&self, change: &DmlChange) -> Result<String, DialectError> {
        let keys = change.old_keys.as_ref().ok_or_else(|| {
            DialectError::InvalidDml(format!("update on {} requires old_keys", change.table))
        })?;
        let assignments = change
            .column_names
            .iter()
            .zip(&change.column_values)
            .map(|(name, value)| format!("{} = {}", name, self.format_value(value)))
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = keys
            .key_names
            .iter()
            .zip(&keys.key_values)
            .map(|(name, value)| format!("{} = {}", name, self.format_value(value)))
            .collect::<Vec<_>>()
            .join(" AND ");
        Ok(format!(
            "UPDATE {} SET {} WHERE {};",
            change.table, assignments, predicate
        ))
    }

    fn render_delete(&self, change: &DmlChange) -> Result<String, DialectError> {
        let keys = change.old_keys.as_ref().ok_or_else(|| {
            DialectError::InvalidDml(format!("delete on {} requires old_keys", change.table))
        })?;
        let predicate = keys
            .key_names
            .iter()
            .zip(&keys.key_values)
            .map(|(name, value)| format!("{} = {}", name, self.format_value(value)))
            .collect::<Vec<_>>()
            .join(" AND ");
        Ok(format!("DELETE FROM {} WHERE {};", change.table, predicate))
    }
}

/// Parses a timestamp column value (either `YYYY-MM-DD` or RFC3339) into a
/// `(date, time)` pair so dialects can render the shape they want and drop
/// the timezone, per spec §4.9.
pub(crate) fn split_timestamp(raw: &str) -> Option<(String, Option<String>)> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        let date = dt.format("%Y-%m-%d").to_string();
        let time = dt.format("%H:%M:%S").to_string();
        return Some((date, Some(time)));
    }
    if chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() {
        return Some((raw.to_string(), None));
    }
    None
}
