use kasho_model::ColumnValue;

use crate::{split_timestamp, Dialect, SequenceTarget};

#[derive(Debug, Default, Clone, Copy)]
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn driver_name(&self) -> &'static str {
        "tokio-postgres"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn format_value(&self, value: &ColumnValue) -> String {
        match value {
            ColumnValue::Null => "NULL".to_string(),
            ColumnValue::String(s) => format!("'{}'", s.replace('\'', "''")),
            ColumnValue::Int64(i) => i.to_string(),
            ColumnValue::Float64(f) => format!("{f:.6}"),
            ColumnValue::Bool(b) => if *b { "true".to_string() } else { "false".to_string() },
            ColumnValue::Timestamp(raw) => match split_timestamp(raw) {
                Some((date, Some(time))) => format!("'{date} {time}'"),
                Some((date, None)) => format!("'{date}'"),
                None => format!("'{}'", raw.replace('\'', "''")),
            },
        }
    }

    fn setup_connection(&self) -> &'static str {
        "SET session_replication_role = 'replica';"
    }

    fn user_tables_query(&self) -> &'static str {
        "SELECT table_schema, table_name FROM information_schema.tables \
         WHERE table_schema NOT IN ('pg_catalog', 'information_schema')"
    }

    fn sequence_discovery_query(&self) -> &'static str {
        "SELECT nsp.nspname AS table_schema, dep_tab.relname AS table_name, \
         attr.attname AS column_name, seq.relname AS sequence_name \
         FROM pg_depend dep \
         JOIN pg_class seq ON seq.oid = dep.objid AND seq.relkind = 'S' \
         JOIN pg_class dep_tab ON dep_tab.oid = dep.refobjid \
         JOIN pg_namespace nsp ON nsp.oid = dep_tab.relnamespace \
         JOIN pg_attribute attr ON attr.attrelid = dep_tab.oid AND attr.attnum = dep.refobjsubid"
    }

    fn sync_sequence_statement(&self, target: &SequenceTarget, max_value: i64) -> String {
        let sequence = target
            .sequence
            .as_deref()
            .unwrap_or_else(|| panic!("postgres sequence target missing sequence name: {target:?}"));
        format!("SELECT setval('{sequence}', {max_value}, true);")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasho_model::{DmlChange, DmlKind, KeyValues};

    #[test]
    fn renders_insert_per_spec_scenario_one() {
        let dialect = Postgres;
        let change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["id".to_string(), "name".to_string()],
            column_values: vec![ColumnValue::Int64(1), ColumnValue::String("O'Brien".to_string())],
            old_keys: None,
        };
        let sql = dialect.render_dml(&change).unwrap();
        assert_eq!(sql, "INSERT INTO public.users (id, name) VALUES (1, 'O''Brien');");
    }

    #[test]
    fn renders_update_with_key_predicate() {
        let dialect = Postgres;
        let change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Update,
            column_names: vec!["name".to_string()],
            column_values: vec![ColumnValue::String("Jane".to_string())],
            old_keys: Some(KeyValues {
                key_names: vec!["id".to_string()],
                key_values: vec![ColumnValue::Int64(1)],
            }),
        };
        let sql = dialect.render_dml(&change).unwrap();
        assert_eq!(sql, "UPDATE public.users SET name = 'Jane' WHERE id = 1;");
    }

    #[test]
    fn update_without_old_keys_is_rejected() {
        let dialect = Postgres;
        let change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Update,
            column_names: vec!["name".to_string()],
            column_values: vec![ColumnValue::String("Jane".to_string())],
            old_keys: None,
        };
        assert!(dialect.render_dml(&change).is_err());
    }

    #[test]
    fn quote_identifier_doubles_embedded_quotes() {
        let dialect = Postgres;
        assert_eq!(dialect.quote_identifier("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn floats_render_with_six_fractional_digits() {
        let dialect = Postgres;
        assert_eq!(dialect.format_value(&ColumnValue::Float64(1.5)), "1.500000");
        assert_eq!(dialect.format_value(&ColumnValue::Float64(1.0)), "1.000000");
    }
}
