use kasho_model::ColumnValue;

use crate::{split_timestamp, Dialect, SequenceTarget};

#[derive(Debug, Default, Clone, Copy)]
pub struct MySql;

impl Dialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn driver_name(&self) -> &'static str {
        "mysql_async"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn format_value(&self, value: &ColumnValue) -> String {
        match value {
            ColumnValue::Null => "NULL".to_string(),
            ColumnValue::String(s) => format!("'{}'", escape_mysql_string(s)),
            ColumnValue::Int64(i) => i.to_string(),
            ColumnValue::Float64(f) => format!("{f:.6}"),
            ColumnValue::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
            ColumnValue::Timestamp(raw) => match split_timestamp(raw) {
                Some((date, Some(time))) => format!("'{date} {time}'"),
                Some((date, None)) => format!("'{date}'"),
                None => format!("'{}'", escape_mysql_string(raw)),
            },
        }
    }

    fn setup_connection(&self) -> &'static str {
        "SET FOREIGN_KEY_CHECKS = 0;"
    }

    fn user_tables_query(&self) -> &'static str {
        "SELECT table_schema, table_name FROM information_schema.tables \
         WHERE table_schema NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys')"
    }

    fn sequence_discovery_query(&self) -> &'static str {
        "SELECT table_schema, table_name, column_name FROM information_schema.columns \
         WHERE extra = 'auto_increment'"
    }

    fn sync_sequence_statement(&self, target: &SequenceTarget, max_value: i64) -> String {
        format!(
            "ALTER TABLE {} AUTO_INCREMENT = {};",
            target.table,
            max_value + 1
        )
    }
}

/// MySQL string literals need both `'` and `\` escaped, unlike PostgreSQL.
fn escape_mysql_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasho_model::{DmlChange, DmlKind, KeyValues};

    #[test]
    fn renders_update_per_spec_scenario_two() {
        let dialect = MySql;
        let change = DmlChange {
            table: "testdb.users".to_string(),
            kind: DmlKind::Update,
            column_names: vec!["name".to_string()],
            column_values: vec![ColumnValue::String("Jane".to_string())],
            old_keys: Some(KeyValues {
                key_names: vec!["id".to_string()],
                key_values: vec![ColumnValue::Int64(1)],
            }),
        };
        let sql = dialect.render_dml(&change).unwrap();
        assert_eq!(sql, "UPDATE testdb.users SET name = 'Jane' WHERE id = 1;");
    }

    #[test]
    fn booleans_render_as_integers() {
        let dialect = MySql;
        assert_eq!(dialect.format_value(&ColumnValue::Bool(true)), "1");
        assert_eq!(dialect.format_value(&ColumnValue::Bool(false)), "0");
    }

    #[test]
    fn string_escaping_doubles_quotes_and_backslashes() {
        let dialect = MySql;
        let value = ColumnValue::String("back\\slash'quote".to_string());
        assert_eq!(dialect.format_value(&value), "'back\\\\slash''quote'");
    }

    #[test]
    fn floats_render_with_six_fractional_digits() {
        let dialect = MySql;
        assert_eq!(dialect.format_value(&ColumnValue::Float64(1.5)), "1.500000");
        assert_eq!(dialect.format_value(&ColumnValue::Float64(1.0)), "1.000000");
    }

    #[test]
    fn delete_requires_old_keys() {
        let dialect = MySql;
        let change = DmlChange {
            table: "testdb.users".to_string(),
            kind: DmlKind::Delete,
            column_names: vec![],
            column_values: vec![],
            old_keys: None,
        };
        assert!(dialect.render_dml(&change).is_err());
    }
}
