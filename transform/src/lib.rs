//! Applies configured column transforms to captured rows before they reach
//! the dialect/apply stage, so a replica can run with fakes or redacted
//! values in place of real customer data.
//!
//! Evaluation runs in two passes per row. Pass one resolves every
//! self-contained transform (fakers, the boolean flip, regex substitution)
//! from the row's original values. Pass two resolves templates and
//! password hashes, which may read *other* columns' pass-one output — a
//! `display_name` template referencing an already-faked `first_name`, say.
//! Splitting the passes means column order in the config never matters.

mod config;
mod error;
mod faker;
mod password;
mod regex_cache;
mod template;

pub use config::{PasswordTransform, ResolvedTransform, TransformConfig, SUPPORTED_MAJOR_VERSION};
pub use error::TransformError;
pub use faker::FakerKind;

use std::collections::HashMap;

use handlebars::Handlebars;
use kasho_model::{ColumnValue, DmlChange};
use tracing::warn;

/// How a per-column transform failure affects the rest of the row, per
/// spec §7. `AbortRow` (the default) discards the whole row's transforms
/// and surfaces the error to the caller, which skips applying the change
/// entirely; `FallbackOriginal` logs the failing column and keeps its
/// untransformed value, letting the rest of the row's transforms proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformErrorPolicy {
    #[default]
    AbortRow,
    FallbackOriginal,
}

/// Holds the compiled Handlebars registry (helper functions only — templates
/// are compiled per-invocation since they're cheap and row-dependent).
/// Reuse one `Evaluator` across a capture session rather than constructing
/// it per row.
pub struct Evaluator {
    handlebars: Handlebars<'static>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self { handlebars: template::registry() }
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transforms `change`'s columns in place according to `config`'s entry
    /// for `change.table`. Tables absent from the config pass through
    /// unmodified. `old_keys` (the pre-image used to locate the row on the
    /// replica) is never transformed, even if a transformed column happens
    /// to be a key column — the replica's row must still be addressable by
    /// its real primary key.
    pub fn apply(&self, config: &TransformConfig, change: &mut DmlChange) -> Result<(), TransformError> {
        self.apply_with_policy(config, change, TransformErrorPolicy::AbortRow)
    }

    /// Same as [`Evaluator::apply`], but lets the caller choose what
    /// happens when an individual column's transform fails instead of
    /// always aborting the row. `AbortRow` leaves `change` untouched and
    /// returns the first error (wrapped with table/column context);
    /// `FallbackOriginal` logs the error and keeps scanning, leaving that
    /// column's original value in place.
    pub fn apply_with_policy(
        &self,
        config: &TransformConfig,
        change: &mut DmlChange,
        policy: TransformErrorPolicy,
    ) -> Result<(), TransformError> {
        let Some(transforms) = config.for_table(&change.table) else {
            return Ok(());
        };

        let originals = change.column_values.clone();
        let mut working = originals.clone();

        for (i, name) in change.column_names.iter().enumerate() {
            if let Some(transform) = transforms.get(name) {
                if !transform.needs_row_context() {
                    match evaluate_pass_one(transform, &originals[i]) {
                        Ok(value) => working[i] = value,
                        Err(err) => match policy {
                            TransformErrorPolicy::AbortRow => {
                                return Err(column_error(&change.table, name, err));
                            }
                            TransformErrorPolicy::FallbackOriginal => {
                                warn!(table = %change.table, column = %name, error = %err, "falling back to original value");
                            }
                        },
                    }
                }
            }
        }

        let mut row: HashMap<String, ColumnValue> = change
            .column_names
            .iter()
            .cloned()
            .zip(working.iter().cloned())
            .collect();

        for (i, name) in change.column_names.iter().enumerate() {
            if let Some(transform) = transforms.get(name) {
                if transform.needs_row_context() {
                    match self.evaluate_pass_two(transform, &originals[i], &row) {
                        Ok(new_value) => {
                            working[i] = new_value.clone();
                            row.insert(name.clone(), new_value);
                        }
                        Err(err) => match policy {
                            TransformErrorPolicy::AbortRow => {
                                return Err(column_error(&change.table, name, err));
                            }
                            TransformErrorPolicy::FallbackOriginal => {
                                warn!(table = %change.table, column = %name, error = %err, "falling back to original value");
                            }
                        },
                    }
                }
            }
        }

        change.column_values = working;
        Ok(())
    }

    fn evaluate_pass_two(
        &self,
        transform: &ResolvedTransform,
        original: &ColumnValue,
        row: &HashMap<String, ColumnValue>,
    ) -> Result<ColumnValue, TransformError> {
        match transform {
            ResolvedTransform::Template { template } => {
                let compiled = template::compile(template);
                let rendered = template::render(&compiled, &self.handlebars, row)?;
                Ok(ColumnValue::String(rendered))
            }
            ResolvedTransform::Password(password_transform) => {
                let original_text = template::column_value_to_text(original);
                let hashed = self.evaluate_password(password_transform, &original_text, row)?;
                Ok(ColumnValue::String(hashed))
            }
            ResolvedTransform::Faker(_) | ResolvedTransform::BoolFlip | ResolvedTransform::Regex { .. } => {
                unreachable!("pass-one transform reached pass two")
            }
        }
    }

    fn evaluate_password(
        &self,
        transform: &PasswordTransform,
        original_text: &str,
        row: &HashMap<String, ColumnValue>,
    ) -> Result<String, TransformError> {
        let render_cleartext = |template_text: &str| -> Result<String, TransformError> {
            let compiled = template::compile(template_text);
            template::render(&compiled, &self.handlebars, row)
        };
        match transform {
            PasswordTransform::Bcrypt { cleartext_template, cost } => {
                let cleartext = render_cleartext(cleartext_template)?;
                password::hash_bcrypt(&cleartext, *cost, original_text)
            }
            PasswordTransform::Scrypt { cleartext_template, use_salt, log_n, r, p } => {
                let cleartext = render_cleartext(cleartext_template)?;
                password::hash_scrypt(&cleartext, *use_salt, original_text, *log_n, *r, *p)
            }
            PasswordTransform::Pbkdf2 { cleartext_template, use_salt, iterations } => {
                let cleartext = render_cleartext(cleartext_template)?;
                password::hash_pbkdf2(&cleartext, *use_salt, original_text, *iterations)
            }
            PasswordTransform::Argon2id { cleartext_template, use_salt, time, memory, threads } => {
                let cleartext = render_cleartext(cleartext_template)?;
                password::hash_argon2id(&cleartext, *use_salt, original_text, *time, *memory, *threads)
            }
        }
    }
}

fn column_error(table: &str, column: &str, source: TransformError) -> TransformError {
    TransformError::Column {
        table: table.to_string(),
        column: column.to_string(),
        source: Box::new(source),
    }
}

fn evaluate_pass_one(transform: &ResolvedTransform, original: &ColumnValue) -> Result<ColumnValue, TransformError> {
    match transform {
        ResolvedTransform::Faker(kind) => {
            if original.is_null() {
                return Ok(ColumnValue::Null);
            }
            let mut rng = faker::seeded_rng(original);
            Ok(faker::generate(*kind, &mut rng))
        }
        ResolvedTransform::BoolFlip => {
            if original.is_null() {
                return Ok(ColumnValue::Null);
            }
            Ok(ColumnValue::Bool(faker::low_bit(original)))
        }
        ResolvedTransform::Regex { pattern, replacement } => {
            if original.is_null() {
                return Ok(ColumnValue::Null);
            }
            let text = original.as_str().ok_or_else(|| {
                TransformError::TypeMismatch(format!(
                    "regex transform requires a string or timestamp column, got {original:?}"
                ))
            })?;
            Ok(ColumnValue::String(pattern.replace_all(text, replacement.as_str()).into_owned()))
        }
        ResolvedTransform::Template { .. } | ResolvedTransform::Password(_) => {
            unreachable!("pass-two transform reached pass one")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kasho_model::{DmlChange, DmlKind};

    fn config(yaml: &str) -> TransformConfig {
        TransformConfig::parse(yaml).unwrap()
    }

    #[test]
    fn untransformed_table_passes_through_unmodified() {
        let config = config("major_version: 1\ntables: {}\n");
        let mut change = DmlChange {
            table: "public.orders".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["id".to_string()],
            column_values: vec![ColumnValue::Int64(7)],
            old_keys: None,
        };
        let evaluator = Evaluator::new();
        evaluator.apply(&config, &mut change).unwrap();
        assert_eq!(change.column_values, vec![ColumnValue::Int64(7)]);
    }

    #[test]
    fn regex_transform_redacts_digits() {
        let config = config(
            "major_version: 1\ntables:\n  public.users:\n    ssn:\n      type: Regex\n      pattern: '\\d'\n      replacement: 'X'\n",
        );
        let mut change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["ssn".to_string()],
            column_values: vec![ColumnValue::String("123-45-6789".to_string())],
            old_keys: None,
        };
        Evaluator::new().apply(&config, &mut change).unwrap();
        assert_eq!(change.column_values, vec![ColumnValue::String("XXX-XX-XXXX".to_string())]);
    }

    #[test]
    fn regex_on_non_string_column_is_a_type_mismatch() {
        let config = config(
            "major_version: 1\ntables:\n  public.users:\n    balance:\n      type: Regex\n      pattern: '\\d'\n      replacement: 'X'\n",
        );
        let mut change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["balance".to_string()],
            column_values: vec![ColumnValue::Int64(500)],
            old_keys: None,
        };
        let err = Evaluator::new().apply(&config, &mut change).unwrap_err();
        assert!(matches!(
            err,
            TransformError::Column { column, source, .. }
                if column == "balance" && matches!(*source, TransformError::TypeMismatch(_))
        ));
    }

    #[test]
    fn fallback_policy_keeps_original_value_on_error() {
        let config = config(
            "major_version: 1\ntables:\n  public.users:\n    balance:\n      type: Regex\n      pattern: '\\d'\n      replacement: 'X'\n",
        );
        let mut change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["balance".to_string()],
            column_values: vec![ColumnValue::Int64(500)],
            old_keys: None,
        };
        Evaluator::new()
            .apply_with_policy(&config, &mut change, TransformErrorPolicy::FallbackOriginal)
            .unwrap();
        assert_eq!(change.column_values, vec![ColumnValue::Int64(500)]);
    }

    #[test]
    fn null_column_skips_faker_and_stays_null() {
        let config = config("major_version: 1\ntables:\n  public.users:\n    first_name: FakeFirstName\n");
        let mut change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["first_name".to_string()],
            column_values: vec![ColumnValue::Null],
            old_keys: None,
        };
        Evaluator::new().apply(&config, &mut change).unwrap();
        assert_eq!(change.column_values, vec![ColumnValue::Null]);
    }

    #[test]
    fn template_sees_pass_one_output_of_sibling_column() {
        // Scenario: a template-driven `email` column reads the *original*
        // (untransformed) `first_name`, proving pass two runs against the
        // row's pass-one state rather than the pre-transform originals.
        let config = config(
            "major_version: 1\ntables:\n  public.users:\n    email:\n      type: Template\n      template: \"{{.first_name | lower}}.{{.last_name | lower}}@ex.com\"\n",
        );
        let mut change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["first_name".to_string(), "last_name".to_string(), "email".to_string()],
            column_values: vec![
                ColumnValue::String("John".to_string()),
                ColumnValue::String("Doe".to_string()),
                ColumnValue::String("placeholder".to_string()),
            ],
            old_keys: None,
        };
        Evaluator::new().apply(&config, &mut change).unwrap();
        assert_eq!(change.column_values[2], ColumnValue::String("john.doe@ex.com".to_string()));
    }

    #[test]
    fn old_keys_are_never_transformed() {
        let config = config("major_version: 1\ntables:\n  public.users:\n    id: FakeFirstName\n");
        let mut change = DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Update,
            column_names: vec!["id".to_string()],
            column_values: vec![ColumnValue::Int64(1)],
            old_keys: Some(kasho_model::KeyValues {
                key_names: vec!["id".to_string()],
                key_values: vec![ColumnValue::Int64(1)],
            }),
        };
        Evaluator::new().apply(&config, &mut change).unwrap();
        assert_eq!(
            change.old_keys.as_ref().unwrap().key_values,
            vec![ColumnValue::Int64(1)]
        );
    }

    #[test]
    fn password_hash_is_deterministic_across_evaluations() {
        let config = config(
            "major_version: 1\ntables:\n  public.users:\n    password:\n      type: PasswordArgon2id\n      cleartext: \"{{.raw_password}}\"\n      use_salt: true\n      time: 2\n      memory: 1024\n      threads: 2\n",
        );
        let build_change = || DmlChange {
            table: "public.users".to_string(),
            kind: DmlKind::Insert,
            column_names: vec!["raw_password".to_string(), "password".to_string()],
            column_values: vec![
                ColumnValue::String("password123".to_string()),
                ColumnValue::String("testuser".to_string()),
            ],
            old_keys: None,
        };
        let mut a = build_change();
        let mut b = build_change();
        let evaluator = Evaluator::new();
        evaluator.apply(&config, &mut a).unwrap();
        evaluator.apply(&config, &mut b).unwrap();
        assert_eq!(a.column_values[1], b.column_values[1]);
    }
}
