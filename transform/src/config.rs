//! YAML transform-config loading. The file names, per table, which columns
//! get transformed and how. A column's transform is written either as a
//! bare tag (`first_name: FakeFirstName`) for fakers and the boolean flip,
//! or as a mapping with a `type` field for transforms that carry
//! parameters (regex, template, the four password backends).

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::error::TransformError;
use crate::faker::FakerKind;

/// Transform configs are versioned so a future incompatible rewrite of this
/// module can refuse to silently misinterpret an older file.
pub const SUPPORTED_MAJOR_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTransform {
    Simple(String),
    Detailed(DetailedTransform),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum DetailedTransform {
    Regex {
        pattern: String,
        replacement: String,
    },
    Template {
        template: String,
    },
    PasswordBcrypt {
        cleartext: String,
        #[serde(default)]
        use_salt: bool,
        #[serde(default = "default_bcrypt_cost")]
        cost: u32,
    },
    PasswordScrypt {
        cleartext: String,
        #[serde(default)]
        use_salt: bool,
        #[serde(rename = "n")]
        log_n: u8,
        r: u32,
        p: u32,
    },
    PasswordPbkdf2 {
        cleartext: String,
        #[serde(default)]
        use_salt: bool,
        iterations: u32,
    },
    PasswordArgon2id {
        cleartext: String,
        #[serde(default)]
        use_salt: bool,
        time: u32,
        memory: u32,
        threads: u32,
    },
}

fn default_bcrypt_cost() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    major_version: u32,
    tables: HashMap<String, HashMap<String, RawTransform>>,
}

#[derive(Debug, Clone)]
pub enum PasswordTransform {
    Bcrypt {
        cleartext_template: String,
        cost: u32,
    },
    Scrypt {
        cleartext_template: String,
        use_salt: bool,
        log_n: u8,
        r: u32,
        p: u32,
    },
    Pbkdf2 {
        cleartext_template: String,
        use_salt: bool,
        iterations: u32,
    },
    Argon2id {
        cleartext_template: String,
        use_salt: bool,
        time: u32,
        memory: u32,
        threads: u32,
    },
}

/// A transform after config load: tags resolved to enum variants, patterns
/// already compiled. Cheap to clone and evaluate per row.
#[derive(Debug, Clone)]
pub enum ResolvedTransform {
    Faker(FakerKind),
    BoolFlip,
    Regex { pattern: Regex, replacement: String },
    Template { template: String },
    Password(PasswordTransform),
}

impl ResolvedTransform {
    /// Template and password transforms may reference sibling columns, so
    /// they run in the second evaluation pass, after every other column on
    /// the row has its pass-1 value. Everything else is self-contained and
    /// runs in pass 1.
    pub fn needs_row_context(&self) -> bool {
        matches!(self, ResolvedTransform::Template { .. } | ResolvedTransform::Password(_))
    }

    fn resolve(raw: RawTransform) -> Result<Self, TransformError> {
        match raw {
            RawTransform::Simple(tag) => {
                if tag == "BoolFlip" {
                    return Ok(ResolvedTransform::BoolFlip);
                }
                FakerKind::parse(&tag)
                    .map(ResolvedTransform::Faker)
                    .ok_or_else(|| TransformError::UnknownTransform(tag))
            }
            RawTransform::Detailed(DetailedTransform::Regex { pattern, replacement }) => {
                let compiled = crate::regex_cache::compile(&pattern)?;
                Ok(ResolvedTransform::Regex { pattern: compiled, replacement })
            }
            RawTransform::Detailed(DetailedTransform::Template { template }) => {
                Ok(ResolvedTransform::Template { template })
            }
            RawTransform::Detailed(DetailedTransform::PasswordBcrypt { cleartext, cost, .. }) => {
                Ok(ResolvedTransform::Password(PasswordTransform::Bcrypt {
                    cleartext_template: cleartext,
                    cost,
                }))
            }
            RawTransform::Detailed(DetailedTransform::PasswordScrypt {
                cleartext,
                use_salt,
                log_n,
                r,
                p,
            }) => Ok(ResolvedTransform::Password(PasswordTransform::Scrypt {
                cleartext_template: cleartext,
                use_salt,
                log_n,
                r,
                p,
            })),
            RawTransform::Detailed(DetailedTransform::PasswordPbkdf2 {
                cleartext,
                use_salt,
                iterations,
            }) => Ok(ResolvedTransform::Password(PasswordTransform::Pbkdf2 {
                cleartext_template: cleartext,
                use_salt,
                iterations,
            })),
            RawTransform::Detailed(DetailedTransform::PasswordArgon2id {
                cleartext,
                use_salt,
                time,
                memory,
                threads,
            }) => Ok(ResolvedTransform::Password(PasswordTransform::Argon2id {
                cleartext_template: cleartext,
                use_salt,
                time,
                memory,
                threads,
            })),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub major_version: u32,
    tables: HashMap<String, HashMap<String, ResolvedTransform>>,
}

impl TransformConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TransformError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(yaml: &str) -> Result<Self, TransformError> {
        let raw: RawConfig = serde_yaml::from_str(yaml)?;
        if raw.major_version != SUPPORTED_MAJOR_VERSION {
            return Err(TransformError::VersionMismatch {
                expected: SUPPORTED_MAJOR_VERSION,
                found: raw.major_version,
            });
        }
        let mut tables = HashMap::with_capacity(raw.tables.len());
        for (table, columns) in raw.tables {
            let mut resolved = HashMap::with_capacity(columns.len());
            for (column, transform) in columns {
                resolved.insert(column, ResolvedTransform::resolve(transform)?);
            }
            tables.insert(table, resolved);
        }
        Ok(Self { major_version: raw.major_version, tables })
    }

    pub fn for_table(&self, table: &str) -> Option<&HashMap<String, ResolvedTransform>> {
        self.tables.get(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_and_detailed_transforms() {
        let yaml = r#"
major_version: 1
tables:
  public.users:
    first_name: FakeFirstName
    is_active: BoolFlip
    email:
      type: Template
      template: "{{.first_name | lower}}@ex.com"
    ssn:
      type: Regex
      pattern: '\d'
      replacement: "X"
    password:
      type: PasswordArgon2id
      cleartext: password123
      use_salt: true
      time: 2
      memory: 1024
      threads: 2
"#;
        let config = TransformConfig::parse(yaml).unwrap();
        let table = config.for_table("public.users").unwrap();
        assert!(matches!(table.get("first_name"), Some(ResolvedTransform::Faker(FakerKind::FirstName))));
        assert!(matches!(table.get("is_active"), Some(ResolvedTransform::BoolFlip)));
        assert!(matches!(table.get("email"), Some(ResolvedTransform::Template { .. })));
        assert!(matches!(table.get("ssn"), Some(ResolvedTransform::Regex { .. })));
        assert!(matches!(table.get("password"), Some(ResolvedTransform::Password(_))));
    }

    #[test]
    fn rejects_mismatched_major_version() {
        let yaml = "major_version: 99\ntables: {}\n";
        let err = TransformConfig::parse(yaml).unwrap_err();
        assert!(matches!(err, TransformError::VersionMismatch { expected: 1, found: 99 }));
    }

    #[test]
    fn rejects_unknown_simple_tag() {
        let yaml = "major_version: 1\ntables:\n  t:\n    c: FakeBitcoinAddress\n";
        assert!(TransformConfig::parse(yaml).is_err());
    }

    #[test]
    fn unconfigured_table_yields_no_transforms() {
        let config = TransformConfig::parse("major_version: 1\ntables: {}\n").unwrap();
        assert!(config.for_table("public.users").is_none());
    }
}
