//! Compiled regexes are cached by pattern text so a config with the same
//! pattern on many columns (or the same column evaluated across many rows)
//! only pays the compile cost once.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::TransformError;

static CACHE: Lazy<RwLock<HashMap<String, Regex>>> = Lazy::new(|| RwLock::new(HashMap::new()));

pub fn compile(pattern: &str) -> Result<Regex, TransformError> {
    if let Some(found) = CACHE.read().unwrap().get(pattern) {
        return Ok(found.clone());
    }
    let compiled = Regex::new(pattern).map_err(|e| TransformError::RegexCompile(e.to_string()))?;
    CACHE.write().unwrap().insert(pattern.to_string(), compiled.clone());
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_compiles_return_equivalent_regex() {
        let a = compile(r"^\d+$").unwrap();
        let b = compile(r"^\d+$").unwrap();
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(compile(r"(unclosed").is_err());
    }
}
