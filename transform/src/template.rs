//! Translates the config file's Go-style pipe templates (`{{.first_name |
//! lower}}`) into Handlebars source, and renders them against a row's
//! pass-1-transformed column values.
//!
//! Handlebars has no pipe syntax, so a pipeline like `.name | before "@" |
//! upper` is rewritten into nested helper subexpressions:
//! `{{upper (before name "@")}}`. Fields referenced by a template that are
//! absent from the row produce the literal `<no value>`, matching the Go
//! template package's behavior for missing keys — we supply that ourselves
//! rather than relying on Handlebars' strict mode, since a field can be
//! legitimately absent from the row context without being a template bug.

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use kasho_model::ColumnValue;

use crate::error::TransformError;

static EXPR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap());

pub struct CompiledTemplate {
    source: String,
    variables: Vec<String>,
}

pub fn compile(go_template: &str) -> CompiledTemplate {
    let mut variables = Vec::new();
    let source = EXPR
        .replace_all(go_template, |caps: &regex::Captures| {
            let (translated, var) = translate_expr(&caps[1]);
            if let Some(var) = var {
                if !variables.contains(&var) {
                    variables.push(var);
                }
            }
            format!("{{{{{translated}}}}}")
        })
        .into_owned();
    CompiledTemplate { source, variables }
}

/// Translates one `{{ ... }}` expression body. Returns the Handlebars
/// expression text and the bare field name it ultimately reads from (used
/// to seed the render context with `<no value>` for absent fields).
fn translate_expr(expr: &str) -> (String, Option<String>) {
    let parts: Vec<&str> = expr.split('|').map(|p| p.trim()).collect();
    if parts.is_empty() || parts[0].is_empty() {
        return (expr.to_string(), None);
    }
    let field = parts[0].trim_start_matches('.').to_string();
    let mut current = field.clone();
    for stage in &parts[1..] {
        let mut tokens = stage.split_whitespace();
        let helper = match tokens.next() {
            Some(h) => h,
            None => continue,
        };
        let mut call = format!("{helper} {current}");
        for arg in tokens {
            call.push(' ');
            call.push_str(arg);
        }
        current = format!("({call})");
    }
    if current.starts_with('(') && current.ends_with(')') {
        current = current[1..current.len() - 1].to_string();
    }
    (current, Some(field))
}

pub(crate) fn column_value_to_text(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => String::new(),
        ColumnValue::String(s) | ColumnValue::Timestamp(s) => s.clone(),
        ColumnValue::Int64(i) => i.to_string(),
        ColumnValue::Float64(f) => f.to_string(),
        ColumnValue::Bool(b) => b.to_string(),
    }
}

pub fn registry() -> Handlebars<'static> {
    let mut hb = Handlebars::new();
    hb.register_helper("lower", Box::new(lower_helper));
    hb.register_helper("upper", Box::new(upper_helper));
    hb.register_helper("slugify", Box::new(slugify_helper));
    hb.register_helper("before", Box::new(before_helper));
    hb.register_helper("after", Box::new(after_helper));
    hb
}

pub fn render(
    compiled: &CompiledTemplate,
    hb: &Handlebars,
    row: &HashMap<String, ColumnValue>,
) -> Result<String, TransformError> {
    let mut ctx = serde_json::Map::new();
    for var in &compiled.variables {
        let text = row
            .get(var)
            .map(column_value_to_text)
            .unwrap_or_else(|| "<no value>".to_string());
        ctx.insert(var.clone(), serde_json::Value::String(text));
    }
    hb.render_template(&compiled.source, &serde_json::Value::Object(ctx))
        .map_err(|e| TransformError::Template(e.to_string()))
}

fn param_str(h: &handlebars::Helper, index: usize) -> Result<String, handlebars::RenderError> {
    h.param(index)
        .and_then(|p| p.value().as_str().map(str::to_string))
        .ok_or_else(|| handlebars::RenderErrorReason::ParamNotFoundForIndex("helper", index).into())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&param_str(h, 0)?.to_lowercase())?;
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&param_str(h, 0)?.to_uppercase())?;
    Ok(())
}

fn slugify_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let text = param_str(h, 0)?;
    let mut slug = String::with_capacity(text.len());
    let mut last_was_dash = false;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    out.write(slug.trim_matches('-'))?;
    Ok(())
}

fn before_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let text = param_str(h, 0)?;
    let sep = param_str(h, 1)?;
    let result = text.split(&sep).next().unwrap_or(&text).to_string();
    out.write(&result)?;
    Ok(())
}

fn after_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let text = param_str(h, 0)?;
    let sep = param_str(h, 1)?;
    let result = match text.split_once(&sep as &str) {
        Some((_, after)) => after.to_string(),
        None => String::new(),
    };
    out.write(&result)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_single_pipe_to_helper_call() {
        let (expr, var) = translate_expr(".first_name | lower");
        assert_eq!(expr, "lower first_name");
        assert_eq!(var.as_deref(), Some("first_name"));
    }

    #[test]
    fn translates_pipe_chain_to_nested_subexpression() {
        let (expr, _) = translate_expr(".email | after \"@\" | upper");
        assert_eq!(expr, "upper (after email \"@\")");
    }

    #[test]
    fn renders_two_segment_email_template() {
        let compiled = compile("{{.first_name | lower}}.{{.last_name | lower}}@ex.com");
        let hb = registry();
        let mut row = HashMap::new();
        row.insert("first_name".to_string(), ColumnValue::String("John".to_string()));
        row.insert("last_name".to_string(), ColumnValue::String("Doe".to_string()));
        let rendered = render(&compiled, &hb, &row).unwrap();
        assert_eq!(rendered, "john.doe@ex.com");
    }

    #[test]
    fn missing_field_renders_as_no_value_sentinel() {
        let compiled = compile("{{.nickname}}");
        let hb = registry();
        let row = HashMap::new();
        let rendered = render(&compiled, &hb, &row).unwrap();
        assert_eq!(rendered, "<no value>");
    }

    #[test]
    fn slugify_collapses_non_alnum_runs() {
        let compiled = compile("{{.title | slugify}}");
        let hb = registry();
        let mut row = HashMap::new();
        row.insert("title".to_string(), ColumnValue::String("Hello, World!  Again".to_string()));
        let rendered = render(&compiled, &hb, &row).unwrap();
        assert_eq!(rendered, "hello-world-again");
    }
}
