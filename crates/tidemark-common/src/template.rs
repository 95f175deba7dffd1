//! Placeholder substitution for generated resources (DDL, workflow
//! definitions, job properties, dashboards).
//!
//! Placeholders are literal tokens such as `@TABLE`. Longer tokens are
//! replaced first so `@TABLE` never clobbers part of `@TABLESPACE`.

use std::path::Path;

/// Substitute every placeholder in `template` and return the result
pub fn materialize(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut ordered: Vec<&(&str, &str)> = substitutions.iter().collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    ordered
        .into_iter()
        .fold(template.to_string(), |acc, (param, value)| acc.replace(param, value))
}

/// Read a template file, substitute, and write the output file
pub fn materialize_file(
    template_path: &Path,
    substitutions: &[(&str, &str)],
    out_path: &Path,
) -> std::io::Result<String> {
    let template = std::fs::read_to_string(template_path)?;
    let rendered = materialize(&template, substitutions);
    std::fs::write(out_path, &rendered)?;
    Ok(rendered)
}
