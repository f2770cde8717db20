use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use skillswap_core::{Result, SwapError};
use std::env;

// ${VAR} or ${VAR:-default}
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("Invalid regex pattern")
});

/// Recursively expand environment placeholders in every string of a JSON tree
pub fn substitute_env_vars(value: &mut Value) -> Result<()> {
    match value {
        Value::String(s) => {
            *s = substitute_in_string(s)?;
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_in_string(input: &str) -> Result<String> {
    let mut missing = Vec::new();

    let expanded = PLACEHOLDER.replace_all(input, |cap: &Captures| {
        let name = &cap[1];
        match (env::var(name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    let expanded = expanded.into_owned();

    if !missing.is_empty() {
        return Err(SwapError::Config(format!(
            "Missing required environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(expanded)
}
