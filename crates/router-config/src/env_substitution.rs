use once_cell::sync::Lazy;
use regex::Regex;
use router_core::{Result, RouterError};
use serde_json::Value;
use std::env;

// Matches ${VAR} and ${VAR:-default}
static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("Invalid regex pattern")
});

/// Recursively substitute environment variables in every string of a JSON value.
/// Object keys are left untouched.
pub fn substitute_env_vars(value: &mut Value) -> Result<()> {
    let mut missing = Vec::new();
    substitute_inner(value, &mut missing);

    if missing.is_empty() {
        Ok(())
    } else {
        missing.sort();
        missing.dedup();
        Err(RouterError::ConfigError(format!(
            "Missing required environment variables: {}",
            missing.join(", ")
        )))
    }
}

fn substitute_inner(value: &mut Value, missing: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let (resolved, unresolved) = expand(s);
            *s = resolved;
            missing.extend(unresolved);
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                substitute_inner(v, missing);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                substitute_inner(v, missing);
            }
        }
        _ => {}
    }
}

/// Expand a single string. Unset variables without a default are left
/// verbatim, so callers that prefer lenient handling (child process
/// environments, HTTP headers) can use this directly.
pub fn resolve_env_value(input: &str) -> String {
    expand(input).0
}

fn expand(input: &str) -> (String, Vec<String>) {
    let mut missing = Vec::new();
    let resolved = ENV_VAR_REGEX.replace_all(input, |caps: &regex::Captures<'_>| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.push(var_name.to_string());
                    caps[0].to_string()
                }
            },
        }
    });
    (resolved.into_owned(), missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_env_vars() {
        env::set_var("ROUTER_TEST_HOST", "mcp.internal");

        let mut value = json!({
            "url": "http://${ROUTER_TEST_HOST}:8080/mcp",
            "fallback": "${ROUTER_TEST_UNSET_VAR:-localhost}",
            "args": ["--host", "${ROUTER_TEST_HOST}"],
            "port": 8080
        });

        substitute_env_vars(&mut value).unwrap();

        assert_eq!(value["url"], "http://mcp.internal:8080/mcp");
        assert_eq!(value["fallback"], "localhost");
        assert_eq!(value["args"][1], "mcp.internal");
        assert_eq!(value["port"], 8080);

        env::remove_var("ROUTER_TEST_HOST");
    }

    #[test]
    fn test_missing_variables_are_reported() {
        let mut value = json!({
            "a": "${ROUTER_TEST_MISSING_ONE}",
            "b": ["${ROUTER_TEST_MISSING_TWO}", "${ROUTER_TEST_MISSING_ONE}"]
        });

        let err = substitute_env_vars(&mut value).unwrap_err().to_string();
        assert!(err.contains("ROUTER_TEST_MISSING_ONE, ROUTER_TEST_MISSING_TWO"));
    }

    #[test]
    fn test_resolve_env_value_is_lenient() {
        assert_eq!(resolve_env_value("${ROUTER_TEST_NOPE}"), "${ROUTER_TEST_NOPE}");
        assert_eq!(resolve_env_value("${ROUTER_TEST_NOPE:-x}/y"), "x/y");
        assert_eq!(resolve_env_value("plain"), "plain");
    }
}
