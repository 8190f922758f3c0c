//! Environment variable interpolation for config files.
//!
//! Supported forms:
//! - `$VAR` or `${VAR}`: the variable's value, an error if it is unset
//! - `${VAR:-default}`: the default when VAR is unset or empty
//! - `${VAR-default}`: the default only when VAR is unset
//! - `$$`: a literal `$`
//!
//! Credentials for the source bucket and the destination catalog are
//! usually injected this way, e.g. `client_secret: ${CATALOG_SECRET}`.

use regex::{Captures, Regex};
use snafu::prelude::*;
use std::sync::LazyLock;

use crate::error::{ConfigError, EnvInterpolationSnafu};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?P<escape>\$\$)
        |
        \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<default>[^}]*) )? \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("placeholder pattern is valid")
});

/// Substitutes placeholders using `lookup` to resolve variable names.
///
/// Every unresolvable placeholder is reported, not just the first one.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut problems = Vec::new();

    let output = PLACEHOLDER.replace_all(input, |caps: &Captures| {
        if caps.name("escape").is_some() {
            return "$".to_string();
        }

        let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
            return caps[0].to_string();
        };
        let name = name.as_str();
        let op = caps.name("op").map(|m| m.as_str());
        let default = caps.name("default").map(|m| m.as_str());

        match (lookup(name), op) {
            (Some(value), _) if value.contains(['\n', '\r']) => {
                problems.push(format!("'{name}' contains a newline"));
                caps[0].to_string()
            }
            (Some(value), Some(":-")) if value.is_empty() => default.unwrap_or_default().to_string(),
            (Some(value), _) => value,
            (None, Some(_)) => default.unwrap_or_default().to_string(),
            (None, None) => {
                problems.push(format!("'{name}' is not set"));
                caps[0].to_string()
            }
        }
    });

    ensure!(
        problems.is_empty(),
        EnvInterpolationSnafu {
            message: problems.join("\n"),
        }
    );

    Ok(output.into_owned())
}

/// Substitutes placeholders from the process environment.
pub fn interpolate(input: &str) -> Result<String, ConfigError> {
    interpolate_with(input, |name| std::env::var(name).ok())
}
