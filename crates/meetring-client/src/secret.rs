//! Indirect credential values in `config.toml`.
//!
//! `env::NAME` reads `$NAME`, `pass::entry` takes the first line of
//! `pass show entry`. Any other value is used literally.

use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SecretRef<'a> {
    Env(&'a str),
    Pass(&'a str),
    Literal(&'a str),
}

impl<'a> SecretRef<'a> {
    fn parse(value: &'a str) -> Self {
        if let Some(name) = value.strip_prefix("env::") {
            Self::Env(name)
        } else if let Some(entry) = value.strip_prefix("pass::") {
            Self::Pass(entry)
        } else {
            Self::Literal(value)
        }
    }
}

pub fn resolve(value: &str) -> Result<String, String> {
    match SecretRef::parse(value) {
        SecretRef::Literal(v) => Ok(v.to_string()),
        SecretRef::Env(name) => {
            std::env::var(name).map_err(|_| format!("environment variable `{name}` is not set"))
        }
        SecretRef::Pass(entry) => from_pass(entry),
    }
}

fn from_pass(entry: &str) -> Result<String, String> {
    let output = Command::new("pass")
        .args(["show", entry])
        .output()
        .map_err(|e| format!("could not run `pass show {entry}`: {e}"))?;
    if !output.status.success() {
        return Err(format!(
            "`pass show {entry}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(str::to_string)
        .filter(|line| !line.is_empty())
        .ok_or_else(|| format!("`pass show {entry}` printed nothing"))
}
