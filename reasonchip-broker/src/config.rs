//! Config file shape for `broker`/`worker`/`run`/`run-local`: an INI file
//! with `${VAR}` environment substitution. CLI flags always win over a
//! value loaded from the file.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

/// TLS material for one side of a connection. Every field is optional —
/// absence means "plaintext".
#[derive(Debug, Clone, Default)]
pub struct SslOptions {
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
    pub ciphers: Option<String>,
    pub versions: Option<String>,
}

impl SslOptions {
    fn from_section(section: &HashMap<String, String>, prefix: &str) -> Self {
        let field = |name: &str| section.get(&format!("{prefix}_{name}")).cloned();
        Self {
            cert: field("cert"),
            key: field("key"),
            ca: field("ca"),
            ciphers: field("ciphers"),
            versions: field("versions"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub log_level: Option<String>,
    pub broker_client_uri: Option<String>,
    pub broker_worker_uri: Option<String>,
    pub worker_broker_uri: Option<String>,
    pub collections: Vec<(String, String)>,
    pub worker_count: Option<u32>,
    pub client_ssl: SslOptions,
    pub server_ssl: SslOptions,
}

/// Expand `${VAR}` references against the process environment. Unknown
/// variables expand to an empty string rather than erroring — matching
/// ordinary shell behavior for unset variables.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c == '$' && chars.peek().map(|(_, c)| *c) == Some('{') {
            chars.next();
            let mut name = String::new();
            for (_, c) in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            out.push_str(&std::env::var(&name).unwrap_or_default());
        } else {
            out.push(c);
        }
    }
    out
}

/// A minimal `[section]` / `key = value` INI reader. No nesting, no
/// comments-after-value, `;` and `#` start a full-line comment.
fn parse_ini(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::from("default");
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            current = name.to_string();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), expand_env(value.trim()));
        }
    }
    sections
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        let sections = parse_ini(&text);
        let empty = HashMap::new();
        let get = |section: &str, key: &str| sections.get(section).and_then(|s| s.get(key)).cloned();

        let collections = sections
            .get("worker")
            .unwrap_or(&empty)
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("collection.").map(|name| (name.to_string(), v.clone())))
            .collect();

        Ok(Self {
            log_level: get("default", "log_level"),
            broker_client_uri: get("broker", "client_uri"),
            broker_worker_uri: get("broker", "worker_uri"),
            worker_broker_uri: get("worker", "broker_uri"),
            collections,
            worker_count: get("worker", "workers").and_then(|v| v.parse().ok()),
            client_ssl: SslOptions::from_section(sections.get("client").unwrap_or(&empty), "ssl"),
            server_ssl: SslOptions::from_section(sections.get("server").unwrap_or(&empty), "ssl"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_environment_variables() {
        std::env::set_var("REASONCHIP_TEST_VAR", "9090");
        assert_eq!(expand_env("0.0.0.0:${REASONCHIP_TEST_VAR}"), "0.0.0.0:9090");
    }

    #[test]
    fn unknown_variable_expands_empty() {
        std::env::remove_var("REASONCHIP_DEFINITELY_UNSET");
        assert_eq!(expand_env("prefix-${REASONCHIP_DEFINITELY_UNSET}-suffix"), "prefix--suffix");
    }

    #[test]
    fn parses_sections_and_collections() {
        let ini = "[default]\nlog_level = info\n\n[worker]\nworkers = 4\ncollection.demo = /tmp/demo\n";
        let sections = parse_ini(ini);
        assert_eq!(sections["default"]["log_level"], "info");
        assert_eq!(sections["worker"]["workers"], "4");
        assert_eq!(sections["worker"]["collection.demo"], "/tmp/demo");
    }
}
