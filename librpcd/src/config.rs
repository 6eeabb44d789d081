/*
 * This file is part of librpc.
 *
 * librpc is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Three-tier configuration: CLI flags override a YAML file, which
//! overrides built-in defaults — the same precedence the teacher's
//! `engine::config` resolves, scaled down to what the daemon needs.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

const DEFAULT_URI: &str = "loopback://librpcd";
const DEFAULT_CODEC: &str = "native";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub uri: String,
    pub codec: String,
    pub schema: Option<String>,
    pub log_filter: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            codec: DEFAULT_CODEC.to_string(),
            schema: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// The on-disk shape of `--config <path>`. Every field is optional: a
/// config file only needs to override what it cares about.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    uri: Option<String>,
    codec: Option<String>,
    schema: Option<String>,
    log: Option<String>,
}

impl ConfigFile {
    fn apply_onto(self, cfg: &mut DaemonConfig) {
        if let Some(uri) = self.uri {
            cfg.uri = uri;
        }
        if let Some(codec) = self.codec {
            cfg.codec = codec;
        }
        if self.schema.is_some() {
            cfg.schema = self.schema;
        }
        if let Some(log) = self.log {
            cfg.log_filter = log;
        }
    }
}

pub type ParsedRawArgs = HashMap<String, Vec<String>>;

pub enum CliParseResult {
    Help,
    Version,
    Default,
    Args(ParsedRawArgs),
}

/// Parses `--option value` and `--option=value` forms, same grammar the
/// teacher's `engine::config::parse_cli_args` accepts.
pub fn parse_cli_args<T: AsRef<str>>(src: impl Iterator<Item = T>) -> Result<CliParseResult, String> {
    let mut args_iter = src.skip(1);
    let mut out: ParsedRawArgs = HashMap::new();
    while let Some(arg) = args_iter.next() {
        let arg = arg.as_ref();
        if arg == "--help" || arg == "-h" {
            return Ok(CliParseResult::Help);
        }
        if arg == "--version" || arg == "-v" {
            return Ok(CliParseResult::Version);
        }
        if !arg.starts_with("--") {
            return Err(format!("unexpected argument `{arg}`"));
        }
        let (key, value) = match arg.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => {
                let value = args_iter
                    .next()
                    .ok_or_else(|| format!("missing value for option `{arg}`"))?;
                (arg.to_string(), value.as_ref().to_string())
            }
        };
        out.entry(key).or_default().push(value);
    }
    if out.is_empty() {
        Ok(CliParseResult::Default)
    } else {
        Ok(CliParseResult::Args(out))
    }
}

fn take_one(args: &ParsedRawArgs, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.last()).cloned()
}

pub enum ConfigAction {
    Help,
    Version,
    Run(DaemonConfig),
}

/// Resolves a `DaemonConfig` from `argv`, mirroring the precedence of the
/// teacher's `config::get_config_file_or_return_cfg`: CLI flags win over
/// `--config <file>`, which wins over the built-in defaults.
pub fn resolve(argv: impl Iterator<Item = String>) -> Result<ConfigAction, String> {
    let parsed = match parse_cli_args(argv)? {
        CliParseResult::Help => return Ok(ConfigAction::Help),
        CliParseResult::Version => return Ok(ConfigAction::Version),
        CliParseResult::Default => return Ok(ConfigAction::Run(DaemonConfig::default())),
        CliParseResult::Args(args) => args,
    };

    let mut cfg = DaemonConfig::default();

    if let Some(path) = take_one(&parsed, "--config") {
        let raw = fs::read_to_string(&path).map_err(|e| format!("cannot read {path}: {e}"))?;
        let file: ConfigFile = serde_yaml::from_str(&raw).map_err(|e| format!("malformed config {path}: {e}"))?;
        file.apply_onto(&mut cfg);
    }

    if let Some(uri) = take_one(&parsed, "--uri") {
        cfg.uri = uri;
    }
    if let Some(codec) = take_one(&parsed, "--codec") {
        cfg.codec = codec;
    }
    if let Some(schema) = take_one(&parsed, "--schema") {
        cfg.schema = Some(schema);
    }
    if let Some(log) = take_one(&parsed, "--log") {
        cfg.log_filter = log;
    }

    Ok(ConfigAction::Run(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_args() {
        let args = vec!["librpcd".to_string()];
        match resolve(args.into_iter()).unwrap() {
            ConfigAction::Run(cfg) => assert_eq!(cfg, DaemonConfig::default()),
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn cli_flags_override_defaults() {
        let args = vec![
            "librpcd".to_string(),
            "--uri=unix:///tmp/librpcd.sock".to_string(),
            "--codec".to_string(),
            "yaml".to_string(),
        ];
        match resolve(args.into_iter()).unwrap() {
            ConfigAction::Run(cfg) => {
                assert_eq!(cfg.uri, "unix:///tmp/librpcd.sock");
                assert_eq!(cfg.codec, "yaml");
            }
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn help_and_version_short_circuit() {
        let args = vec!["librpcd".to_string(), "--help".to_string()];
        assert!(matches!(resolve(args.into_iter()).unwrap(), ConfigAction::Help));
        let args = vec!["librpcd".to_string(), "-v".to_string()];
        assert!(matches!(resolve(args.into_iter()).unwrap(), ConfigAction::Version));
    }

    #[test]
    fn unknown_argument_form_is_rejected() {
        let args = vec!["librpcd".to_string(), "bare-word".to_string()];
        assert!(resolve(args.into_iter()).is_err());
    }
}
