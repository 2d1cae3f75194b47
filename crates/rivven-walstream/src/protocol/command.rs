//! Replication commands
//!
//! Text commands sent as simple queries on a replication connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::WalStreamError;
use crate::lsn::Lsn;

/// Asks the server for its system identifier, timeline, WAL position and
/// the database the replication connection is bound to.
pub const IDENTIFY_SYSTEM: &str = "IDENTIFY_SYSTEM";

/// An output plugin option, `name` or `name=value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginOption {
    /// Option name
    pub name: String,
    /// Option value; a bare name is sent without one
    pub value: Option<String>,
}

impl PluginOption {
    /// Option with a value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Option without a value
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

impl FromStr for PluginOption {
    type Err = WalStreamError;

    /// Splits on the first `=`; `a=b=c` is name `a`, value `b=c`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = match s.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (s, None),
        };
        if name.is_empty() {
            return Err(WalStreamError::config(format!(
                "plugin option \"{s}\" has no name"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            value,
        })
    }
}

impl TryFrom<String> for PluginOption {
    type Error = WalStreamError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PluginOption> for String {
    fn from(option: PluginOption) -> Self {
        option.to_string()
    }
}

impl fmt::Display for PluginOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// Build the `START_REPLICATION` command.
///
/// ```text
/// START_REPLICATION SLOT "slot" LOGICAL 0/0
/// START_REPLICATION SLOT "slot" LOGICAL 0/16B2D40 ("include-xids" '0', "skip-empty-xacts")
/// ```
///
/// The option list, parentheses included, is omitted when empty.
pub fn start_replication_command(slot: &str, start: Lsn, options: &[PluginOption]) -> String {
    let mut query = format!(
        "START_REPLICATION SLOT {} LOGICAL {}",
        quote_ident(slot),
        start
    );

    if !options.is_empty() {
        let rendered: Vec<String> = options
            .iter()
            .map(|option| match &option.value {
                Some(value) => format!("{} {}", quote_ident(&option.name), quote_literal(value)),
                None => quote_ident(&option.name),
            })
            .collect();
        query.push_str(" (");
        query.push_str(&rendered.join(", "));
        query.push(')');
    }

    query
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_without_options() {
        let query = start_replication_command("s1", Lsn::INVALID, &[]);
        assert_eq!(query, "START_REPLICATION SLOT \"s1\" LOGICAL 0/0");
    }

    #[test]
    fn test_command_with_options() {
        let options = vec![
            PluginOption::new("include-xids", "0"),
            PluginOption::flag("skip-empty-xacts"),
        ];
        let query = start_replication_command("fanout", Lsn::new(0x1_0000_00FF), &options);
        assert_eq!(
            query,
            "START_REPLICATION SLOT \"fanout\" LOGICAL 1/FF (\"include-xids\" '0', \"skip-empty-xacts\")"
        );
    }

    #[test]
    fn test_quoting_is_escaped() {
        let options = vec![PluginOption::new("filter", "it's")];
        let query = start_replication_command("we\"ird", Lsn::INVALID, &options);
        assert_eq!(
            query,
            "START_REPLICATION SLOT \"we\"\"ird\" LOGICAL 0/0 (\"filter\" 'it''s')"
        );
    }

    #[test]
    fn test_parse_plugin_options() {
        let opt: PluginOption = "pretty-print=1".parse().unwrap();
        assert_eq!(opt, PluginOption::new("pretty-print", "1"));

        let opt: PluginOption = "include-lsn".parse().unwrap();
        assert_eq!(opt, PluginOption::flag("include-lsn"));

        let opt: PluginOption = "expr=a=b".parse().unwrap();
        assert_eq!(opt.value.as_deref(), Some("a=b"));

        assert!("=1".parse::<PluginOption>().is_err());
    }

    #[test]
    fn test_plugin_option_serde() {
        let opts: Vec<PluginOption> =
            serde_json::from_str(r#"["format-version=2", "include-timestamp"]"#).unwrap();
        assert_eq!(opts[0], PluginOption::new("format-version", "2"));
        assert_eq!(opts[1], PluginOption::flag("include-timestamp"));
        assert_eq!(
            serde_json::to_string(&opts).unwrap(),
            r#"["format-version=2","include-timestamp"]"#
        );
    }
}
