//! Endpoint specification strings.
//!
//! A spec is `key1=value1//key2=value2//...`; leaving out `=value` means a
//! boolean true. Keys are unique and may not start with an underscore;
//! `env:NAME=value` entries accumulate, a repeated name overwriting the
//! earlier value. Unrecognised keys are accepted and exposed but have no
//! behaviour.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A malformed endpoint specification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XSpecError {
    /// Keys starting with `_` are reserved.
    #[error("invalid key {0:?}: keys may not start with an underscore")]
    UnderscoreKey(String),
    /// The same key appeared twice.
    #[error("duplicate key {key:?} in {spec:?}")]
    DuplicateKey {
        /// The repeated key.
        key: String,
        /// The whole spec string.
        spec: String,
    },
    /// An empty `//`-separated segment.
    #[error("empty segment in {0:?}")]
    EmptySegment(String),
    /// A recognised key with a value of the wrong shape.
    #[error("key {key:?} expects {expected}, got {value:?}")]
    BadValue {
        /// The offending key.
        key: &'static str,
        /// What the key expects.
        expected: &'static str,
        /// What the spec said.
        value: String,
    },
}

/// The value of an unrecognised key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecValue {
    /// The key appeared without `=value`.
    Flag,
    /// The key appeared with a text value.
    Text(String),
}

impl SpecValue {
    /// The text value, if there was one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SpecValue::Flag => None,
            SpecValue::Text(s) => Some(s),
        }
    }
}

/// A parsed endpoint specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XSpec {
    raw: String,
    /// Explicit gateway id; auto-assigned (`gw<n>`) when absent.
    pub id: Option<String>,
    /// Local subprocess transport.
    pub popen: bool,
    /// SSH transport; the value may carry ssh options besides the host.
    pub ssh: Option<String>,
    /// SSH transport through `vagrant ssh <name>`.
    pub vagrant_ssh: Option<String>,
    /// TCP transport, `host:port`.
    pub socket: Option<String>,
    /// The worker runtime to launch on the peer, splittable into argv.
    pub runtime: Option<String>,
    /// Directory the worker changes into (created if missing).
    pub chdir: Option<String>,
    /// Niceness increment applied by the worker.
    pub nice: Option<i32>,
    /// Environment entries the worker sets, in spec order.
    pub env: Vec<(String, String)>,
    /// Ask the peer runtime not to write a bytecode cache. Kept for
    /// compatibility; the native worker has none.
    pub dont_write_bytecode: bool,
    /// `-F <path>` for the ssh client.
    pub ssh_config: Option<String>,
    /// Execution model of the worker's dispatch side.
    pub execmodel: Option<String>,
    /// Install a socket listener through this existing gateway and dial it.
    pub installvia: Option<String>,
    extra: Vec<(String, SpecValue)>,
}

impl XSpec {
    /// Parse a spec string.
    pub fn parse(spec: &str) -> Result<XSpec, XSpecError> {
        let mut out = XSpec {
            raw: spec.to_owned(),
            ..XSpec::default()
        };
        let mut seen: Vec<String> = Vec::new();
        for segment in spec.split("//") {
            if segment.is_empty() {
                return Err(XSpecError::EmptySegment(spec.to_owned()));
            }
            let (key, value) = match segment.find('=') {
                Some(at) => (&segment[..at], Some(&segment[at + 1..])),
                None => (segment, None),
            };
            if key.starts_with('_') {
                return Err(XSpecError::UnderscoreKey(key.to_owned()));
            }
            if let Some(name) = key.strip_prefix("env:") {
                // env entries accumulate; a repeated name overwrites
                let value = value.unwrap_or("").to_owned();
                match out.env.iter_mut().find(|(k, _)| k == name) {
                    Some(entry) => entry.1 = value,
                    None => out.env.push((name.to_owned(), value)),
                }
                continue;
            }
            if seen.iter().any(|k| k == key) {
                return Err(XSpecError::DuplicateKey {
                    key: key.to_owned(),
                    spec: spec.to_owned(),
                });
            }
            seen.push(key.to_owned());
            match key {
                "popen" => out.popen = true,
                "dont_write_bytecode" => out.dont_write_bytecode = true,
                "id" => out.id = Some(text_value("id", value)?),
                "ssh" => out.ssh = Some(text_value("ssh", value)?),
                "vagrant_ssh" => out.vagrant_ssh = Some(text_value("vagrant_ssh", value)?),
                "socket" => out.socket = Some(text_value("socket", value)?),
                "runtime" => out.runtime = Some(text_value("runtime", value)?),
                "chdir" => out.chdir = Some(text_value("chdir", value)?),
                "ssh_config" => out.ssh_config = Some(text_value("ssh_config", value)?),
                "execmodel" => out.execmodel = Some(text_value("execmodel", value)?),
                "installvia" => out.installvia = Some(text_value("installvia", value)?),
                "nice" => {
                    let text = text_value("nice", value)?;
                    out.nice = Some(text.parse().map_err(|_| XSpecError::BadValue {
                        key: "nice",
                        expected: "an integer",
                        value: text,
                    })?);
                }
                other => out.extra.push((
                    other.to_owned(),
                    match value {
                        None => SpecValue::Flag,
                        Some(v) => SpecValue::Text(v.to_owned()),
                    },
                )),
            }
        }
        Ok(out)
    }

    /// The original spec string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Look up an unrecognised key.
    pub fn get(&self, key: &str) -> Option<&SpecValue> {
        self.extra.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Whether any worker-side setup (chdir/nice/env) is requested.
    pub fn needs_setup(&self) -> bool {
        self.chdir.is_some() || self.nice.is_some() || !self.env.is_empty()
    }
}

fn text_value(key: &'static str, value: Option<&str>) -> Result<String, XSpecError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v.to_owned()),
        _ => Err(XSpecError::BadValue {
            key,
            expected: "a value",
            value: String::new(),
        }),
    }
}

impl FromStr for XSpec {
    type Err = XSpecError;

    fn from_str(spec: &str) -> Result<XSpec, XSpecError> {
        XSpec::parse(spec)
    }
}

impl fmt::Display for XSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_transport_and_options() {
        let spec: XSpec = "popen//chdir=/tmp/work//nice=5//env:A=1//env:B=two//id=w1"
            .parse()
            .unwrap();
        assert!(spec.popen);
        assert_eq!(spec.chdir.as_deref(), Some("/tmp/work"));
        assert_eq!(spec.nice, Some(5));
        assert_eq!(
            spec.env,
            vec![("A".to_owned(), "1".to_owned()), ("B".to_owned(), "two".to_owned())]
        );
        assert_eq!(spec.id.as_deref(), Some("w1"));
        assert!(spec.needs_setup());
    }

    #[test]
    fn ssh_spec_with_config() {
        let spec: XSpec = "ssh=user@host//ssh_config=/etc/sshcfg//runtime=gatewire-worker"
            .parse()
            .unwrap();
        assert_eq!(spec.ssh.as_deref(), Some("user@host"));
        assert_eq!(spec.ssh_config.as_deref(), Some("/etc/sshcfg"));
        assert_eq!(spec.runtime.as_deref(), Some("gatewire-worker"));
        assert!(!spec.needs_setup());
    }

    #[test]
    fn bare_key_is_boolean_true() {
        let spec: XSpec = "popen//dont_write_bytecode".parse().unwrap();
        assert!(spec.dont_write_bytecode);
    }

    #[test]
    fn unknown_keys_are_kept() {
        let spec: XSpec = "popen//color=blue//fancy".parse().unwrap();
        assert_eq!(
            spec.get("color"),
            Some(&SpecValue::Text("blue".to_owned()))
        );
        assert_eq!(spec.get("fancy"), Some(&SpecValue::Flag));
        assert_eq!(spec.get("missing"), None);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        assert!(matches!(
            XSpec::parse("popen//popen"),
            Err(XSpecError::DuplicateKey { .. })
        ));
        assert!(matches!(
            XSpec::parse("id=a//chdir=/x//id=b"),
            Err(XSpecError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn repeated_env_entries_overwrite() {
        let spec: XSpec = "popen//env:A=1//env:B=two//env:A=3".parse().unwrap();
        assert_eq!(
            spec.env,
            vec![("A".to_owned(), "3".to_owned()), ("B".to_owned(), "two".to_owned())]
        );
    }

    #[test]
    fn underscore_keys_are_rejected() {
        assert!(matches!(
            XSpec::parse("popen//_secret=1"),
            Err(XSpecError::UnderscoreKey(_))
        ));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            XSpec::parse("popen//nice=soon"),
            Err(XSpecError::BadValue { key: "nice", .. })
        ));
        assert!(matches!(
            XSpec::parse("ssh"),
            Err(XSpecError::BadValue { key: "ssh", .. })
        ));
        assert!(matches!(
            XSpec::parse("popen//"),
            Err(XSpecError::EmptySegment(_))
        ));
    }
}
