// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes the server config file.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub main: Main,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Main {
    /// Directory holding durable per-instance records. When unset, state
    /// is volatile and lost on restart.
    pub data_dir: Option<Utf8PathBuf>,

    /// Length of generated administrative passwords.
    #[serde(default = "default_password_length")]
    pub password_length: usize,
}

impl Default for Main {
    fn default() -> Self {
        Self { data_dir: None, password_length: default_password_length() }
    }
}

fn default_password_length() -> usize {
    12
}

/// Parses a TOML config file.
pub fn parse(path: &Utf8Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read config at {path}"))?;
    toml::from_str(&contents)
        .with_context(|| format!("unable to parse config at {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[main]\ndata_dir = \"/var/configdrive\"\n",
        )
        .unwrap();
        let config = parse(
            Utf8Path::from_path(&path).unwrap(),
        )
        .unwrap();
        assert_eq!(
            config.main.data_dir.as_deref(),
            Some(Utf8Path::new("/var/configdrive"))
        );
        assert_eq!(config.main.password_length, 12);
    }
}
