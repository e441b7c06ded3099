//! TOML run configuration.
//!
//! ```toml
//! perplexity = 30.0
//! theta = 0.5
//! seed = 7
//! unit_scale = true
//!
//! [schedule]
//! learning_rate = 200.0
//! ```
//!
//! With a data file as input, the file's keys are layered over the header
//! values: a key the config sets wins, the header fills the rest.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tsne_core::TsneParams;

use crate::error::Result;
use crate::exchange::ExchangeParams;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    #[serde(flatten)]
    pub params: TsneParams,
    /// Rescale the final embedding into [0, 1] per axis.
    pub unit_scale: bool,
}

impl RunConfig {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse `text` layered over a data file header.
    pub fn parse_over(text: &str, header: &ExchangeParams) -> Result<Self> {
        let mut merged = header.to_table();
        let layer: toml::Table = toml::from_str(text)?;
        merge(&mut merged, layer);
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Load `path` layered over a data file header. Without a path only the
    /// header and the defaults apply.
    pub fn load_over(path: Option<&Path>, header: &ExchangeParams) -> Result<Self> {
        let Some(path) = path else {
            return Self::parse_over("", header);
        };
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse_over(&text, header)?;
        tracing::debug!("loaded config from {} over the data file header", path.display());
        Ok(config)
    }
}

/// Recursively overwrite `dest` with the keys of `src`.
fn merge(dest: &mut toml::Table, src: toml::Table) {
    for (key, value) in src {
        if let toml::Value::Table(layer) = value {
            if let Some(toml::Value::Table(existing)) = dest.get_mut(&key) {
                merge(existing, layer);
                continue;
            }
            dest.insert(key, toml::Value::Table(layer));
        } else {
            dest.insert(key, value);
        }
    }
}
