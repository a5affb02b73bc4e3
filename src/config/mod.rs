//! Declarative configuration: sources, sinks, the rule tree, and a handful
//! of global settings. The grammar is this project's own (no prior-art
//! file to ground it on beyond the seed scenarios in SPEC_FULL.md S6/S8);
//! the validated-typed-struct shape of [`Config`] follows `vector`'s
//! config-layer convention of parsing into one owned, fully-resolved value
//! before anything downstream touches it.

pub mod parser;

use std::path::PathBuf;

use crate::descriptor::Origin;
use crate::rules::Tree;

pub use parser::ConfigError;

pub const DEFAULT_PIDFILE: &str = "/var/tmp/logrelay.pid";
pub const DEFAULT_DATETIME_FORMAT: &str = "%FT%T";
pub const DEFAULT_FRACTSECOND_DIVIDER: u32 = 1;

#[derive(Debug)]
pub struct Config {
    pub origins: Vec<Origin>,
    pub tree: Tree,
    pub listen_port: Option<u16>,
    pub datetime_format: String,
    pub fractsecond_divider: u32,
    pub pidfile: PathBuf,
}

pub fn parse_file(path: &std::path::Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parser::parse(&text)
}
