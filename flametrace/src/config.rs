//! Optional TOML configuration mapping cpus to ordered trace files.
//!
//! A processor trace is usually captured per cpu, and a cpu's files must
//! be replayed in capture order while different cpus interleave by
//! timestamp. The config expresses that grouping:
//!
//! ```toml
//! [[cpu]]
//! id = 0
//! traces = ["cpu0-a.trace", "cpu0-b.trace"]
//!
//! [[cpu]]
//! id = 1
//! traces = ["cpu1.trace"]
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cpu: Vec<CpuTraces>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CpuTraces {
    pub id: u64,
    #[serde(default)]
    pub traces: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
