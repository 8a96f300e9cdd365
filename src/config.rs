//! TOML configuration for the pipeline context.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::io::{Io, OutputMode};
use crate::output::{DEFAULT_ENDLINE, WBUFSZ_ETHER, WBUFSZ_MAX};

/// Process-wide pipeline policy, loadable from a TOML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// "stripe" (default) or "mirror".
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Close each output every N payloads. 0 disables.
    #[serde(default)]
    pub count: u64,
    /// Close each output every N seconds, aligned to epoch multiples.
    /// 0 disables.
    #[serde(default)]
    pub interval: u64,
    /// Presentation line continuation string.
    #[serde(default = "PipelineConfig::default_endline")]
    pub endline: String,
    /// Suppress presentation header lines.
    #[serde(default)]
    pub quiet: bool,
    /// zlib-compress emitted containers.
    #[serde(default)]
    pub zlibout: bool,
    /// Verbosity level; higher means chattier counter logging.
    #[serde(default)]
    pub debug: i32,
    /// Stamp outgoing payloads' source field.
    #[serde(default)]
    pub source: Option<u32>,
    #[serde(default)]
    pub operator: Option<u32>,
    #[serde(default)]
    pub group: Option<u32>,
    /// Datagram output MTU budget.
    #[serde(default = "PipelineConfig::default_mtu")]
    pub mtu: usize,
    /// Byte-stream output buffer size.
    #[serde(default = "PipelineConfig::default_bufsz")]
    pub bufsz: usize,
}

impl PipelineConfig {
    fn default_endline() -> String {
        DEFAULT_ENDLINE.to_owned()
    }

    fn default_mtu() -> usize {
        WBUFSZ_ETHER
    }

    fn default_bufsz() -> usize {
        WBUFSZ_MAX
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Install the context-wide options on an [`Io`].
    pub fn apply(&self, io: &mut Io) {
        io.set_output_mode(self.output_mode);
        io.set_count(self.count);
        io.set_interval(self.interval);
        io.set_endline(&self.endline);
        io.set_quiet(self.quiet);
        io.set_zlibout(self.zlibout);
        io.set_debug(self.debug);
        io.set_source(self.source);
        io.set_operator(self.operator);
        io.set_group(self.group);
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::Stripe,
            count: 0,
            interval: 0,
            endline: Self::default_endline(),
            quiet: false,
            zlibout: false,
            debug: 0,
            source: None,
            operator: None,
            group: None,
            mtu: Self::default_mtu(),
            bufsz: Self::default_bufsz(),
        }
    }
}
