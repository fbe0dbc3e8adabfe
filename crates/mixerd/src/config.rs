// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

use crate::mapping::{FileMappingSource, Mapping, MappingSource};

/// Desktop companion daemon for a hardware audio mixer.
#[derive(Debug, Parser)]
#[command(name = "mixerd", version, about)]
pub struct Config {
    /// Path to the mapping/configuration JSON file (spec §6).
    #[arg(long, env = "MIXERD_MAPPING_FILE")]
    pub mapping_file: PathBuf,

    /// Serial port device path, overriding the mapping file's
    /// `connection.serial_port`.
    #[arg(long, env = "MIXERD_SERIAL_PORT")]
    pub serial_port: Option<String>,

    /// Serial baud rate, overriding `connection.serial_baud`.
    #[arg(long, env = "MIXERD_SERIAL_BAUD")]
    pub serial_baud: Option<u32>,

    /// Device SSE URL, overriding `connection.sse_url`.
    #[arg(long, env = "MIXERD_SSE_URL")]
    pub sse_url: Option<String>,

    /// Relay server port (0 disables the relay), overriding
    /// `connection.relay_port`.
    #[arg(long, env = "MIXERD_RELAY_PORT")]
    pub relay_port: Option<u16>,

    /// Host address the relay server binds to.
    #[arg(long, env = "MIXERD_RELAY_HOST", default_value = "0.0.0.0")]
    pub relay_host: String,

    /// Log format (json or text).
    #[arg(long, env = "MIXERD_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MIXERD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Disable filesystem watching of the mapping file; reload only on
    /// SIGHUP.
    #[arg(long, env = "MIXERD_NO_WATCH")]
    pub no_watch: bool,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.log_format != "json" && self.log_format != "text" {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }
        if "trace,debug,info,warn,error".split(',').all(|l| l != self.log_level) {
            anyhow::bail!("invalid log level: {}", self.log_level);
        }
        Ok(())
    }

    /// Load the mapping file and overlay any CLI/env connection overrides
    /// (spec §6: the mapping's `connection` block is the baseline; flags
    /// win when present).
    pub async fn bootstrap_mapping(&self) -> anyhow::Result<Mapping> {
        let source = FileMappingSource::new(self.mapping_file.clone());
        let mut mapping = source.load().await?;

        if self.serial_port.is_some() {
            mapping.connection.serial_port = self.serial_port.clone();
        }
        if self.serial_baud.is_some() {
            mapping.connection.serial_baud = self.serial_baud;
        }
        if self.sse_url.is_some() {
            mapping.connection.sse_url = self.sse_url.clone();
        }
        if self.relay_port.is_some() {
            mapping.connection.relay_port = self.relay_port;
        }

        Ok(mapping)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
