//! shim-httpd CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the shim-httpd
//! application.

use clap::Parser;
use shim_json::{DataFormat, LoopMode};
use std::net::SocketAddr;
use std::path::PathBuf;

/// shim-httpd CLI arguments.
#[derive(Parser, Debug, Clone, Eq, PartialEq, Hash)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Listen address for the HTTP server
    #[clap(long, default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,
    /// Device used to map the register windows
    #[clap(long, default_value = "/dev/mem")]
    pub mem_device: PathBuf,
    /// CSV file with the ADC bias table, loaded at start-up if it exists
    #[clap(long)]
    pub calibration_file: Option<PathBuf>,
    /// Directory for relative script and output paths
    #[clap(long, default_value = ".")]
    pub output_dir: PathBuf,
    /// Expansion of ADC loop markers (unroll or hardware)
    #[clap(long, default_value = "unroll")]
    pub loop_mode: LoopMode,
    /// Default output format of data streams (ascii or binary)
    #[clap(long, default_value = "ascii")]
    pub data_format: DataFormat,
    /// Default trigger lockout in clock cycles
    #[clap(long, default_value_t = 50000)]
    pub lockout: u32,
}
