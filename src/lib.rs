//! shim-httpd drives the shim FPGA design that connects up to eight DAC boards
//! and eight ADC boards to a common trigger unit. It streams waveform command
//! scripts into the DAC and ADC command FIFOs, captures ADC samples and trigger
//! timestamps to files, calibrates the DAC offsets and ADC biases, and
//! synchronizes whole waveform tests to external triggers. Everything is
//! controlled through a RESTful API.

#![warn(missing_docs)]

pub mod app;
pub mod args;
pub mod calibration;
pub mod fifo;
pub mod httpd;
pub mod mmio;
pub mod protocol;
pub mod regs;
pub mod script;
pub mod shim;
pub mod stream;
pub mod system;
pub mod trigger;
pub mod waveform;

#[cfg(test)]
mod sim;
