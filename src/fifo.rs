//! Hardware FIFOs.
//!
//! Every FIFO of the design has a status word in the system status window and
//! a data port in the FIFO window of its subsystem. This module decodes status
//! words and gives the [`Fifo`] abstraction used by the streaming engine,
//! calibration and the orchestrator.

use crate::mmio::RegisterAccess;
use std::sync::Arc;

/// Decoded FIFO status word.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct FifoStatus {
    /// The FIFO exists in the hardware.
    pub present: bool,
    /// Number of words currently held.
    pub word_count: u32,
    /// The FIFO is full.
    pub full: bool,
    /// The FIFO is almost full.
    pub almost_full: bool,
    /// The FIFO is empty.
    pub empty: bool,
    /// The FIFO is almost empty.
    pub almost_empty: bool,
}

const COUNT_MASK: u32 = (1 << 27) - 1;
const FULL: u32 = 1 << 27;
const ALMOST_FULL: u32 = 1 << 28;
const EMPTY: u32 = 1 << 29;
const ALMOST_EMPTY: u32 = 1 << 30;
const PRESENT: u32 = 1 << 31;

/// Decodes a FIFO status word.
pub fn decode_fifo_status(word: u32) -> FifoStatus {
    FifoStatus {
        present: word & PRESENT != 0,
        word_count: word & COUNT_MASK,
        full: word & FULL != 0,
        almost_full: word & ALMOST_FULL != 0,
        empty: word & EMPTY != 0,
        almost_empty: word & ALMOST_EMPTY != 0,
    }
}

impl FifoStatus {
    /// Encodes the status back into a status word.
    pub fn to_word(&self) -> u32 {
        (self.word_count & COUNT_MASK)
            | if self.full { FULL } else { 0 }
            | if self.almost_full { ALMOST_FULL } else { 0 }
            | if self.empty { EMPTY } else { 0 }
            | if self.almost_empty { ALMOST_EMPTY } else { 0 }
            | if self.present { PRESENT } else { 0 }
    }

    /// Returns the number of free words in a FIFO of the given capacity.
    pub fn free(&self, capacity: u32) -> u32 {
        capacity.saturating_sub(self.word_count)
    }
}

impl From<FifoStatus> for shim_json::FifoStatus {
    fn from(status: FifoStatus) -> shim_json::FifoStatus {
        shim_json::FifoStatus {
            present: status.present,
            word_count: status.word_count,
            full: status.full,
            almost_full: status.almost_full,
            empty: status.empty,
            almost_empty: status.almost_empty,
        }
    }
}

/// Identifies one of the hardware FIFOs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FifoId {
    /// DAC command FIFO of a board.
    DacCmd(u8),
    /// DAC data (readback) FIFO of a board.
    DacData(u8),
    /// ADC command FIFO of a board.
    AdcCmd(u8),
    /// ADC data FIFO of a board.
    AdcData(u8),
    /// Trigger command FIFO.
    TrigCmd,
    /// Trigger data FIFO.
    TrigData,
}

impl std::fmt::Display for FifoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            FifoId::DacCmd(board) => write!(f, "DAC {board} command FIFO"),
            FifoId::DacData(board) => write!(f, "DAC {board} data FIFO"),
            FifoId::AdcCmd(board) => write!(f, "ADC {board} command FIFO"),
            FifoId::AdcData(board) => write!(f, "ADC {board} data FIFO"),
            FifoId::TrigCmd => write!(f, "trigger command FIFO"),
            FifoId::TrigData => write!(f, "trigger data FIFO"),
        }
    }
}

/// Hardware FIFO.
///
/// A FIFO is a single-writer single-reader channel between the processor and
/// the FPGA. Command FIFOs are written by the processor and data FIFOs are
/// read by it.
pub trait Fifo: std::fmt::Debug + Send + Sync {
    /// Reads the current status of the FIFO from the hardware.
    fn status(&self) -> FifoStatus;
    /// Returns the depth of the FIFO in words.
    fn capacity(&self) -> u32;
    /// Pushes a word into the FIFO.
    fn write(&self, word: u32);
    /// Pops a word from the FIFO.
    fn read(&self) -> u32;
}

/// Register-backed FIFO.
///
/// The FIFO data port is a word in one register window, and its status is a
/// word in the system status window.
#[derive(Debug, Clone)]
pub struct HwFifo {
    port: Arc<dyn RegisterAccess>,
    port_offset: usize,
    status: Arc<dyn RegisterAccess>,
    status_offset: usize,
    capacity: u32,
}

impl HwFifo {
    /// Creates a register-backed FIFO.
    pub fn new(
        port: Arc<dyn RegisterAccess>,
        port_offset: usize,
        status: Arc<dyn RegisterAccess>,
        status_offset: usize,
        capacity: u32,
    ) -> HwFifo {
        HwFifo {
            port,
            port_offset,
            status,
            status_offset,
            capacity,
        }
    }
}

impl Fifo for HwFifo {
    fn status(&self) -> FifoStatus {
        decode_fifo_status(self.status.read(self.status_offset))
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn write(&self, word: u32) {
        tracing::trace!(word = %format!("{word:#010x}"), "fifo write");
        self.port.write(self.port_offset, word);
    }

    fn read(&self) -> u32 {
        self.port.read(self.port_offset)
    }
}
