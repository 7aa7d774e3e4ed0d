//! Shim register map.
//!
//! This module contains the physical base addresses of the register windows
//! of the shim FPGA design, the byte offsets of the system control registers,
//! the word indices of the system status registers, and the depths of the
//! hardware FIFOs.

/// Number of DAC boards (and of ADC boards) supported by the design.
pub const NUM_BOARDS: usize = 8;

/// Number of channels on each DAC or ADC board.
pub const CHANNELS_PER_BOARD: usize = 8;

/// Total number of channels (`NUM_BOARDS * CHANNELS_PER_BOARD`).
pub const NUM_CHANNELS: usize = NUM_BOARDS * CHANNELS_PER_BOARD;

/// Physical base address of the system control registers.
pub const SYS_CTRL_BASE: usize = 0x4000_0000;

/// Number of 32-bit words in the system control window.
pub const SYS_CTRL_WORDS: usize = 16;

/// Physical base address of the system status registers.
pub const SYS_STS_BASE: usize = 0x4010_0000;

/// Number of 32-bit words in the system status window.
pub const SYS_STS_WORDS: usize = 64;

/// Physical base address of the DAC FIFO window of board 0.
///
/// The window of board `n` is at `DAC_FIFO_BASE + n * FIFO_WINDOW_STRIDE`.
pub const DAC_FIFO_BASE: usize = 0x8000_0000;

/// Physical base address of the ADC FIFO window of board 0.
///
/// The window of board `n` is at `ADC_FIFO_BASE + n * FIFO_WINDOW_STRIDE`.
pub const ADC_FIFO_BASE: usize = 0x8100_0000;

/// Distance in bytes between the FIFO windows of consecutive boards.
pub const FIFO_WINDOW_STRIDE: usize = 0x1_0000;

/// Physical base address of the trigger FIFO window.
pub const TRIGGER_FIFO_BASE: usize = 0x8200_0000;

/// Number of 32-bit words in each FIFO window.
///
/// Commands are written to and data is read from word 0 of the window.
pub const FIFO_WINDOW_WORDS: usize = 1;

/// Byte offsets of the system control registers.
pub mod ctrl {
    /// System enable.
    pub const ENABLE: usize = 0;
    /// Command buffer reset mask.
    pub const CMD_BUF_RESET: usize = 4;
    /// Data buffer reset mask.
    pub const DATA_BUF_RESET: usize = 8;
    /// Over-current integrator threshold.
    pub const INTEGRATOR_THRESHOLD: usize = 12;
    /// Over-current integrator window, in clock cycles.
    pub const INTEGRATOR_WINDOW: usize = 16;
    /// Over-current integrator enable.
    pub const INTEGRATOR_ENABLE: usize = 20;
    /// Skip the boot-time board test.
    pub const BOOT_TEST_SKIP: usize = 24;
    /// Debug mode.
    pub const DEBUG: usize = 28;
    /// SPI MOSI polarity.
    pub const MOSI_POL: usize = 32;
    /// SPI MISO polarity.
    pub const MISO_POL: usize = 36;
}

/// Word indices of the system status registers.
pub mod status {
    use super::NUM_BOARDS;

    /// Hardware status word (state, code, board).
    pub const HW_STATUS: usize = 0;

    const FIFOS_PER_BOARD: usize = 4;

    /// DAC command FIFO status of a board.
    pub const fn dac_cmd(board: usize) -> usize {
        1 + FIFOS_PER_BOARD * board
    }

    /// DAC data FIFO status of a board.
    pub const fn dac_data(board: usize) -> usize {
        2 + FIFOS_PER_BOARD * board
    }

    /// ADC command FIFO status of a board.
    pub const fn adc_cmd(board: usize) -> usize {
        3 + FIFOS_PER_BOARD * board
    }

    /// ADC data FIFO status of a board.
    pub const fn adc_data(board: usize) -> usize {
        4 + FIFOS_PER_BOARD * board
    }

    /// Trigger command FIFO status.
    pub const TRIG_CMD: usize = 1 + FIFOS_PER_BOARD * NUM_BOARDS;
    /// Trigger data FIFO status.
    pub const TRIG_DATA: usize = TRIG_CMD + 1;
    /// Number of external triggers accepted since the last counter reset.
    pub const TRIG_COUNT: usize = TRIG_DATA + 1;
    /// First debug register.
    pub const DEBUG_FIRST: usize = TRIG_COUNT + 1;
    /// Number of debug registers.
    pub const NUM_DEBUG: usize = 8;
}

/// Hardware FIFO depths, in 32-bit words.
pub mod depth {
    /// DAC command FIFO.
    pub const DAC_CMD: u32 = 1024;
    /// DAC data (readback) FIFO.
    pub const DAC_DATA: u32 = 64;
    /// ADC command FIFO.
    pub const ADC_CMD: u32 = 1024;
    /// ADC data FIFO.
    pub const ADC_DATA: u32 = 1024;
    /// Trigger command FIFO.
    pub const TRIG_CMD: u32 = 64;
    /// Trigger data FIFO.
    pub const TRIG_DATA: u32 = 1024;
}

/// Bit of a buffer reset mask that corresponds to the DAC FIFOs of a board.
pub const fn reset_bit_dac(board: usize) -> u32 {
    1 << board
}

/// Bit of a buffer reset mask that corresponds to the ADC FIFOs of a board.
pub const fn reset_bit_adc(board: usize) -> u32 {
    1 << (8 + board)
}

/// Bit of a buffer reset mask that corresponds to the trigger FIFOs.
pub const RESET_BIT_TRIGGER: u32 = 1 << 16;

/// Buffer reset mask that selects every FIFO in the design.
pub const RESET_ALL: u32 = 0x1_ffff;
