//! System control and status registers.
//!
//! The system control window holds the global enable, the FIFO reset masks,
//! the over-current integrator settings and the SPI polarity settings. The
//! system status window holds the hardware status word, the status words of
//! every FIFO, the trigger counter and a bank of debug registers.

use crate::fifo::{decode_fifo_status, FifoStatus};
use crate::mmio::RegisterAccess;
use crate::regs::{self, ctrl, status};
use std::sync::Arc;

/// System control and status registers.
#[derive(Debug, Clone)]
pub struct System {
    ctrl: Arc<dyn RegisterAccess>,
    status: Arc<dyn RegisterAccess>,
}

/// Decoded hardware status word.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct HwStatus {
    /// State machine state (bits 3:0).
    pub state: u8,
    /// Status or error code (bits 28:4).
    pub code: u32,
    /// Board the code refers to (bits 31:29).
    pub board: u8,
}

impl HwStatus {
    /// Decodes a hardware status word.
    pub fn decode(word: u32) -> HwStatus {
        HwStatus {
            state: (word & 0xf) as u8,
            code: (word >> 4) & ((1 << 25) - 1),
            board: (word >> 29) as u8,
        }
    }
}

macro_rules! ctrl_getset {
    ($attribute:ident, $offset:expr, bool) => {
        paste::paste! {
            #[doc = concat!("Returns the value of the `", stringify!($attribute),
                            "` control register.")]
            pub fn $attribute(&self) -> bool {
                self.read_ctrl($offset) != 0
            }

            #[doc = concat!("Sets the value of the `", stringify!($attribute),
                            "` control register.")]
            pub fn [<set_ $attribute>](&self, value: bool) {
                tracing::debug!(value, "setting {}", stringify!($attribute));
                self.write_ctrl($offset, u32::from(value));
            }
        }
    };
    ($attribute:ident, $offset:expr, u32) => {
        paste::paste! {
            #[doc = concat!("Returns the value of the `", stringify!($attribute),
                            "` control register.")]
            pub fn $attribute(&self) -> u32 {
                self.read_ctrl($offset)
            }

            #[doc = concat!("Sets the value of the `", stringify!($attribute),
                            "` control register.")]
            pub fn [<set_ $attribute>](&self, value: u32) {
                tracing::debug!(value, "setting {}", stringify!($attribute));
                self.write_ctrl($offset, value);
            }
        }
    };
}

impl System {
    /// Creates the system registers from the control and status windows.
    pub fn new(ctrl: Arc<dyn RegisterAccess>, status: Arc<dyn RegisterAccess>) -> System {
        System { ctrl, status }
    }

    fn read_ctrl(&self, byte_offset: usize) -> u32 {
        self.ctrl.read(byte_offset / 4)
    }

    fn write_ctrl(&self, byte_offset: usize, value: u32) {
        self.ctrl.write(byte_offset / 4, value)
    }

    ctrl_getset!(enable, ctrl::ENABLE, bool);
    ctrl_getset!(integrator_threshold, ctrl::INTEGRATOR_THRESHOLD, u32);
    ctrl_getset!(integrator_window, ctrl::INTEGRATOR_WINDOW, u32);
    ctrl_getset!(integrator_enable, ctrl::INTEGRATOR_ENABLE, bool);
    ctrl_getset!(boot_test_skip, ctrl::BOOT_TEST_SKIP, u32);
    ctrl_getset!(debug, ctrl::DEBUG, u32);
    ctrl_getset!(mosi_pol, ctrl::MOSI_POL, bool);
    ctrl_getset!(miso_pol, ctrl::MISO_POL, bool);

    /// Resets FIFOs.
    ///
    /// `cmd_mask` and `data_mask` select the command and data FIFOs to reset
    /// (see [`regs::reset_bit_dac`], [`regs::reset_bit_adc`] and
    /// [`regs::RESET_BIT_TRIGGER`]). The reset bits are pulsed: they are set
    /// and then cleared.
    pub fn reset_buffers(&self, cmd_mask: u32, data_mask: u32) {
        tracing::info!(
            cmd_mask = %format!("{cmd_mask:#07x}"),
            data_mask = %format!("{data_mask:#07x}"),
            "resetting buffers"
        );
        self.write_ctrl(ctrl::CMD_BUF_RESET, cmd_mask);
        self.write_ctrl(ctrl::DATA_BUF_RESET, data_mask);
        self.write_ctrl(ctrl::CMD_BUF_RESET, 0);
        self.write_ctrl(ctrl::DATA_BUF_RESET, 0);
    }

    /// Resets every FIFO in the design.
    pub fn reset_all_buffers(&self) {
        self.reset_buffers(regs::RESET_ALL, regs::RESET_ALL);
    }

    /// Returns the decoded hardware status word.
    pub fn hw_status(&self) -> HwStatus {
        HwStatus::decode(self.status.read(status::HW_STATUS))
    }

    /// Returns the status of the FIFO whose status word is at `index`.
    ///
    /// See [`regs::status`] for the indices.
    pub fn fifo_status(&self, index: usize) -> FifoStatus {
        decode_fifo_status(self.status.read(index))
    }

    /// Returns the number of external triggers counted since the last reset.
    pub fn trigger_count(&self) -> u32 {
        self.status.read(status::TRIG_COUNT)
    }

    /// Returns the values of the debug registers.
    pub fn debug_registers(&self) -> [u32; status::NUM_DEBUG] {
        std::array::from_fn(|n| self.status.read(status::DEBUG_FIRST + n))
    }

    /// Returns the control register settings.
    pub fn json(&self) -> shim_json::SystemControl {
        shim_json::SystemControl {
            enable: self.enable(),
            integrator_threshold: self.integrator_threshold(),
            integrator_window: self.integrator_window(),
            integrator_enable: self.integrator_enable(),
            boot_test_skip: self.boot_test_skip(),
            debug: self.debug(),
            mosi_pol: self.mosi_pol(),
            miso_pol: self.miso_pol(),
        }
    }

    /// Applies a PATCH of the control registers.
    pub fn patch(&self, patch: &shim_json::PatchSystemControl) {
        if let Some(value) = patch.integrator_threshold {
            self.set_integrator_threshold(value);
        }
        if let Some(value) = patch.integrator_window {
            self.set_integrator_window(value);
        }
        if let Some(value) = patch.integrator_enable {
            self.set_integrator_enable(value);
        }
        if let Some(value) = patch.boot_test_skip {
            self.set_boot_test_skip(value);
        }
        if let Some(value) = patch.debug {
            self.set_debug(value);
        }
        if let Some(value) = patch.mosi_pol {
            self.set_mosi_pol(value);
        }
        if let Some(value) = patch.miso_pol {
            self.set_miso_pol(value);
        }
        if let Some(reset) = patch.reset {
            self.reset_buffers(reset.cmd_mask, reset.data_mask);
        }
        // enable last, so that the settings above are in place when the
        // system starts
        if let Some(value) = patch.enable {
            self.set_enable(value);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimRegisters;

    fn system() -> (System, Arc<SimRegisters>, Arc<SimRegisters>) {
        let ctrl = SimRegisters::new(regs::SYS_CTRL_WORDS);
        let status = SimRegisters::new(regs::SYS_STS_WORDS);
        (System::new(ctrl.clone(), status.clone()), ctrl, status)
    }

    #[test]
    fn control_registers() {
        let (system, ctrl_regs, _) = system();
        system.set_enable(true);
        system.set_integrator_window(5000);
        assert!(system.enable());
        assert_eq!(ctrl_regs.get(ctrl::ENABLE / 4), 1);
        assert_eq!(ctrl_regs.get(ctrl::INTEGRATOR_WINDOW / 4), 5000);
        assert_eq!(system.integrator_window(), 5000);
    }

    #[test]
    fn reset_is_pulsed() {
        let (system, ctrl_regs, _) = system();
        system.reset_all_buffers();
        assert_eq!(ctrl_regs.get(ctrl::CMD_BUF_RESET / 4), 0);
        let writes = ctrl_regs.writes();
        assert!(writes.contains(&(ctrl::CMD_BUF_RESET / 4, regs::RESET_ALL)));
        assert!(writes.contains(&(ctrl::DATA_BUF_RESET / 4, regs::RESET_ALL)));
    }

    #[test]
    fn hw_status_fields() {
        let (system, _, sts) = system();
        sts.set(status::HW_STATUS, (5 << 29) | (0x123 << 4) | 0x3);
        assert_eq!(
            system.hw_status(),
            HwStatus {
                state: 3,
                code: 0x123,
                board: 5
            }
        );
        sts.set(status::TRIG_COUNT, 42);
        assert_eq!(system.trigger_count(), 42);
        sts.set(status::adc_cmd(2), 0x8000_0010);
        let fifo = system.fifo_status(status::adc_cmd(2));
        assert!(fifo.present);
        assert_eq!(fifo.word_count, 16);
    }

    #[test]
    fn patch_sets_enable_last() {
        let (system, ctrl_regs, _) = system();
        system.patch(&shim_json::PatchSystemControl {
            enable: Some(true),
            debug: Some(2),
            ..Default::default()
        });
        let writes = ctrl_regs.writes();
        assert_eq!(writes.last(), Some(&(ctrl::ENABLE / 4, 1)));
        assert_eq!(system.debug(), 2);
    }
}
