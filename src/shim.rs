//! Shim FPGA design.
//!
//! This module contains the userspace driver for the shim FPGA design: the
//! owner of every register window, and per-subsystem handles that issue single
//! commands to the DAC boards, the ADC boards and the trigger unit.

use crate::fifo::{Fifo, FifoId, FifoStatus, HwFifo};
use crate::mmio::{RegisterAccess, RegisterWindow};
use crate::protocol::{self, check_board, BoardWord, EncodeError};
use crate::regs::{self, depth, status};
use crate::system::System;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Interval between polls of a FIFO while waiting for data.
pub const DATA_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Failure to issue a single command.
#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    /// A command field is out of range.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The hardware reports that the FIFO does not exist.
    #[error("{0} is not present")]
    FifoAbsent(FifoId),
    /// The FIFO has no room for the command.
    #[error("{fifo} has no room for {words} words")]
    FifoFull {
        /// FIFO.
        fifo: FifoId,
        /// Number of words that were to be written.
        words: usize,
    },
    /// No data arrived in time.
    #[error("timed out waiting for data on {0}")]
    Timeout(FifoId),
}

/// Named hardware FIFO.
#[derive(Debug, Clone)]
pub struct Port {
    id: FifoId,
    fifo: Arc<dyn Fifo>,
}

impl Port {
    /// Creates a port.
    pub fn new(id: FifoId, fifo: Arc<dyn Fifo>) -> Port {
        Port { id, fifo }
    }

    /// Returns the identifier of the FIFO.
    pub fn id(&self) -> FifoId {
        self.id
    }

    /// Returns the FIFO.
    pub fn fifo(&self) -> &Arc<dyn Fifo> {
        &self.fifo
    }

    /// Reads the FIFO status.
    pub fn status(&self) -> FifoStatus {
        self.fifo.status()
    }

    /// Returns whether the hardware reports the FIFO as present.
    pub fn present(&self) -> bool {
        self.fifo.status().present
    }

    /// Writes a group of words into the FIFO.
    ///
    /// Nothing is written unless the FIFO is present and has room for all the
    /// words.
    pub fn send(&self, words: &[u32]) -> Result<(), CommandError> {
        let status = self.fifo.status();
        if !status.present {
            return Err(CommandError::FifoAbsent(self.id));
        }
        if (status.free(self.fifo.capacity()) as usize) < words.len() {
            return Err(CommandError::FifoFull {
                fifo: self.id,
                words: words.len(),
            });
        }
        for &word in words {
            self.fifo.write(word);
        }
        Ok(())
    }

    /// Waits for a word to be available and reads it.
    ///
    /// The FIFO is polled every [`DATA_POLL_INTERVAL`] until `timeout`
    /// elapses.
    pub async fn receive(&self, timeout: Duration) -> Result<u32, CommandError> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.fifo.status();
            if !status.present {
                return Err(CommandError::FifoAbsent(self.id));
            }
            if status.word_count > 0 {
                return Ok(self.fifo.read());
            }
            if Instant::now() >= deadline {
                return Err(CommandError::Timeout(self.id));
            }
            tokio::time::sleep(DATA_POLL_INTERVAL).await;
        }
    }

    /// Discards every word currently held by the FIFO.
    ///
    /// Returns the number of discarded words.
    pub fn drain(&self) -> usize {
        let mut discarded = 0;
        loop {
            let status = self.fifo.status();
            if !status.present || status.word_count == 0 {
                return discarded;
            }
            for _ in 0..status.word_count {
                self.fifo.read();
            }
            discarded += status.word_count as usize;
        }
    }
}

fn words(board_words: &[BoardWord]) -> Vec<u32> {
    board_words.iter().map(|w| w.word).collect()
}

/// DAC board.
#[derive(Debug, Clone)]
pub struct Dac {
    board: u8,
    cmd: Port,
    data: Port,
}

impl Dac {
    /// Creates a DAC board handle from its command and data FIFOs.
    pub fn new(board: u8, cmd: Arc<dyn Fifo>, data: Arc<dyn Fifo>) -> Dac {
        Dac {
            board,
            cmd: Port::new(FifoId::DacCmd(board), cmd),
            data: Port::new(FifoId::DacData(board), data),
        }
    }

    /// Returns the board index.
    pub fn board(&self) -> u8 {
        self.board
    }

    /// Returns the command FIFO.
    pub fn cmd(&self) -> &Port {
        &self.cmd
    }

    /// Returns the data (readback) FIFO.
    pub fn data(&self) -> &Port {
        &self.data
    }

    /// Sets the output of one channel.
    pub fn write_channel(&self, channel: u8, value: i32) -> Result<(), CommandError> {
        let word = protocol::dac::write_channel(self.board, channel, value)?;
        tracing::trace!(board = self.board, channel, value, "DAC write channel");
        self.cmd.send(&[word.word])
    }

    /// Sets the outputs of all the channels after a trigger wait or delay.
    pub fn write(
        &self,
        trig: bool,
        cont: bool,
        value: u32,
        channels: &[i32; 8],
    ) -> Result<(), CommandError> {
        let command = protocol::dac::write(self.board, trig, cont, value, channels)?;
        self.cmd.send(&words(&command))
    }

    /// Waits for triggers or delays.
    pub fn noop(&self, trig: bool, cont: bool, value: u32) -> Result<(), CommandError> {
        let word = protocol::dac::noop(self.board, trig, cont, value)?;
        self.cmd.send(&[word.word])
    }

    /// Sets all the channels to zero.
    pub fn zero(&self) -> Result<(), CommandError> {
        self.cmd.send(&[protocol::dac::zero(self.board)?.word])
    }

    /// Sets the calibration value of one channel.
    pub fn set_cal(&self, channel: u8, cal: i32) -> Result<(), CommandError> {
        let word = protocol::dac::set_cal(self.board, channel, cal)?;
        tracing::debug!(board = self.board, channel, cal, "DAC set calibration");
        self.cmd.send(&[word.word])
    }

    /// Reads back the calibration value of one channel.
    pub async fn get_cal(&self, channel: u8, timeout: Duration) -> Result<i32, CommandError> {
        let word = protocol::dac::get_cal(self.board, channel)?;
        self.data.drain();
        self.cmd.send(&[word.word])?;
        let readback = self.data.receive(timeout).await?;
        Ok(protocol::dac::decode_cal_readback(readback))
    }

    /// Flushes the command FIFO and aborts the current command.
    pub fn cancel(&self) -> Result<(), CommandError> {
        tracing::info!(board = self.board, "DAC cancel");
        self.cmd.send(&[protocol::dac::cancel(self.board)?.word])
    }
}

/// ADC board.
#[derive(Debug, Clone)]
pub struct Adc {
    board: u8,
    cmd: Port,
    data: Port,
}

impl Adc {
    /// Creates an ADC board handle from its command and data FIFOs.
    pub fn new(board: u8, cmd: Arc<dyn Fifo>, data: Arc<dyn Fifo>) -> Adc {
        Adc {
            board,
            cmd: Port::new(FifoId::AdcCmd(board), cmd),
            data: Port::new(FifoId::AdcData(board), data),
        }
    }

    /// Returns the board index.
    pub fn board(&self) -> u8 {
        self.board
    }

    /// Returns the command FIFO.
    pub fn cmd(&self) -> &Port {
        &self.cmd
    }

    /// Returns the data FIFO.
    pub fn data(&self) -> &Port {
        &self.data
    }

    /// Samples one channel and returns the signed sample.
    pub async fn read_channel(&self, channel: u8, timeout: Duration) -> Result<i32, CommandError> {
        let word = protocol::adc::read_channel(self.board, channel)?;
        self.cmd.send(&[word.word])?;
        let data = self.data.receive(timeout).await?;
        let [sample, _] = protocol::unpack_samples(data);
        Ok(protocol::offset_to_signed(sample))
    }

    /// Waits for triggers or delays.
    pub fn noop(&self, trig: bool, cont: bool, value: u32) -> Result<(), CommandError> {
        let word = protocol::adc::noop(self.board, trig, cont, value)?;
        self.cmd.send(&[word.word])
    }

    /// Sets the channel sampling order.
    pub fn set_order(&self, order: &[u8; 8]) -> Result<(), CommandError> {
        let word = protocol::adc::set_order(self.board, false, order)?;
        self.cmd.send(&[word.word])
    }

    /// Flushes the command FIFO and aborts the current command.
    pub fn cancel(&self) -> Result<(), CommandError> {
        tracing::info!(board = self.board, "ADC cancel");
        self.cmd.send(&[protocol::adc::cancel(self.board)?.word])
    }
}

/// Trigger unit.
#[derive(Debug, Clone)]
pub struct Trigger {
    cmd: Port,
    data: Port,
    system: System,
}

impl Trigger {
    /// Creates a trigger unit handle.
    ///
    /// The trigger counter is read from the system status registers.
    pub fn new(cmd: Arc<dyn Fifo>, data: Arc<dyn Fifo>, system: System) -> Trigger {
        Trigger {
            cmd: Port::new(FifoId::TrigCmd, cmd),
            data: Port::new(FifoId::TrigData, data),
            system,
        }
    }

    /// Returns the command FIFO.
    pub fn cmd(&self) -> &Port {
        &self.cmd
    }

    /// Returns the data (timestamp) FIFO.
    pub fn data(&self) -> &Port {
        &self.data
    }

    /// Synchronizes the trigger state of every subsystem.
    pub fn sync_channels(&self, reset_counter: bool) -> Result<(), CommandError> {
        tracing::info!(reset_counter, "trigger sync channels");
        self.cmd.send(&[protocol::trigger::sync_channels(reset_counter)])
    }

    /// Sets the minimum number of clock cycles between accepted triggers.
    pub fn set_lockout(&self, cycles: u32) -> Result<(), CommandError> {
        tracing::info!(cycles, "trigger set lockout");
        self.cmd.send(&[protocol::trigger::set_lockout(cycles)?])
    }

    /// Arms the counting of `count` external triggers.
    pub fn expect_ext(&self, count: u32) -> Result<(), CommandError> {
        tracing::info!(count, "trigger expect external");
        self.cmd.send(&[protocol::trigger::expect_ext(count)?])
    }

    /// Delays the following trigger command.
    pub fn delay(&self, cycles: u32) -> Result<(), CommandError> {
        self.cmd.send(&[protocol::trigger::delay(cycles)?])
    }

    /// Issues `count` triggers.
    pub fn force_trigger(&self, count: u32) -> Result<(), CommandError> {
        tracing::info!(count, "forcing trigger");
        self.cmd.send(&[protocol::trigger::force_trigger(count)?])
    }

    /// Flushes the command FIFO and aborts the current command.
    pub fn cancel(&self) -> Result<(), CommandError> {
        tracing::info!("trigger cancel");
        self.cmd.send(&[protocol::trigger::cancel()])
    }

    /// Returns the number of external triggers counted by the hardware.
    pub fn count(&self) -> u32 {
        self.system.trigger_count()
    }
}

/// DAC and ADC of one board slot.
#[derive(Debug, Clone)]
pub struct Board {
    /// DAC board.
    pub dac: Dac,
    /// ADC board.
    pub adc: Adc,
}

/// Boards that the hardware reports as present.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ConnectedBoards {
    /// Boards whose DAC command FIFO is present.
    pub dac: Vec<u8>,
    /// Boards whose ADC command and data FIFOs are present.
    pub adc: Vec<u8>,
}

impl ConnectedBoards {
    /// Boards with both DAC and ADC present.
    pub fn both(&self) -> Vec<u8> {
        self.dac
            .iter()
            .copied()
            .filter(|b| self.adc.contains(b))
            .collect()
    }
}

/// Shim FPGA design.
///
/// This struct owns the register windows of the design and gives access to
/// the DAC and ADC boards and to the trigger unit.
#[derive(Debug)]
pub struct Shim {
    system: System,
    boards: Vec<Board>,
    trigger: Trigger,
}

impl Shim {
    /// Maps the register windows of the shim design.
    ///
    /// The windows are mapped through `device` (normally `/dev/mem`).
    pub async fn take(device: &Path) -> Result<Shim> {
        let ctrl = RegisterWindow::map(
            device,
            regs::SYS_CTRL_BASE,
            regs::SYS_CTRL_WORDS,
            "sys-ctrl",
        )
        .await
        .context("failed to map system control registers")?;
        let sts = RegisterWindow::map(device, regs::SYS_STS_BASE, regs::SYS_STS_WORDS, "sys-sts")
            .await
            .context("failed to map system status registers")?;
        let ctrl: Arc<dyn RegisterAccess> = Arc::new(ctrl);
        let sts: Arc<dyn RegisterAccess> = Arc::new(sts);
        let system = System::new(ctrl, Arc::clone(&sts));

        let fifo = |port: &Arc<dyn RegisterAccess>, status_index, capacity| -> Arc<dyn Fifo> {
            Arc::new(HwFifo::new(
                Arc::clone(port),
                0,
                Arc::clone(&sts),
                status_index,
                capacity,
            ))
        };

        let mut boards = Vec::with_capacity(regs::NUM_BOARDS);
        for n in 0..regs::NUM_BOARDS {
            let board = n as u8;
            let dac: Arc<dyn RegisterAccess> = Arc::new(
                RegisterWindow::map(
                    device,
                    regs::DAC_FIFO_BASE + n * regs::FIFO_WINDOW_STRIDE,
                    regs::FIFO_WINDOW_WORDS,
                    &format!("dac{n}"),
                )
                .await
                .with_context(|| format!("failed to map DAC {n} FIFO"))?,
            );
            let adc: Arc<dyn RegisterAccess> = Arc::new(
                RegisterWindow::map(
                    device,
                    regs::ADC_FIFO_BASE + n * regs::FIFO_WINDOW_STRIDE,
                    regs::FIFO_WINDOW_WORDS,
                    &format!("adc{n}"),
                )
                .await
                .with_context(|| format!("failed to map ADC {n} FIFO"))?,
            );
            boards.push(Board {
                dac: Dac::new(
                    board,
                    fifo(&dac, status::dac_cmd(n), depth::DAC_CMD),
                    fifo(&dac, status::dac_data(n), depth::DAC_DATA),
                ),
                adc: Adc::new(
                    board,
                    fifo(&adc, status::adc_cmd(n), depth::ADC_CMD),
                    fifo(&adc, status::adc_data(n), depth::ADC_DATA),
                ),
            });
        }
        let trig: Arc<dyn RegisterAccess> = Arc::new(
            RegisterWindow::map(
                device,
                regs::TRIGGER_FIFO_BASE,
                regs::FIFO_WINDOW_WORDS,
                "trigger",
            )
            .await
            .context("failed to map trigger FIFO")?,
        );
        let trigger = Trigger::new(
            fifo(&trig, status::TRIG_CMD, depth::TRIG_CMD),
            fifo(&trig, status::TRIG_DATA, depth::TRIG_DATA),
            system.clone(),
        );
        let shim = Shim::from_parts(system, boards, trigger);
        shim.log_open();
        Ok(shim)
    }

    /// Builds the design from already constructed parts.
    ///
    /// # Panics
    ///
    /// This function panics if `boards` does not contain exactly
    /// [`regs::NUM_BOARDS`] boards.
    pub fn from_parts(system: System, boards: Vec<Board>, trigger: Trigger) -> Shim {
        assert_eq!(boards.len(), regs::NUM_BOARDS);
        Shim {
            system,
            boards,
            trigger,
        }
    }

    fn log_open(&self) {
        let connected = self.connected_boards();
        let hw_status = self.system.hw_status();
        tracing::info!(
            dac_boards = ?connected.dac,
            adc_boards = ?connected.adc,
            state = hw_status.state,
            code = hw_status.code,
            "opened shim design"
        );
    }

    /// Gives access to the system control and status registers.
    pub fn system(&self) -> &System {
        &self.system
    }

    /// Returns the DAC of a board.
    pub fn dac(&self, board: u8) -> Result<&Dac, EncodeError> {
        Ok(&self.boards[usize::from(check_board(board)?)].dac)
    }

    /// Returns the ADC of a board.
    pub fn adc(&self, board: u8) -> Result<&Adc, EncodeError> {
        Ok(&self.boards[usize::from(check_board(board)?)].adc)
    }

    /// Returns the trigger unit.
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Returns a FIFO by identifier.
    pub fn port(&self, id: FifoId) -> Result<&Port, EncodeError> {
        Ok(match id {
            FifoId::DacCmd(b) => self.dac(b)?.cmd(),
            FifoId::DacData(b) => self.dac(b)?.data(),
            FifoId::AdcCmd(b) => self.adc(b)?.cmd(),
            FifoId::AdcData(b) => self.adc(b)?.data(),
            FifoId::TrigCmd => self.trigger.cmd(),
            FifoId::TrigData => self.trigger.data(),
        })
    }

    /// Discovers the boards that are connected.
    ///
    /// A board counts as connected when the hardware reports its FIFOs as
    /// present.
    pub fn connected_boards(&self) -> ConnectedBoards {
        let mut connected = ConnectedBoards::default();
        for board in &self.boards {
            if board.dac.cmd().present() {
                connected.dac.push(board.dac.board());
            }
            if board.adc.cmd().present() && board.adc.data().present() {
                connected.adc.push(board.adc.board());
            }
        }
        connected
    }

    /// Returns the status of the whole design.
    pub fn status_json(&self) -> shim_json::SystemStatus {
        let hw_status = self.system.hw_status();
        let boards = self
            .boards
            .iter()
            .map(|b| shim_json::BoardFifos {
                board: b.dac.board(),
                dac_cmd: b.dac.cmd().status().into(),
                dac_data: b.dac.data().status().into(),
                adc_cmd: b.adc.cmd().status().into(),
                adc_data: b.adc.data().status().into(),
            })
            .collect();
        shim_json::SystemStatus {
            state: hw_status.state,
            code: hw_status.code,
            board: hw_status.board,
            boards,
            trigger_cmd: self.trigger.cmd().status().into(),
            trigger_data: self.trigger.data().status().into(),
            trigger_count: self.trigger.count(),
            debug: self.system.debug_registers().to_vec(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimFifo, SimShim};

    #[tokio::test]
    async fn single_commands() {
        let sim = SimShim::builder().loopback(0).build();
        let dac = sim.shim.dac(0).unwrap();
        dac.write_channel(3, 1000).unwrap();
        assert_eq!(sim.loopback(0).dac_output(3), 1000);
        dac.set_cal(3, -12).unwrap();
        assert_eq!(dac.get_cal(3, Duration::from_millis(100)).await.unwrap(), -12);
        let adc = sim.shim.adc(0).unwrap();
        let sample = adc.read_channel(3, Duration::from_millis(100)).await.unwrap();
        assert_eq!(sample, 988);
    }

    #[test]
    fn encode_error_writes_nothing() {
        let sim = SimShim::builder().loopback(1).build();
        let dac = sim.shim.dac(1).unwrap();
        assert!(matches!(
            dac.write_channel(0, 40000),
            Err(CommandError::Encode(_))
        ));
        assert!(matches!(
            dac.write_channel(8, 0),
            Err(CommandError::Encode(_))
        ));
        assert!(sim.boards[1].dac_cmd.written().is_empty());
        assert!(sim.shim.dac(8).is_err());
    }

    #[test]
    fn absent_and_full() {
        let fifo = SimFifo::absent(4);
        let port = Port::new(FifoId::DacCmd(2), fifo.clone());
        assert!(matches!(
            port.send(&[0]),
            Err(CommandError::FifoAbsent(FifoId::DacCmd(2)))
        ));
        let fifo = SimFifo::new(4);
        fifo.fill(3);
        let port = Port::new(FifoId::AdcCmd(0), fifo.clone());
        assert!(matches!(
            port.send(&[0, 0]),
            Err(CommandError::FifoFull { words: 2, .. })
        ));
        port.send(&[7]).unwrap();
        assert_eq!(fifo.len(), 4);
        assert!(!fifo.overflowed());
    }

    #[tokio::test]
    async fn receive_times_out() {
        let port = Port::new(FifoId::AdcData(0), SimFifo::new(8));
        assert!(matches!(
            port.receive(Duration::from_millis(5)).await,
            Err(CommandError::Timeout(FifoId::AdcData(0)))
        ));
    }

    #[test]
    fn discovery() {
        let sim = SimShim::builder().loopback(0).loopback(3).build();
        let connected = sim.shim.connected_boards();
        assert_eq!(connected.dac, vec![0, 3]);
        assert_eq!(connected.adc, vec![0, 3]);
        assert_eq!(connected.both(), vec![0, 3]);
    }

    #[test]
    fn drain_discards_stale_data() {
        let fifo = SimFifo::new(8);
        fifo.push(1);
        fifo.push(2);
        let port = Port::new(FifoId::DacData(0), fifo.clone());
        assert_eq!(port.drain(), 2);
        assert_eq!(fifo.len(), 0);
    }
}
