//! Simulated hardware used by the unit tests.

use crate::fifo::{Fifo, FifoStatus};
use crate::mmio::RegisterAccess;
use crate::protocol::{self, AdcOp, CommandWord, DacOp, Subsystem};
use crate::regs::{self, depth};
use crate::shim::{Adc, Board, Dac, Shim, Trigger};
use crate::system::System;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Register window backed by memory, recording every write.
#[derive(Debug)]
pub struct SimRegisters {
    state: Mutex<(Vec<u32>, Vec<(usize, u32)>)>,
}

impl SimRegisters {
    pub fn new(words: usize) -> Arc<SimRegisters> {
        Arc::new(SimRegisters {
            state: Mutex::new((vec![0; words], Vec::new())),
        })
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.state.lock().unwrap().0[offset]
    }

    /// Sets a register without recording a write, as the hardware would.
    pub fn set(&self, offset: usize, value: u32) {
        self.state.lock().unwrap().0[offset] = value;
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().unwrap().1.clone()
    }
}

impl RegisterAccess for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        state.0[offset] = value;
        state.1.push((offset, value));
    }
}

#[derive(Debug, Default)]
struct SimFifoState {
    words: VecDeque<u32>,
    present: bool,
    overflowed: bool,
    written: Vec<u32>,
    max_len: usize,
}

/// Bounded FIFO with a presence flag.
///
/// Writes beyond the capacity are dropped and flag the FIFO as overflowed.
#[derive(Debug)]
pub struct SimFifo {
    capacity: u32,
    state: Mutex<SimFifoState>,
}

impl SimFifo {
    pub fn new(capacity: u32) -> Arc<SimFifo> {
        Arc::new(SimFifo {
            capacity,
            state: Mutex::new(SimFifoState {
                present: true,
                ..Default::default()
            }),
        })
    }

    pub fn absent(capacity: u32) -> Arc<SimFifo> {
        let fifo = SimFifo::new(capacity);
        fifo.set_present(false);
        fifo
    }

    pub fn set_present(&self, present: bool) {
        self.state.lock().unwrap().present = present;
    }

    /// Pushes a word from the hardware side.
    pub fn push(&self, word: u32) {
        let mut state = self.state.lock().unwrap();
        state.words.push_back(word);
        state.max_len = state.max_len.max(state.words.len());
    }

    /// Pops a word from the hardware side.
    pub fn pop(&self) -> Option<u32> {
        self.state.lock().unwrap().words.pop_front()
    }

    /// Pops `n` words from the hardware side.
    pub fn pop_n(&self, n: usize) -> Vec<u32> {
        let mut state = self.state.lock().unwrap();
        let n = n.min(state.words.len());
        state.words.drain(..n).collect()
    }

    /// Fills the FIFO with `n` filler words from the hardware side.
    pub fn fill(&self, n: usize) {
        for _ in 0..n {
            self.push(0);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().words.len()
    }

    pub fn overflowed(&self) -> bool {
        self.state.lock().unwrap().overflowed
    }

    /// Returns every word written through the [`Fifo`] interface.
    pub fn written(&self) -> Vec<u32> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn max_len(&self) -> usize {
        self.state.lock().unwrap().max_len
    }
}

impl Fifo for SimFifo {
    fn status(&self) -> FifoStatus {
        let state = self.state.lock().unwrap();
        let len = state.words.len() as u32;
        FifoStatus {
            present: state.present,
            word_count: len,
            full: len >= self.capacity,
            almost_full: len + 1 >= self.capacity,
            empty: len == 0,
            almost_empty: len <= 1,
        }
    }

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn write(&self, word: u32) {
        let mut state = self.state.lock().unwrap();
        state.written.push(word);
        if state.words.len() >= self.capacity as usize {
            state.overflowed = true;
        } else {
            state.words.push_back(word);
            state.max_len = state.max_len.max(state.words.len());
        }
    }

    fn read(&self) -> u32 {
        self.state.lock().unwrap().words.pop_front().unwrap_or(0)
    }
}

#[derive(Debug)]
struct LoopbackState {
    setpoint: [i32; 8],
    cal: [i32; 8],
    gain: [f64; 8],
    offset: [f64; 8],
    noise: [f64; 8],
    order: [u8; 8],
    samples_taken: u64,
    sample_limit: Option<u64>,
    dac_write_data: Option<Vec<u32>>,
}

/// DAC board whose outputs are wired to the inputs of the ADC board in the
/// same slot.
///
/// ADC channel `n` reads `gain[n] * (setpoint[n] + cal[n]) + offset[n]`, plus
/// a noise term of alternating sign.
#[derive(Debug)]
pub struct LoopbackBoard {
    state: Mutex<LoopbackState>,
    dac_data: Arc<SimFifo>,
    adc_data: Arc<SimFifo>,
}

impl LoopbackBoard {
    fn new(dac_data: Arc<SimFifo>, adc_data: Arc<SimFifo>) -> Arc<LoopbackBoard> {
        Arc::new(LoopbackBoard {
            state: Mutex::new(LoopbackState {
                setpoint: [0; 8],
                cal: [0; 8],
                gain: [1.0; 8],
                offset: [0.0; 8],
                noise: [0.0; 8],
                order: std::array::from_fn(|n| n as u8),
                samples_taken: 0,
                sample_limit: None,
                dac_write_data: None,
            }),
            dac_data,
            adc_data,
        })
    }

    pub fn set_gain(&self, channel: usize, gain: f64) {
        self.state.lock().unwrap().gain[channel] = gain;
    }

    pub fn set_offset(&self, channel: usize, offset: f64) {
        self.state.lock().unwrap().offset[channel] = offset;
    }

    pub fn set_noise(&self, channel: usize, amplitude: f64) {
        self.state.lock().unwrap().noise[channel] = amplitude;
    }

    /// Makes the ADC ignore read commands once `limit` samples have been
    /// taken.
    pub fn set_sample_limit(&self, limit: u64) {
        self.state.lock().unwrap().sample_limit = Some(limit);
    }

    /// Disconnects every ADC input from the DAC, leaving only `offset`.
    pub fn unplug_all(&self) {
        self.state.lock().unwrap().gain = [0.0; 8];
    }

    pub fn dac_output(&self, channel: usize) -> i32 {
        self.state.lock().unwrap().setpoint[channel]
    }

    pub fn cal(&self, channel: usize) -> i32 {
        self.state.lock().unwrap().cal[channel]
    }

    fn sample(state: &mut LoopbackState, channel: usize) -> u16 {
        let sign = if state.samples_taken % 2 == 0 { 1.0 } else { -1.0 };
        state.samples_taken += 1;
        let analog = f64::from(state.setpoint[channel] + state.cal[channel]);
        let value =
            state.gain[channel] * analog + state.offset[channel] + sign * state.noise[channel];
        protocol::signed_to_offset(value.round() as i32)
    }

    fn execute_dac(&self, word: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(mut data) = state.dac_write_data.take() {
            data.push(word);
            if data.len() == 4 {
                let data = [data[0], data[1], data[2], data[3]];
                state.setpoint = protocol::dac::decode_write_data(&data);
            } else {
                state.dac_write_data = Some(data);
            }
            return;
        }
        let Ok(CommandWord::Dac { op, value, .. }) = CommandWord::decode(Subsystem::Dac, word)
        else {
            return;
        };
        let channel = ((value >> 16) & 0x7) as usize;
        match op {
            DacOp::DacWr => state.dac_write_data = Some(Vec::with_capacity(4)),
            DacOp::DacWrCh => {
                state.setpoint[channel] = protocol::offset_to_signed((value & 0xffff) as u16)
            }
            DacOp::SetCal => {
                if let Some((channel, cal)) = protocol::dac::decode_set_cal(word) {
                    state.cal[usize::from(channel)] = cal;
                }
            }
            DacOp::GetCal => self
                .dac_data
                .push(u32::from(state.cal[channel] as i16 as u16)),
            DacOp::Zero => state.setpoint = [0; 8],
            DacOp::Noop | DacOp::Cancel => (),
        }
    }

    fn execute_adc(&self, word: u32) {
        let mut state = self.state.lock().unwrap();
        let Ok(CommandWord::Adc { op, value, .. }) = CommandWord::decode(Subsystem::Adc, word)
        else {
            return;
        };
        let exhausted = state
            .sample_limit
            .is_some_and(|limit| state.samples_taken >= limit);
        match op {
            AdcOp::AdcRdCh | AdcOp::AdcRd if exhausted => (),
            AdcOp::SetOrd => state.order = protocol::adc::decode_order(value),
            AdcOp::AdcRdCh => {
                let channel = usize::from(protocol::adc::decode_read_channel(value));
                let sample = Self::sample(&mut state, channel);
                self.adc_data.push(protocol::pack_samples(sample, 0));
            }
            AdcOp::AdcRd => {
                let order = state.order;
                for pair in order.chunks_exact(2) {
                    let low = Self::sample(&mut state, usize::from(pair[0]));
                    let high = Self::sample(&mut state, usize::from(pair[1]));
                    self.adc_data.push(protocol::pack_samples(low, high));
                }
            }
            AdcOp::Noop | AdcOp::Cancel => (),
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum Side {
    Dac,
    Adc,
}

/// Command FIFO port of a loopback board, which executes every word as soon
/// as it is written.
#[derive(Debug)]
struct LoopbackPort {
    fifo: Arc<SimFifo>,
    board: Arc<LoopbackBoard>,
    side: Side,
}

impl Fifo for LoopbackPort {
    fn status(&self) -> FifoStatus {
        self.fifo.status()
    }

    fn capacity(&self) -> u32 {
        self.fifo.capacity()
    }

    fn write(&self, word: u32) {
        self.fifo.write(word);
        while let Some(word) = self.fifo.pop() {
            match self.side {
                Side::Dac => self.board.execute_dac(word),
                Side::Adc => self.board.execute_adc(word),
            }
        }
    }

    fn read(&self) -> u32 {
        self.fifo.read()
    }
}

/// FIFOs of one simulated board slot.
#[derive(Debug, Clone)]
pub struct SimBoard {
    pub dac_cmd: Arc<SimFifo>,
    pub dac_data: Arc<SimFifo>,
    pub adc_cmd: Arc<SimFifo>,
    pub adc_data: Arc<SimFifo>,
    pub loopback: Option<Arc<LoopbackBoard>>,
}

/// Simulated shim design.
#[derive(Debug)]
pub struct SimShim {
    pub shim: Arc<Shim>,
    pub ctrl: Arc<SimRegisters>,
    pub status: Arc<SimRegisters>,
    pub boards: Vec<SimBoard>,
    pub trigger_cmd: Arc<SimFifo>,
    pub trigger_data: Arc<SimFifo>,
}

#[derive(Debug)]
pub struct SimShimBuilder {
    loopback: Vec<u8>,
    plain: Vec<u8>,
    cmd_capacity: u32,
}

impl SimShim {
    pub fn builder() -> SimShimBuilder {
        SimShimBuilder {
            loopback: Vec::new(),
            plain: Vec::new(),
            cmd_capacity: depth::DAC_CMD,
        }
    }

    pub fn loopback(&self, board: usize) -> &LoopbackBoard {
        self.boards[board]
            .loopback
            .as_ref()
            .expect("board is not a loopback board")
    }
}

impl SimShimBuilder {
    /// Adds a loopback board in a slot.
    pub fn loopback(mut self, board: u8) -> Self {
        self.loopback.push(board);
        self
    }

    /// Adds a board whose command FIFOs only store the words written.
    pub fn board(mut self, board: u8) -> Self {
        self.plain.push(board);
        self
    }

    /// Sets the capacity of the command FIFOs of plain boards.
    pub fn cmd_capacity(mut self, capacity: u32) -> Self {
        self.cmd_capacity = capacity;
        self
    }

    pub fn build(self) -> SimShim {
        let ctrl = SimRegisters::new(regs::SYS_CTRL_WORDS);
        let status = SimRegisters::new(regs::SYS_STS_WORDS);
        let system = System::new(ctrl.clone(), status.clone());
        let mut sim_boards = Vec::new();
        let mut boards = Vec::new();
        for n in 0..regs::NUM_BOARDS as u8 {
            let loopback = self.loopback.contains(&n);
            let plain = self.plain.contains(&n);
            let (dac_cmd, dac_data, adc_cmd, adc_data) = if loopback || plain {
                let capacity = if plain {
                    self.cmd_capacity
                } else {
                    depth::DAC_CMD
                };
                (
                    SimFifo::new(capacity),
                    SimFifo::new(depth::DAC_DATA),
                    SimFifo::new(capacity),
                    SimFifo::new(depth::ADC_DATA),
                )
            } else {
                (
                    SimFifo::absent(depth::DAC_CMD),
                    SimFifo::absent(depth::DAC_DATA),
                    SimFifo::absent(depth::ADC_CMD),
                    SimFifo::absent(depth::ADC_DATA),
                )
            };
            let mut dac_port: Arc<dyn Fifo> = dac_cmd.clone();
            let mut adc_port: Arc<dyn Fifo> = adc_cmd.clone();
            let mut lb = None;
            if loopback {
                let board = LoopbackBoard::new(dac_data.clone(), adc_data.clone());
                dac_port = Arc::new(LoopbackPort {
                    fifo: dac_cmd.clone(),
                    board: board.clone(),
                    side: Side::Dac,
                });
                adc_port = Arc::new(LoopbackPort {
                    fifo: adc_cmd.clone(),
                    board: board.clone(),
                    side: Side::Adc,
                });
                lb = Some(board);
            }
            boards.push(Board {
                dac: Dac::new(n, dac_port, dac_data.clone()),
                adc: Adc::new(n, adc_port, adc_data.clone()),
            });
            sim_boards.push(SimBoard {
                dac_cmd,
                dac_data,
                adc_cmd,
                adc_data,
                loopback: lb,
            });
        }
        let trigger_cmd = SimFifo::new(depth::TRIG_CMD);
        let trigger_data = SimFifo::new(depth::TRIG_DATA);
        let trigger = Trigger::new(trigger_cmd.clone(), trigger_data.clone(), system.clone());
        SimShim {
            shim: Arc::new(Shim::from_parts(system, boards, trigger)),
            ctrl,
            status,
            boards: sim_boards,
            trigger_cmd,
            trigger_data,
        }
    }
}
