//! Command word codec.
//!
//! The DAC, ADC and trigger subsystems are driven by 32-bit command words
//! pushed into their command FIFOs. All the bit-level layout of those words is
//! contained in this module.
//!
//! DAC and ADC words share the same layout:
//!
//! | bits  | field                              |
//! |-------|------------------------------------|
//! | 31:29 | opcode                             |
//! | 28    | trig (wait for triggers)           |
//! | 27    | cont (more commands follow)        |
//! | 26    | ldac (DAC) / repeat (ADC)          |
//! | 24:0  | value                              |
//!
//! Trigger words have the opcode in bits 31:29 and a 29-bit value in bits
//! 28:0.
//!
//! Samples are exchanged with the hardware in "offset" format, where
//! `32767` represents zero.

use std::ops::RangeInclusive;

/// Largest magnitude of a signed sample.
pub const MAX_SAMPLE: i32 = 32767;

/// Offset-format representation of signed zero.
pub const OFFSET_ZERO: u16 = 32767;

/// Width of the value field of DAC and ADC command words.
pub const VALUE_BITS: u32 = 25;

/// Width of the value field of trigger command words.
pub const TRIGGER_VALUE_BITS: u32 = 29;

/// Largest value of a DAC or ADC command word.
pub const MAX_VALUE: u32 = (1 << VALUE_BITS) - 1;

/// Largest value of a trigger command word.
pub const MAX_TRIGGER_VALUE: u32 = (1 << TRIGGER_VALUE_BITS) - 1;

/// Largest magnitude of a DAC calibration value.
pub const MAX_CAL: i32 = 4095;

const OPCODE_SHIFT: u32 = 29;
const TRIG: u32 = 1 << 28;
const CONT: u32 = 1 << 27;
const EXTRA: u32 = 1 << 26;
const CHANNEL_SHIFT: u32 = 16;

/// A field passed to an encoder is out of range.
///
/// Encoders fail before producing any word, so nothing reaches the hardware.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
#[error("{field} = {value} is out of range {}..={}", allowed_range.start(), allowed_range.end())]
pub struct EncodeError {
    /// Name of the offending field.
    pub field: &'static str,
    /// Value that was passed.
    pub value: i64,
    /// Range of allowed values.
    pub allowed_range: RangeInclusive<i64>,
}

/// A word cannot be decoded as a command of the given subsystem.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
#[error("word {word:#010x} has no valid {subsystem:?} opcode")]
pub struct DecodeError {
    /// Subsystem the word was decoded for.
    pub subsystem: Subsystem,
    /// Offending word.
    pub word: u32,
}

/// Subsystems that accept command words.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Subsystem {
    /// DAC boards.
    Dac,
    /// ADC boards.
    Adc,
    /// Trigger unit.
    Trigger,
}

macro_rules! opcodes {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $code:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                $variant,
            )*
        }

        impl $name {
            /// Returns the 3-bit opcode.
            pub fn code(self) -> u32 {
                match self {
                    $($name::$variant => $code,)*
                }
            }

            /// Returns the operation with the given 3-bit opcode.
            pub fn from_code(code: u32) -> Option<$name> {
                match code {
                    $($code => Some($name::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes!(
    /// DAC command opcodes.
    DacOp {
        /// Wait for triggers or delay.
        Noop = 0,
        /// Set the calibration value of one channel.
        SetCal = 1,
        /// Update all channels (followed by 4 data words).
        DacWr = 2,
        /// Update one channel.
        DacWrCh = 3,
        /// Read back the calibration value of one channel.
        GetCal = 4,
        /// Set all channels to zero.
        Zero = 5,
        /// Flush the FIFO and abort the current command.
        Cancel = 7,
    }
);

opcodes!(
    /// ADC command opcodes.
    AdcOp {
        /// Wait for triggers or delay, or set a repeat count.
        Noop = 0,
        /// Set the channel sampling order.
        SetOrd = 1,
        /// Sample all channels (produces 4 data words).
        AdcRd = 2,
        /// Sample one channel (produces 1 data word).
        AdcRdCh = 3,
        /// Flush the FIFO and abort the current command.
        Cancel = 7,
    }
);

opcodes!(
    /// Trigger unit command opcodes.
    TriggerOp {
        /// Synchronize the trigger state of every subsystem.
        SyncCh = 1,
        /// Set the minimum number of cycles between triggers.
        SetLockout = 2,
        /// Arm the counting of external triggers.
        ExpectExt = 3,
        /// Delay the following command.
        Delay = 4,
        /// Issue one trigger.
        ForceTrig = 5,
        /// Flush the FIFO and abort the current command.
        Cancel = 7,
    }
);

/// Decoded command word.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CommandWord {
    /// DAC command.
    Dac {
        /// Operation.
        op: DacOp,
        /// Wait for `value` triggers instead of a `value` cycle delay.
        trig: bool,
        /// More commands follow.
        cont: bool,
        /// Load the DAC outputs at the end of the update.
        ldac: bool,
        /// Value field.
        value: u32,
    },
    /// ADC command.
    Adc {
        /// Operation.
        op: AdcOp,
        /// Wait for `value` triggers instead of a `value` cycle delay.
        trig: bool,
        /// More commands follow.
        cont: bool,
        /// Repeat the following command `value` times.
        repeat: bool,
        /// Value field.
        value: u32,
    },
    /// Trigger unit command.
    Trigger {
        /// Operation.
        op: TriggerOp,
        /// Value field.
        value: u32,
    },
}

pub(crate) fn check_range(
    field: &'static str,
    value: i64,
    allowed_range: RangeInclusive<i64>,
) -> Result<(), EncodeError> {
    if allowed_range.contains(&value) {
        Ok(())
    } else {
        Err(EncodeError {
            field,
            value,
            allowed_range,
        })
    }
}

fn flags(trig: bool, cont: bool, extra: bool) -> u32 {
    (if trig { TRIG } else { 0 })
        | (if cont { CONT } else { 0 })
        | (if extra { EXTRA } else { 0 })
}

impl CommandWord {
    /// Encodes the command into a 32-bit word.
    ///
    /// Fails if the value does not fit in the value field of the command.
    pub fn encode(&self) -> Result<u32, EncodeError> {
        match *self {
            CommandWord::Dac {
                op,
                trig,
                cont,
                ldac,
                value,
            } => {
                check_range("value", value.into(), 0..=MAX_VALUE.into())?;
                Ok((op.code() << OPCODE_SHIFT) | flags(trig, cont, ldac) | value)
            }
            CommandWord::Adc {
                op,
                trig,
                cont,
                repeat,
                value,
            } => {
                check_range("value", value.into(), 0..=MAX_VALUE.into())?;
                Ok((op.code() << OPCODE_SHIFT) | flags(trig, cont, repeat) | value)
            }
            CommandWord::Trigger { op, value } => {
                check_range("value", value.into(), 0..=MAX_TRIGGER_VALUE.into())?;
                Ok((op.code() << OPCODE_SHIFT) | value)
            }
        }
    }

    /// Decodes a word as a command of the given subsystem.
    pub fn decode(subsystem: Subsystem, word: u32) -> Result<CommandWord, DecodeError> {
        let code = word >> OPCODE_SHIFT;
        let err = DecodeError { subsystem, word };
        let trig = word & TRIG != 0;
        let cont = word & CONT != 0;
        let extra = word & EXTRA != 0;
        Ok(match subsystem {
            Subsystem::Dac => CommandWord::Dac {
                op: DacOp::from_code(code).ok_or(err)?,
                trig,
                cont,
                ldac: extra,
                value: word & MAX_VALUE,
            },
            Subsystem::Adc => CommandWord::Adc {
                op: AdcOp::from_code(code).ok_or(err)?,
                trig,
                cont,
                repeat: extra,
                value: word & MAX_VALUE,
            },
            Subsystem::Trigger => CommandWord::Trigger {
                op: TriggerOp::from_code(code).ok_or(err)?,
                value: word & MAX_TRIGGER_VALUE,
            },
        })
    }

    /// Returns the value field of the command.
    pub fn value(&self) -> u32 {
        match *self {
            CommandWord::Dac { value, .. }
            | CommandWord::Adc { value, .. }
            | CommandWord::Trigger { value, .. } => value,
        }
    }
}

/// Converts a signed sample to offset format, clamping to `0..=65535`.
pub fn signed_to_offset(value: i32) -> u16 {
    (value + i32::from(OFFSET_ZERO)).clamp(0, 0xffff) as u16
}

/// Converts an offset-format sample to a signed value.
///
/// `0xffff` maps to zero. This is a one-way mapping: zero encodes as `32767`.
pub fn offset_to_signed(offset: u16) -> i32 {
    if offset == 0xffff {
        0
    } else {
        i32::from(offset) - i32::from(OFFSET_ZERO)
    }
}

/// Converts a signed sample to offset format, rejecting out-of-range values.
pub fn checked_signed_to_offset(field: &'static str, value: i32) -> Result<u16, EncodeError> {
    check_range(field, value.into(), (-MAX_SAMPLE).into()..=MAX_SAMPLE.into())?;
    Ok(signed_to_offset(value))
}

/// Splits a data word into its two offset-format samples (low half first).
pub fn unpack_samples(word: u32) -> [u16; 2] {
    [(word & 0xffff) as u16, (word >> 16) as u16]
}

/// Packs two offset-format samples into a data word (low half first).
pub fn pack_samples(low: u16, high: u16) -> u32 {
    u32::from(low) | (u32::from(high) << 16)
}

/// Checks that a board index is in range.
pub fn check_board(board: u8) -> Result<u8, EncodeError> {
    check_range("board", board.into(), 0..=7)?;
    Ok(board)
}

/// Checks that a channel index is in range.
pub fn check_channel(channel: u8) -> Result<u8, EncodeError> {
    check_range("channel", channel.into(), 0..=7)?;
    Ok(channel)
}

/// Command word addressed to the FIFO of one board.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BoardWord {
    /// Destination board.
    pub board: u8,
    /// Encoded word.
    pub word: u32,
}

fn board_word(board: u8, command: CommandWord) -> Result<BoardWord, EncodeError> {
    Ok(BoardWord {
        board: check_board(board)?,
        word: command.encode()?,
    })
}

fn channel_value(channel: u8, payload: u16) -> Result<u32, EncodeError> {
    Ok((u32::from(check_channel(channel)?) << CHANNEL_SHIFT) | u32::from(payload))
}

fn split_channel_value(value: u32) -> (u8, u16) {
    (((value >> CHANNEL_SHIFT) & 0x7) as u8, (value & 0xffff) as u16)
}

/// Encoders and decoders for DAC commands.
pub mod dac {
    use super::*;

    /// Wait for `value` triggers (`trig`) or delay `value` cycles.
    pub fn noop(board: u8, trig: bool, cont: bool, value: u32) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Dac {
                op: DacOp::Noop,
                trig,
                cont,
                ldac: false,
                value,
            },
        )
    }

    /// Update one channel immediately.
    pub fn write_channel(board: u8, channel: u8, value: i32) -> Result<BoardWord, EncodeError> {
        let offset = checked_signed_to_offset("dac value", value)?;
        board_word(
            board,
            CommandWord::Dac {
                op: DacOp::DacWrCh,
                trig: false,
                cont: false,
                ldac: true,
                value: channel_value(channel, offset)?,
            },
        )
    }

    /// Decodes a `DAC_WR_CH` word into `(board, channel, value)`.
    pub fn decode_write_channel(word: BoardWord) -> Option<(u8, u8, i32)> {
        match CommandWord::decode(Subsystem::Dac, word.word) {
            Ok(CommandWord::Dac {
                op: DacOp::DacWrCh,
                value,
                ..
            }) => {
                let (channel, offset) = split_channel_value(value);
                Some((word.board, channel, offset_to_signed(offset)))
            }
            _ => None,
        }
    }

    /// Update all channels after waiting for `value` triggers (`trig`) or
    /// delaying `value` cycles.
    ///
    /// Returns the command word followed by the 4 channel data words.
    pub fn write(
        board: u8,
        trig: bool,
        cont: bool,
        value: u32,
        channels: &[i32; 8],
    ) -> Result<[BoardWord; 5], EncodeError> {
        let command = board_word(
            board,
            CommandWord::Dac {
                op: DacOp::DacWr,
                trig,
                cont,
                ldac: true,
                value,
            },
        )?;
        let mut words = [command; 5];
        for (pair, dst) in channels.chunks_exact(2).zip(words[1..].iter_mut()) {
            let low = checked_signed_to_offset("dac value", pair[0])?;
            let high = checked_signed_to_offset("dac value", pair[1])?;
            *dst = BoardWord {
                board,
                word: pack_samples(low, high),
            };
        }
        Ok(words)
    }

    /// Decodes the 4 channel data words that follow a `DAC_WR` command.
    pub fn decode_write_data(words: &[u32; 4]) -> [i32; 8] {
        let mut channels = [0; 8];
        for (word, dst) in words.iter().zip(channels.chunks_exact_mut(2)) {
            let [low, high] = unpack_samples(*word);
            dst[0] = offset_to_signed(low);
            dst[1] = offset_to_signed(high);
        }
        channels
    }

    /// Set the calibration value of one channel.
    pub fn set_cal(board: u8, channel: u8, cal: i32) -> Result<BoardWord, EncodeError> {
        check_range("calibration", cal.into(), (-MAX_CAL).into()..=MAX_CAL.into())?;
        board_word(
            board,
            CommandWord::Dac {
                op: DacOp::SetCal,
                trig: false,
                cont: false,
                ldac: false,
                value: channel_value(channel, cal as i16 as u16)?,
            },
        )
    }

    /// Decodes a `SET_CAL` word into `(channel, calibration)`.
    pub fn decode_set_cal(word: u32) -> Option<(u8, i32)> {
        match CommandWord::decode(Subsystem::Dac, word) {
            Ok(CommandWord::Dac {
                op: DacOp::SetCal,
                value,
                ..
            }) => {
                let (channel, cal) = split_channel_value(value);
                Some((channel, i32::from(cal as i16)))
            }
            _ => None,
        }
    }

    /// Request the calibration value of one channel on the DAC data FIFO.
    pub fn get_cal(board: u8, channel: u8) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Dac {
                op: DacOp::GetCal,
                trig: false,
                cont: false,
                ldac: false,
                value: channel_value(channel, 0)?,
            },
        )
    }

    /// Decodes the DAC data word produced by a `GET_CAL` command.
    pub fn decode_cal_readback(word: u32) -> i32 {
        i32::from((word & 0xffff) as u16 as i16)
    }

    /// Set all channels to zero.
    pub fn zero(board: u8) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Dac {
                op: DacOp::Zero,
                trig: false,
                cont: false,
                ldac: true,
                value: 0,
            },
        )
    }

    /// Flush the command FIFO and abort the current command.
    pub fn cancel(board: u8) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Dac {
                op: DacOp::Cancel,
                trig: false,
                cont: false,
                ldac: false,
                value: 0,
            },
        )
    }
}

/// Encoders and decoders for ADC commands.
pub mod adc {
    use super::*;

    /// Wait for `value` triggers (`trig`) or delay `value` cycles.
    pub fn noop(board: u8, trig: bool, cont: bool, value: u32) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Adc {
                op: AdcOp::Noop,
                trig,
                cont,
                repeat: false,
                value,
            },
        )
    }

    /// Repeat the following command `count` times.
    pub fn repeat(board: u8, cont: bool, count: u32) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Adc {
                op: AdcOp::Noop,
                trig: false,
                cont,
                repeat: true,
                value: count,
            },
        )
    }

    /// Set the channel sampling order.
    pub fn set_order(board: u8, cont: bool, order: &[u8; 8]) -> Result<BoardWord, EncodeError> {
        let mut value = 0;
        for (n, &channel) in order.iter().enumerate() {
            value |= u32::from(check_channel(channel)?) << (3 * n);
        }
        board_word(
            board,
            CommandWord::Adc {
                op: AdcOp::SetOrd,
                trig: false,
                cont,
                repeat: false,
                value,
            },
        )
    }

    /// Decodes the channel order of a `SET_ORD` value field.
    pub fn decode_order(value: u32) -> [u8; 8] {
        std::array::from_fn(|n| ((value >> (3 * n)) & 0x7) as u8)
    }

    /// Sample all channels after waiting for `value` triggers (`trig`) or
    /// delaying `value` cycles.
    pub fn read(board: u8, trig: bool, cont: bool, value: u32) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Adc {
                op: AdcOp::AdcRd,
                trig,
                cont,
                repeat: false,
                value,
            },
        )
    }

    /// Sample one channel immediately.
    pub fn read_channel(board: u8, channel: u8) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Adc {
                op: AdcOp::AdcRdCh,
                trig: false,
                cont: false,
                repeat: false,
                value: channel_value(channel, 0)?,
            },
        )
    }

    /// Decodes the channel of an `ADC_RD_CH` value field.
    pub fn decode_read_channel(value: u32) -> u8 {
        split_channel_value(value).0
    }

    /// Flush the command FIFO and abort the current command.
    pub fn cancel(board: u8) -> Result<BoardWord, EncodeError> {
        board_word(
            board,
            CommandWord::Adc {
                op: AdcOp::Cancel,
                trig: false,
                cont: false,
                repeat: false,
                value: 0,
            },
        )
    }
}

/// Encoders for trigger unit commands.
pub mod trigger {
    use super::*;

    const RESET_COUNTER: u32 = 1;

    fn word(op: TriggerOp, value: u32) -> Result<u32, EncodeError> {
        CommandWord::Trigger { op, value }.encode()
    }

    /// Synchronize the trigger state of every subsystem, optionally clearing
    /// the visible trigger counter.
    pub fn sync_channels(reset_counter: bool) -> u32 {
        (TriggerOp::SyncCh.code() << OPCODE_SHIFT) | if reset_counter { RESET_COUNTER } else { 0 }
    }

    /// Returns whether a `SYNC_CH` value field requests a counter reset.
    pub fn sync_resets_counter(value: u32) -> bool {
        value & RESET_COUNTER != 0
    }

    /// Set the minimum number of clock cycles between accepted triggers.
    pub fn set_lockout(cycles: u32) -> Result<u32, EncodeError> {
        word(TriggerOp::SetLockout, cycles)
    }

    /// Arm the counting of `count` external triggers.
    pub fn expect_ext(count: u32) -> Result<u32, EncodeError> {
        word(TriggerOp::ExpectExt, count)
    }

    /// Delay the following command by `cycles` clock cycles.
    pub fn delay(cycles: u32) -> Result<u32, EncodeError> {
        word(TriggerOp::Delay, cycles)
    }

    /// Issue `count` triggers.
    pub fn force_trigger(count: u32) -> Result<u32, EncodeError> {
        word(TriggerOp::ForceTrig, count)
    }

    /// Flush the command FIFO and abort the current command.
    pub fn cancel() -> u32 {
        TriggerOp::Cancel.code() << OPCODE_SHIFT
    }

    /// Joins the two words of a trigger data record into a timestamp.
    pub fn timestamp(low: u32, high: u32) -> u64 {
        u64::from(low) | (u64::from(high) << 32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn offset_roundtrip() {
        for value in -MAX_SAMPLE..=MAX_SAMPLE {
            assert_eq!(offset_to_signed(signed_to_offset(value)), value);
        }
    }

    #[test]
    fn offset_edges() {
        assert_eq!(signed_to_offset(0), 32767);
        assert_eq!(signed_to_offset(-32767), 0);
        assert_eq!(signed_to_offset(32767), 65534);
        // 0xffff decodes to zero, but zero never encodes to 0xffff
        assert_eq!(offset_to_signed(0xffff), 0);
        assert_eq!(signed_to_offset(offset_to_signed(0xffff)), 32767);
        // clamping
        assert_eq!(signed_to_offset(40000), 0xffff);
        assert_eq!(signed_to_offset(-40000), 0);
    }

    #[test]
    fn dac_write_channel_roundtrip() {
        let values = (-MAX_SAMPLE..=MAX_SAMPLE)
            .step_by(97)
            .chain([-MAX_SAMPLE, -1, 0, 1, MAX_SAMPLE]);
        for value in values {
            for board in 0..8 {
                for channel in 0..8 {
                    let word = dac::write_channel(board, channel, value).unwrap();
                    assert_eq!(
                        dac::decode_write_channel(word),
                        Some((board, channel, value))
                    );
                }
            }
        }
    }

    #[test]
    fn encode_boundaries() {
        assert!(dac::write_channel(7, 7, 0).is_ok());
        let err = dac::write_channel(8, 0, 0).unwrap_err();
        assert_eq!(err.field, "board");
        assert_eq!(err.value, 8);
        assert_eq!(err.allowed_range, 0..=7);
        assert_eq!(dac::write_channel(0, 8, 0).unwrap_err().field, "channel");
        assert!(dac::write_channel(0, 0, 32767).is_ok());
        assert!(dac::write_channel(0, 0, -32767).is_ok());
        let err = dac::write_channel(0, 0, 32768).unwrap_err();
        assert_eq!(err.value, 32768);
        assert_eq!(err.allowed_range, -32767..=32767);
        assert!(dac::write_channel(0, 0, -32768).is_err());
        assert!(trigger::expect_ext(MAX_TRIGGER_VALUE).is_ok());
        let err = trigger::expect_ext(MAX_TRIGGER_VALUE + 1).unwrap_err();
        assert_eq!(err.value, 1 << 29);
        assert!(dac::noop(0, true, false, MAX_VALUE).is_ok());
        assert!(dac::noop(0, true, false, MAX_VALUE + 1).is_err());
        assert!(adc::read(0, true, false, MAX_VALUE + 1).is_err());
    }

    #[test]
    fn dac_write_layout() {
        let words = dac::write(2, true, true, 100, &[0, 1, -1, 2, 3, 4, 5, -32767]).unwrap();
        assert!(words.iter().all(|w| w.board == 2));
        assert_eq!(words[0].word, (2 << 29) | (1 << 28) | (1 << 27) | (1 << 26) | 100);
        assert_eq!(words[1].word, pack_samples(32767, 32768));
        assert_eq!(words[4].word, pack_samples(32772, 0));
        let data = [words[1].word, words[2].word, words[3].word, words[4].word];
        assert_eq!(dac::decode_write_data(&data), [0, 1, -1, 2, 3, 4, 5, -32767]);
        assert!(dac::write(0, false, false, 0, &[0, 0, 0, 40000, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn decode_commands() {
        let word = adc::read(0, true, true, 5).unwrap().word;
        assert_eq!(
            CommandWord::decode(Subsystem::Adc, word).unwrap(),
            CommandWord::Adc {
                op: AdcOp::AdcRd,
                trig: true,
                cont: true,
                repeat: false,
                value: 5
            }
        );
        assert!(CommandWord::decode(Subsystem::Dac, 6 << 29).is_err());
        assert!(CommandWord::decode(Subsystem::Trigger, 0).is_err());
        let word = trigger::set_lockout(1000).unwrap();
        assert_eq!(
            CommandWord::decode(Subsystem::Trigger, word).unwrap(),
            CommandWord::Trigger {
                op: TriggerOp::SetLockout,
                value: 1000
            }
        );
    }

    #[test]
    fn calibration_words() {
        for cal in [-MAX_CAL, -1, 0, 1, MAX_CAL] {
            let word = dac::set_cal(3, 5, cal).unwrap();
            assert_eq!(dac::decode_set_cal(word.word), Some((5, cal)));
        }
        assert!(dac::set_cal(0, 0, MAX_CAL + 1).is_err());
        assert_eq!(dac::decode_cal_readback(0xffff), -1);
        assert_eq!(dac::decode_cal_readback(0x0123), 0x123);
    }

    #[test]
    fn adc_order() {
        let order = [7, 6, 5, 4, 3, 2, 1, 0];
        let word = adc::set_order(1, false, &order).unwrap();
        assert_eq!(adc::decode_order(word.word & MAX_VALUE), order);
        assert!(adc::set_order(1, false, &[0, 1, 2, 3, 4, 5, 6, 8]).is_err());
    }

    #[test]
    fn trigger_words() {
        let sync = trigger::sync_channels(true);
        assert_eq!(sync >> 29, 1);
        assert!(trigger::sync_resets_counter(sync & MAX_TRIGGER_VALUE));
        assert!(!trigger::sync_resets_counter(trigger::sync_channels(false)));
        assert_eq!(trigger::timestamp(0x89ab_cdef, 0x0123_4567), 0x0123_4567_89ab_cdef);
        assert_eq!(trigger::cancel(), 7 << 29);
    }
}
