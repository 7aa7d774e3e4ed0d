//! Waveform command scripts.
//!
//! A waveform command script is a line-oriented text file describing the
//! commands that a streaming session pushes into a DAC or ADC command FIFO.
//! Blank lines are skipped and `#` starts a comment.
//!
//! DAC scripts contain lines of the form
//!
//! ```text
//! D <cycles> [<c0> ... <c7>]
//! T <triggers> [<c0> ... <c7>]
//! ```
//!
//! which wait a number of clock cycles (`D`) or external triggers (`T`) and
//! then, if the 8 signed channel values are given, update all the DAC channels.
//!
//! ADC scripts contain lines of the form
//!
//! ```text
//! D <cycles>
//! T <triggers>
//! O <c0> ... <c7>
//! L <count>
//! ```
//!
//! where `D` and `T` sample all the channels after waiting, `O` sets the order
//! in which channels are sampled, and `L` repeats the instruction in the
//! following line `count` times.

use crate::protocol::{self, EncodeError, MAX_SAMPLE, MAX_VALUE};
use anyhow::{Context, Result};
pub use shim_json::LoopMode;
use std::path::Path;

/// Syntax error in a waveform command script.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
#[error("line {line}: {message}")]
pub struct ScriptError {
    /// Line number (1-based).
    pub line: usize,
    /// Description of the error.
    pub message: String,
}

/// Subsystem that a script drives.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ScriptKind {
    /// DAC board.
    Dac,
    /// ADC board.
    Adc,
}

/// Wait that precedes an instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Wait {
    /// Delay a number of clock cycles.
    Delay(u32),
    /// Wait for a number of external triggers.
    Trigger(u32),
}

impl Wait {
    fn trig(self) -> bool {
        matches!(self, Wait::Trigger(_))
    }

    fn value(self) -> u32 {
        match self {
            Wait::Delay(value) | Wait::Trigger(value) => value,
        }
    }

    /// Returns the number of triggers consumed by the wait.
    pub fn triggers(self) -> u64 {
        match self {
            Wait::Delay(_) => 0,
            Wait::Trigger(n) => n.into(),
        }
    }
}

/// Instruction of a waveform command script.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Instruction {
    /// Wait without further action (DAC).
    Wait(Wait),
    /// Update all the channels after waiting (DAC).
    ChannelWrite {
        /// Wait before the update.
        wait: Wait,
        /// Signed channel values.
        channels: [i32; 8],
    },
    /// Sample all the channels after waiting (ADC).
    Sample(Wait),
    /// Set the channel sampling order (ADC).
    Order([u8; 8]),
    /// Repeat the following instruction (ADC).
    Loop(u32),
}

impl Instruction {
    /// Returns the number of command words of the instruction.
    pub fn words(&self) -> usize {
        match self {
            Instruction::ChannelWrite { .. } => 5,
            _ => 1,
        }
    }

    /// Returns the number of external triggers consumed by the instruction.
    pub fn triggers(&self) -> u64 {
        match self {
            Instruction::Wait(wait)
            | Instruction::ChannelWrite { wait, .. }
            | Instruction::Sample(wait) => wait.triggers(),
            Instruction::Order(_) | Instruction::Loop(_) => 0,
        }
    }

    /// Returns the number of ADC data words produced by the instruction.
    pub fn data_words(&self) -> u64 {
        match self {
            Instruction::Sample(_) => 4,
            _ => 0,
        }
    }

    /// Encodes the instruction for a board.
    pub fn encode(
        &self,
        kind: ScriptKind,
        board: u8,
        cont: bool,
    ) -> Result<Vec<u32>, EncodeError> {
        let words = match (kind, self) {
            (ScriptKind::Dac, Instruction::Wait(wait)) => {
                vec![protocol::dac::noop(board, wait.trig(), cont, wait.value())?.word]
            }
            (ScriptKind::Adc, Instruction::Wait(wait)) => {
                vec![protocol::adc::noop(board, wait.trig(), cont, wait.value())?.word]
            }
            (_, Instruction::ChannelWrite { wait, channels }) => {
                protocol::dac::write(board, wait.trig(), cont, wait.value(), channels)?
                    .iter()
                    .map(|w| w.word)
                    .collect()
            }
            (_, Instruction::Sample(wait)) => {
                vec![protocol::adc::read(board, wait.trig(), cont, wait.value())?.word]
            }
            (_, Instruction::Order(order)) => {
                vec![protocol::adc::set_order(board, cont, order)?.word]
            }
            (_, Instruction::Loop(count)) => vec![protocol::adc::repeat(board, cont, *count)?.word],
        };
        Ok(words)
    }
}

/// Instruction together with the loop marker that precedes it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Step {
    /// Count of the preceding loop marker, if any.
    pub repeat: Option<u32>,
    /// Instruction.
    pub instruction: Instruction,
}

impl Step {
    /// Returns the number of times the instruction is executed.
    pub fn executions(&self) -> u64 {
        self.repeat.unwrap_or(1).into()
    }

    /// Returns the number of writes (groups of words written together) that
    /// the step takes in the given loop mode.
    pub fn writes(&self, mode: LoopMode) -> u64 {
        match (mode, self.repeat) {
            (LoopMode::Hardware, Some(_)) => 1,
            _ => self.executions(),
        }
    }

    /// Returns the number of words of each write of the step.
    pub fn words_per_write(&self, mode: LoopMode) -> usize {
        match (mode, self.repeat) {
            (LoopMode::Hardware, Some(_)) => 1 + self.instruction.words(),
            _ => self.instruction.words(),
        }
    }

    /// Encodes one write of the step.
    ///
    /// `cont` applies to the last word of the write; a hardware loop marker
    /// always has it set.
    pub fn encode(
        &self,
        kind: ScriptKind,
        mode: LoopMode,
        board: u8,
        cont: bool,
    ) -> Result<Vec<u32>, EncodeError> {
        match (mode, self.repeat) {
            (LoopMode::Hardware, Some(count)) => {
                let mut words = Instruction::Loop(count).encode(kind, board, true)?;
                words.extend(self.instruction.encode(kind, board, cont)?);
                Ok(words)
            }
            _ => self.instruction.encode(kind, board, cont),
        }
    }
}

/// Sampling order of the hardware after a reset.
pub const IDENTITY_ORDER: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Channel sampling orders over the records of an ADC script.
///
/// A record is the 8 samples taken by one `D` or `T` line. An `O` line applies
/// to the records that follow it, and the order in effect at the end of a
/// pass carries over into the next pass.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ChannelOrders {
    // (index of the first record in the pass, order)
    changes: Vec<(u64, [u8; 8])>,
    records_per_pass: u64,
}

impl ChannelOrders {
    /// Orders of a stream that never changes the sampling order.
    pub fn identity() -> ChannelOrders {
        ChannelOrders {
            changes: Vec::new(),
            records_per_pass: 0,
        }
    }

    /// Returns the order in which the channels of a record were sampled.
    ///
    /// `record` counts from the start of the stream, across passes.
    pub fn order(&self, record: u64) -> [u8; 8] {
        if self.records_per_pass == 0 {
            return IDENTITY_ORDER;
        }
        let pass = record / self.records_per_pass;
        let index = record % self.records_per_pass;
        let start = match self.changes.last() {
            Some(&(_, order)) if pass > 0 => order,
            _ => IDENTITY_ORDER,
        };
        self.changes
            .iter()
            .rev()
            .find(|&&(first, _)| first <= index)
            .map_or(start, |&(_, order)| order)
    }
}

/// Parsed waveform command script.
///
/// The script is immutable once parsed.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct WaveformScript {
    kind: ScriptKind,
    steps: Vec<Step>,
}

fn parse_number(line: usize, token: &str) -> Result<i64, ScriptError> {
    let parsed = if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else {
        token.parse()
    };
    parsed.map_err(|_| ScriptError {
        line,
        message: format!("invalid number '{token}'"),
    })
}

fn parse_in_range(
    line: usize,
    what: &str,
    token: &str,
    range: std::ops::RangeInclusive<i64>,
) -> Result<i64, ScriptError> {
    let value = parse_number(line, token)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ScriptError {
            line,
            message: format!(
                "{what} {value} out of range {}..={}",
                range.start(),
                range.end()
            ),
        })
    }
}

fn parse_value(line: usize, token: &str) -> Result<u32, ScriptError> {
    Ok(parse_in_range(line, "value", token, 0..=MAX_VALUE.into())? as u32)
}

fn parse_eight<T>(
    line: usize,
    tokens: &[&str],
    mut parse: impl FnMut(&str) -> Result<T, ScriptError>,
) -> Result<[T; 8], ScriptError>
where
    T: Copy + Default,
{
    if tokens.len() != 8 {
        return Err(ScriptError {
            line,
            message: format!("expected 8 channel values, found {}", tokens.len()),
        });
    }
    let mut values = [T::default(); 8];
    for (value, token) in values.iter_mut().zip(tokens) {
        *value = parse(token)?;
    }
    Ok(values)
}

impl WaveformScript {
    /// Parses a script.
    pub fn parse(kind: ScriptKind, text: &str) -> Result<WaveformScript, ScriptError> {
        let mut steps = Vec::new();
        let mut pending_loop: Option<(usize, u32)> = None;
        let mut last_line = 0;
        for (n, raw) in text.lines().enumerate() {
            let line = n + 1;
            last_line = line;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = content.split_whitespace().collect();
            let args = &tokens[1..];
            let arg = |index: usize| {
                args.get(index).copied().ok_or_else(|| ScriptError {
                    line,
                    message: format!("'{}' needs an argument", tokens[0]),
                })
            };
            let instruction = match (kind, tokens[0]) {
                (_, "D" | "T") => {
                    let value = parse_value(line, arg(0)?)?;
                    let wait = if tokens[0] == "D" {
                        Wait::Delay(value)
                    } else {
                        Wait::Trigger(value)
                    };
                    match kind {
                        ScriptKind::Dac if args.len() == 1 => Instruction::Wait(wait),
                        ScriptKind::Dac => Instruction::ChannelWrite {
                            wait,
                            channels: parse_eight(line, &args[1..], |t| {
                                Ok(parse_in_range(
                                    line,
                                    "channel value",
                                    t,
                                    (-MAX_SAMPLE).into()..=MAX_SAMPLE.into(),
                                )? as i32)
                            })?,
                        },
                        ScriptKind::Adc if args.len() == 1 => Instruction::Sample(wait),
                        ScriptKind::Adc => {
                            return Err(ScriptError {
                                line,
                                message: format!("'{}' takes one argument", tokens[0]),
                            })
                        }
                    }
                }
                (ScriptKind::Adc, "O") => Instruction::Order(parse_eight(line, args, |t| {
                    Ok(parse_in_range(line, "channel", t, 0..=7)? as u8)
                })?),
                (ScriptKind::Adc, "L") => {
                    if args.len() != 1 {
                        return Err(ScriptError {
                            line,
                            message: "'L' takes one argument".to_string(),
                        });
                    }
                    if pending_loop.is_some() {
                        return Err(ScriptError {
                            line,
                            message: "loop marker follows another loop marker".to_string(),
                        });
                    }
                    let count = parse_in_range(line, "loop count", args[0], 1..=MAX_VALUE.into())?;
                    pending_loop = Some((line, count as u32));
                    continue;
                }
                (_, other) => {
                    return Err(ScriptError {
                        line,
                        message: format!("unknown instruction '{other}'"),
                    })
                }
            };
            steps.push(Step {
                repeat: pending_loop.take().map(|(_, count)| count),
                instruction,
            });
        }
        if let Some((line, _)) = pending_loop {
            return Err(ScriptError {
                line,
                message: "loop marker is not followed by an instruction".to_string(),
            });
        }
        if steps.is_empty() {
            return Err(ScriptError {
                line: last_line.max(1),
                message: "script has no instructions".to_string(),
            });
        }
        Ok(WaveformScript { kind, steps })
    }

    /// Reads and parses a script file.
    pub async fn load(kind: ScriptKind, path: &Path) -> Result<WaveformScript> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let script = WaveformScript::parse(kind, &text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        tracing::debug!(
            path = %path.display(),
            steps = script.steps.len(),
            triggers = script.trigger_count(),
            "loaded waveform script"
        );
        Ok(script)
    }

    /// Returns the subsystem that the script drives.
    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    /// Returns the steps of the script.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Returns the channel sampling orders in effect for the records sampled
    /// by the script.
    pub fn channel_orders(&self) -> ChannelOrders {
        let mut records = 0;
        let mut changes = Vec::new();
        for step in &self.steps {
            match step.instruction {
                Instruction::Order(order) => changes.push((records, order)),
                Instruction::Sample(_) => records += step.executions(),
                _ => (),
            }
        }
        ChannelOrders {
            changes,
            records_per_pass: records,
        }
    }

    /// Returns the number of external triggers consumed by one pass of the
    /// script.
    pub fn trigger_count(&self) -> u64 {
        self.steps
            .iter()
            .map(|s| s.executions() * s.instruction.triggers())
            .sum()
    }

    /// Returns the number of ADC data words produced by one pass of the
    /// script.
    pub fn data_words(&self) -> u64 {
        self.steps
            .iter()
            .map(|s| s.executions() * s.instruction.data_words())
            .sum()
    }

    /// Returns the number of ADC samples produced by one pass of the script.
    pub fn samples(&self) -> u64 {
        2 * self.data_words()
    }

    /// Returns the number of writes made by one pass of the script.
    pub fn writes(&self, mode: LoopMode) -> u64 {
        self.steps.iter().map(|s| s.writes(mode)).sum()
    }

    /// Returns the number of command words written by one pass of the script.
    pub fn words(&self, mode: LoopMode) -> u64 {
        self.steps
            .iter()
            .map(|s| s.writes(mode) * s.words_per_write(mode) as u64)
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DAC: &str = "\
# two updates
T 1
D 100 0 0 0 0 0 0 0 0

T 2 100 -100 32767 -32767 0 1 2 3 # trailing comment
";

    const ADC: &str = "\
O 7 6 5 4 3 2 1 0
L 10
T 1
D 0x10
";

    #[test]
    fn parse_dac() {
        let script = WaveformScript::parse(ScriptKind::Dac, DAC).unwrap();
        assert_eq!(script.steps().len(), 3);
        assert_eq!(
            script.steps()[0].instruction,
            Instruction::Wait(Wait::Trigger(1))
        );
        assert_eq!(
            script.steps()[2].instruction,
            Instruction::ChannelWrite {
                wait: Wait::Trigger(2),
                channels: [100, -100, 32767, -32767, 0, 1, 2, 3]
            }
        );
        assert_eq!(script.trigger_count(), 3);
        assert_eq!(script.words(LoopMode::Unroll), 11);
        assert_eq!(script.data_words(), 0);
    }

    #[test]
    fn parse_adc_loops() {
        let script = WaveformScript::parse(ScriptKind::Adc, ADC).unwrap();
        assert_eq!(script.steps()[1].repeat, Some(10));
        assert_eq!(script.steps()[2].instruction, Instruction::Sample(Wait::Delay(16)));
        assert_eq!(script.trigger_count(), 10);
        assert_eq!(script.data_words(), 44);
        assert_eq!(script.samples(), 88);
        assert_eq!(script.writes(LoopMode::Unroll), 12);
        assert_eq!(script.words(LoopMode::Unroll), 12);
        assert_eq!(script.writes(LoopMode::Hardware), 3);
        assert_eq!(script.words(LoopMode::Hardware), 4);
        let orders = script.channel_orders();
        assert_eq!(orders.order(0), [7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(orders.order(25), [7, 6, 5, 4, 3, 2, 1, 0]);
        let plain = WaveformScript::parse(ScriptKind::Adc, "T 1\n").unwrap();
        assert_eq!(plain.channel_orders().order(3), IDENTITY_ORDER);
    }

    #[test]
    fn order_follows_the_script() {
        let reversed = [7, 6, 5, 4, 3, 2, 1, 0];
        let script =
            WaveformScript::parse(ScriptKind::Adc, "T 1\nO 7 6 5 4 3 2 1 0\nT 1\n").unwrap();
        let orders = script.channel_orders();
        assert_eq!(orders.order(0), IDENTITY_ORDER);
        assert_eq!(orders.order(1), reversed);
        // the second pass starts with the order left by the first one
        assert_eq!(orders.order(2), reversed);
        assert_eq!(orders.order(3), reversed);

        let script = WaveformScript::parse(
            ScriptKind::Adc,
            "O 1 0 3 2 5 4 7 6\nL 2\nT 1\nO 0 1 2 3 4 5 6 7\nD 5\n",
        )
        .unwrap();
        let orders = script.channel_orders();
        let swapped = [1, 0, 3, 2, 5, 4, 7, 6];
        assert_eq!(orders.order(0), swapped);
        assert_eq!(orders.order(1), swapped);
        assert_eq!(orders.order(2), IDENTITY_ORDER);
        assert_eq!(orders.order(3), swapped);
        assert_eq!(ChannelOrders::identity().order(9), IDENTITY_ORDER);
    }

    #[test]
    fn hardware_loop_encoding() {
        let script = WaveformScript::parse(ScriptKind::Adc, "L 3\nT 1\n").unwrap();
        let words = script.steps()[0]
            .encode(ScriptKind::Adc, LoopMode::Hardware, 2, false)
            .unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], protocol::adc::repeat(2, true, 3).unwrap().word);
        assert_eq!(words[1], protocol::adc::read(2, true, false, 1).unwrap().word);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = WaveformScript::parse(ScriptKind::Dac, "T 1\n\nD 1 0 0 0\n").unwrap_err();
        assert_eq!(err.line, 3);
        let err = WaveformScript::parse(ScriptKind::Dac, "T 0x2000000\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(WaveformScript::parse(ScriptKind::Dac, "T 0x1ffffff\n").is_ok());
        let err =
            WaveformScript::parse(ScriptKind::Dac, "D 1 32768 0 0 0 0 0 0 0\n").unwrap_err();
        assert!(err.message.contains("32768"));
        let err = WaveformScript::parse(ScriptKind::Dac, "L 2\nT 1\n").unwrap_err();
        assert!(err.message.contains("unknown"));
        let err = WaveformScript::parse(ScriptKind::Adc, "T 1\nL 2\n").unwrap_err();
        assert_eq!(err.line, 2);
        let err = WaveformScript::parse(ScriptKind::Adc, "O 0 1 2 3 4 5 6 8\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(WaveformScript::parse(ScriptKind::Adc, "# nothing\n").is_err());
        assert!(WaveformScript::parse(ScriptKind::Adc, "L 0\nT 1\n").is_err());
    }

    #[tokio::test]
    async fn load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dac.txt");
        tokio::fs::write(&path, DAC).await.unwrap();
        let script = WaveformScript::load(ScriptKind::Dac, &path).await.unwrap();
        assert_eq!(script.kind(), ScriptKind::Dac);
        let err = WaveformScript::load(ScriptKind::Dac, &dir.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("missing.txt"));
    }
}
