use std::fmt;

use crate::Word;

/// The operation selected by the two low decimal digits of an instruction
/// word.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
  /// Adds two values.
  ///
  /// | Operation | Semantics/RTL      | Word       |
  /// |-----------|--------------------|------------|
  /// | Add       | `m[c] ← a + b`     | `1,a,b,c`  |
  Add = 1,

  /// Multiplies two values.
  ///
  /// | Operation | Semantics/RTL      | Word       |
  /// |-----------|--------------------|------------|
  /// | Multiply  | `m[c] ← a × b`     | `2,a,b,c`  |
  Multiply = 2,

  /// Stores the next value produced by the input port.
  ///
  /// | Operation | Semantics/RTL      | Word  |
  /// |-----------|--------------------|-------|
  /// | Input     | `m[a] ← input()`   | `3,a` |
  Input = 3,

  /// Hands a value to the output port.
  ///
  /// | Operation | Semantics/RTL      | Word  |
  /// |-----------|--------------------|-------|
  /// | Output    | `output(a)`        | `4,a` |
  Output = 4,

  /// | Operation    | Semantics/RTL          | Word    |
  /// |--------------|------------------------|---------|
  /// | Jump If True | `if a ≠ 0 : ip ← b`    | `5,a,b` |
  JumpIfTrue = 5,

  /// | Operation     | Semantics/RTL          | Word    |
  /// |---------------|------------------------|---------|
  /// | Jump If False | `if a = 0 : ip ← b`    | `6,a,b` |
  JumpIfFalse = 6,

  /// | Operation | Semantics/RTL             | Word      |
  /// |-----------|---------------------------|-----------|
  /// | Less Than | `m[c] ← (a < b) ? 1 : 0`  | `7,a,b,c` |
  LessThan = 7,

  /// | Operation | Semantics/RTL             | Word      |
  /// |-----------|---------------------------|-----------|
  /// | Equals    | `m[c] ← (a = b) ? 1 : 0`  | `8,a,b,c` |
  Equals = 8,

  /// Moves the relative base used by [`Mode::Relative`] operands. This is the
  /// only way the base ever changes.
  ///
  /// | Operation            | Semantics/RTL     | Word  |
  /// |----------------------|-------------------|-------|
  /// | Adjust Relative Base | `rb ← rb + a`     | `9,a` |
  AdjustBase = 9,

  /// | Operation | Semantics/RTL      | Word |
  /// |-----------|--------------------|------|
  /// | Halt      | `(stop execution)` | `99` |
  Halt = 99,
}

impl Opcode {
  /// Number of parameters that follow the opcode in memory
  pub const fn arity(self) -> usize {
    match self {
      Self::Add | Self::Multiply | Self::LessThan | Self::Equals => 3,
      Self::JumpIfTrue | Self::JumpIfFalse => 2,
      Self::Input | Self::Output | Self::AdjustBase => 1,
      Self::Halt => 0,
    }
  }

  /// Index of the parameter this opcode writes through, if any
  pub const fn destination(self) -> Option<usize> {
    match self {
      Self::Add | Self::Multiply | Self::LessThan | Self::Equals => Some(2),
      Self::Input => Some(0),
      _ => None,
    }
  }

  /// Dense slot in the handler table
  pub(crate) const fn slot(self) -> usize {
    match self {
      Self::Halt => 9,
      other => other as usize - 1,
    }
  }
}

impl TryFrom<Word> for Opcode {
  type Error = DecodeError;

  fn try_from(word: Word) -> Result<Self, Self::Error> {
    match word.rem_euclid(100) {
      1 => Ok(Self::Add),
      2 => Ok(Self::Multiply),
      3 => Ok(Self::Input),
      4 => Ok(Self::Output),
      5 => Ok(Self::JumpIfTrue),
      6 => Ok(Self::JumpIfFalse),
      7 => Ok(Self::LessThan),
      8 => Ok(Self::Equals),
      9 => Ok(Self::AdjustBase),
      99 => Ok(Self::Halt),
      _ => Err(DecodeError::InvalidOpcode(word)),
    }
  }
}

/// How a parameter's stored integer is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
  /// The parameter is an address to dereference
  #[default]
  Position,
  /// The parameter is the value itself
  Immediate,
  /// The parameter is an address offset by the relative base
  Relative,
}

impl Mode {
  fn from_digit(word: Word, digit: Word) -> Result<Self, DecodeError> {
    match digit {
      0 => Ok(Self::Position),
      1 => Ok(Self::Immediate),
      2 => Ok(Self::Relative),
      _ => Err(DecodeError::InvalidMode { word, digit }),
    }
  }
}

impl fmt::Display for Mode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let tag = match self {
      Self::Position => "pos",
      Self::Immediate => "imm",
      Self::Relative => "rel",
    };
    f.write_str(tag)
  }
}

/// Most parameters any opcode takes
pub const MAX_PARAMS: usize = 3;

/// A decoded instruction word: the opcode plus one mode per parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
  pub opcode: Opcode,
  modes: [Mode; MAX_PARAMS],
}

impl Instruction {
  /// The addressing modes of this instruction's parameters, in order
  pub fn modes(&self) -> &[Mode] {
    &self.modes[..self.opcode.arity()]
  }

  pub fn mode(&self, param: usize) -> Mode {
    self.modes[param]
  }

  /// Words occupied by the instruction, opcode included
  pub fn len(&self) -> usize {
    self.opcode.arity() + 1
  }
}

impl fmt::Display for Instruction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self.opcode)?;
    for mode in self.modes() {
      write!(f, " {mode}")?;
    }
    Ok(())
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("invalid opcode in word {0}")]
  InvalidOpcode(Word),

  #[error("invalid addressing mode {digit} in word {word}")]
  InvalidMode { word: Word, digit: Word },
}

/// Decode a raw instruction word.
///
/// Modes are read least-significant digit first from `word / 100` and padded
/// with [`Mode::Position`] up to the opcode's arity. Mode digits beyond the
/// arity are ignored.
pub fn decode(word: Word) -> Result<Instruction, DecodeError> {
  if word < 0 {
    return Err(DecodeError::InvalidOpcode(word));
  }
  let opcode = Opcode::try_from(word)?;
  let mut modes = [Mode::Position; MAX_PARAMS];
  let mut digits = word / 100;
  for mode in modes.iter_mut().take(opcode.arity()) {
    *mode = Mode::from_digit(word, digits % 10)?;
    digits /= 10;
  }
  Ok(Instruction { opcode, modes })
}
