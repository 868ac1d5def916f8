use std::fmt;

use tracing::{debug, warn};

use crate::memory::Memory;
use crate::opcode::{self, DecodeError, Instruction, Mode, Opcode};
use crate::port::{Interrupt, Port};
use crate::program::Program;
use crate::Word;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Active,
  AwaitingInput { destination: usize },
  Halted,
}

/// What a single call to [`Vm::step`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
  /// An instruction ran and the machine can keep going
  Continue,
  /// The machine is parked on an input instruction until [`Vm::resume`]
  Input,
  /// The machine emitted a value
  Output(Word),
  /// The machine executed a halt
  Halted,
}

/// A virtual machine for the integer instruction set.
///
/// The machine owns its memory outright. It can be driven one instruction at
/// a time with [`Vm::step`]/[`Vm::resume`], or left to run against a [`Port`]
/// with [`Vm::run`].
#[derive(Debug, Clone)]
pub struct Vm {
  ip: usize,
  // offset for relative-mode operands, only moved by `AdjustBase`
  base: Word,
  memory: Memory,
  state: State,
}

impl Vm {
  /// Create a machine with a fresh copy of `program` as its memory
  pub fn new(program: &Program) -> Self {
    Self::with_memory(program.into())
  }

  pub fn with_memory(memory: Memory) -> Self {
    Self {
      ip: 0,
      base: 0,
      memory,
      state: State::Active,
    }
  }

  pub fn memory(&self) -> &Memory {
    &self.memory
  }

  pub fn ip(&self) -> usize {
    self.ip
  }

  pub fn relative_base(&self) -> Word {
    self.base
  }

  pub fn is_halted(&self) -> bool {
    self.state == State::Halted
  }

  pub fn is_awaiting_input(&self) -> bool {
    matches!(self.state, State::AwaitingInput { .. })
  }

  /// Decode the instruction under the instruction pointer
  pub fn decode(&self) -> Result<Instruction, Error> {
    match self.state {
      State::Halted => Err(Error::MachineHalted),
      State::AwaitingInput { .. } => Err(Error::AwaitingInput),
      State::Active => opcode::decode(self.memory.read(self.ip)).map_err(|source| Error::Decode {
        ip: self.ip,
        source,
      }),
    }
  }

  /// Execute a single instruction
  pub fn step(&mut self) -> Result<Step, Error> {
    let instruction = self.decode()?;
    self.execute(instruction)
  }

  /// Complete a pending input instruction with `value`
  pub fn resume(&mut self, value: Word) -> Result<(), Error> {
    match self.state {
      State::AwaitingInput { destination } => {
        self.memory.write(destination, value);
        self.ip += Opcode::Input.arity() + 1;
        self.state = State::Active;
        Ok(())
      }
      State::Halted => Err(Error::MachineHalted),
      State::Active => Err(Error::NotAwaitingInput),
    }
  }

  /// Run until the program halts or the port interrupts it.
  ///
  /// Interrupts are a normal way to stop and resolve to `Ok`. Only faults in
  /// the program itself come back as errors. Either way `port.close()` runs
  /// exactly once before this returns.
  pub async fn run<P>(&mut self, port: &mut P) -> Result<(), Error>
  where
    P: Port + Send,
  {
    let outcome = self.drive(port).await;
    port.close();
    match outcome {
      Ok(()) => {
        debug!(ip = self.ip, "machine halted");
        Ok(())
      }
      Err(Stop::Interrupted(interrupt)) => {
        debug!(ip = self.ip, %interrupt, "machine stopped");
        Ok(())
      }
      Err(Stop::Fault(error)) => {
        warn!(ip = self.ip, %error, "machine faulted");
        Err(error)
      }
    }
  }

  async fn drive<P>(&mut self, port: &mut P) -> Result<(), Stop>
  where
    P: Port + Send,
  {
    loop {
      if self.is_awaiting_input() {
        let value = port.input().await?;
        self.resume(value)?;
      }
      let instruction = self.decode()?;
      port.trace(&self.snapshot(instruction));
      match self.execute(instruction)? {
        Step::Continue => {}
        Step::Input => {
          let value = port.input().await?;
          self.resume(value)?;
        }
        Step::Output(value) => port.output(value).await?,
        Step::Halted => return Ok(()),
      }
      port.yield_now().await?;
    }
  }

  fn execute(&mut self, instruction: Instruction) -> Result<Step, Error> {
    let handler = HANDLERS[instruction.opcode.slot()];
    let step = match handler(self, instruction)? {
      Flow::Next => {
        self.ip += instruction.len();
        Step::Continue
      }
      Flow::Jump(target) => {
        self.ip = target;
        Step::Continue
      }
      Flow::Input(destination) => {
        self.state = State::AwaitingInput { destination };
        Step::Input
      }
      Flow::Output(value) => {
        self.ip += instruction.len();
        Step::Output(value)
      }
      Flow::Halt => {
        self.state = State::Halted;
        Step::Halted
      }
    };
    Ok(step)
  }

  /// A printable view of the machine about to execute `instruction`
  pub fn snapshot(&self, instruction: Instruction) -> Snapshot<'_> {
    Snapshot {
      memory: &self.memory,
      ip: self.ip,
      base: self.base,
      instruction,
    }
  }

  fn address(&self, raw: Word) -> Result<usize, Error> {
    usize::try_from(raw).map_err(|_| Error::Address {
      address: raw,
      ip: self.ip,
    })
  }

  fn relative(&self, raw: Word) -> Result<usize, Error> {
    let target = raw
      .checked_add(self.base)
      .ok_or(Error::Overflow { ip: self.ip })?;
    self.address(target)
  }

  fn raw(&self, param: usize) -> Word {
    self.memory.read(self.ip + param + 1)
  }

  // value of a source operand
  fn load(&self, instruction: Instruction, param: usize) -> Result<Word, Error> {
    let raw = self.raw(param);
    let value = match instruction.mode(param) {
      Mode::Immediate => raw,
      Mode::Position => self.memory.read(self.address(raw)?),
      Mode::Relative => self.memory.read(self.relative(raw)?),
    };
    Ok(value)
  }

  // address of a destination operand
  fn target(&self, instruction: Instruction, param: usize) -> Result<usize, Error> {
    let raw = self.raw(param);
    match instruction.mode(param) {
      Mode::Immediate => Err(Error::WriteMode {
        opcode: instruction.opcode,
        ip: self.ip,
      }),
      Mode::Position => self.address(raw),
      Mode::Relative => self.relative(raw),
    }
  }
}

/// Run a fresh copy of `program` against `port` until it halts or is
/// interrupted
pub async fn execute<P>(program: &Program, port: &mut P) -> Result<(), Error>
where
  P: Port + Send,
{
  Vm::new(program).run(port).await
}

/// A fault raised while executing a program
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
  #[error("{source} at ip {ip}")]
  Decode {
    ip: usize,
    #[source]
    source: DecodeError,
  },

  #[error("negative address {address} at ip {ip}")]
  Address { address: Word, ip: usize },

  #[error("{opcode:?} writes through an immediate operand at ip {ip}")]
  WriteMode { opcode: Opcode, ip: usize },

  #[error("arithmetic overflow at ip {ip}")]
  Overflow { ip: usize },

  #[error("machine is halted")]
  MachineHalted,

  #[error("machine is waiting for input")]
  AwaitingInput,

  #[error("machine is not waiting for input")]
  NotAwaitingInput,
}

enum Stop {
  Interrupted(Interrupt),
  Fault(Error),
}

impl From<Interrupt> for Stop {
  fn from(interrupt: Interrupt) -> Self {
    Self::Interrupted(interrupt)
  }
}

impl From<Error> for Stop {
  fn from(error: Error) -> Self {
    Self::Fault(error)
  }
}

/// The machine state at an instruction boundary, rendered as a memory dump
/// with the instruction pointer marked.
pub struct Snapshot<'vm> {
  memory: &'vm Memory,
  ip: usize,
  base: Word,
  instruction: Instruction,
}

impl Snapshot<'_> {
  pub fn ip(&self) -> usize {
    self.ip
  }

  pub fn instruction(&self) -> Instruction {
    self.instruction
  }
}

const DUMP_COLUMNS: usize = 8;

impl fmt::Display for Snapshot<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "ip={} base={} {}", self.ip, self.base, self.instruction)?;
    for (row, cells) in self.memory.dense().chunks(DUMP_COLUMNS).enumerate() {
      let start = row * DUMP_COLUMNS;
      write!(f, "{start:>6} |")?;
      for (offset, value) in cells.iter().enumerate() {
        let marker = if start + offset == self.ip { '>' } else { ' ' };
        write!(f, " {marker}{value:>8}")?;
      }
      writeln!(f)?;
    }
    for (address, value) in self.memory.overflow() {
      let marker = if address == self.ip { '>' } else { ' ' };
      writeln!(f, "{address:>6} | {marker}{value:>8}")?;
    }
    Ok(())
  }
}

enum Flow {
  Next,
  Jump(usize),
  Input(usize),
  Output(Word),
  Halt,
}

type Handler = fn(&mut Vm, Instruction) -> Result<Flow, Error>;

// indexed by `Opcode::slot`
const HANDLERS: [Handler; 10] = [
  add,
  multiply,
  input,
  output,
  jump_if_true,
  jump_if_false,
  less_than,
  equals,
  adjust_base,
  halt,
];

// m[c] ← a + b
fn add(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  let a = vm.load(instruction, 0)?;
  let b = vm.load(instruction, 1)?;
  let c = vm.target(instruction, 2)?;
  let sum = a.checked_add(b).ok_or(Error::Overflow { ip: vm.ip })?;
  vm.memory.write(c, sum);
  Ok(Flow::Next)
}

// m[c] ← a × b
fn multiply(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  let a = vm.load(instruction, 0)?;
  let b = vm.load(instruction, 1)?;
  let c = vm.target(instruction, 2)?;
  let product = a.checked_mul(b).ok_or(Error::Overflow { ip: vm.ip })?;
  vm.memory.write(c, product);
  Ok(Flow::Next)
}

// m[a] ← input()
fn input(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  let a = vm.target(instruction, 0)?;
  Ok(Flow::Input(a))
}

// output(a)
fn output(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  let a = vm.load(instruction, 0)?;
  Ok(Flow::Output(a))
}

// if a ≠ 0 : ip ← b
fn jump_if_true(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  if vm.load(instruction, 0)? != 0 {
    let b = vm.load(instruction, 1)?;
    return Ok(Flow::Jump(vm.address(b)?));
  }
  Ok(Flow::Next)
}

// if a = 0 : ip ← b
fn jump_if_false(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  if vm.load(instruction, 0)? == 0 {
    let b = vm.load(instruction, 1)?;
    return Ok(Flow::Jump(vm.address(b)?));
  }
  Ok(Flow::Next)
}

// m[c] ← (a < b) ? 1 : 0
fn less_than(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  let a = vm.load(instruction, 0)?;
  let b = vm.load(instruction, 1)?;
  let c = vm.target(instruction, 2)?;
  vm.memory.write(c, Word::from(a < b));
  Ok(Flow::Next)
}

// m[c] ← (a = b) ? 1 : 0
fn equals(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  let a = vm.load(instruction, 0)?;
  let b = vm.load(instruction, 1)?;
  let c = vm.target(instruction, 2)?;
  vm.memory.write(c, Word::from(a == b));
  Ok(Flow::Next)
}

// rb ← rb + a
fn adjust_base(vm: &mut Vm, instruction: Instruction) -> Result<Flow, Error> {
  let a = vm.load(instruction, 0)?;
  vm.base = vm
    .base
    .checked_add(a)
    .ok_or(Error::Overflow { ip: vm.ip })?;
  Ok(Flow::Next)
}

// (stop execution)
fn halt(_: &mut Vm, _: Instruction) -> Result<Flow, Error> {
  Ok(Flow::Halt)
}

#[cfg(test)]
mod tests {
  use super::*;

  use crate::port::{Buffered, CancelSignal, Cancellable};

  fn program(words: &[Word]) -> Program {
    words.into()
  }

  async fn run_with(words: &[Word], input: &[Word]) -> (Vm, Vec<Word>) {
    let mut vm = Vm::new(&program(words));
    let mut port = Buffered::new(input.iter().copied());
    vm.run(&mut port).await.unwrap();
    (vm, port.output)
  }

  mod step {
    use super::*;

    fn step_until_halt(vm: &mut Vm) {
      while vm.step().unwrap() != Step::Halted {}
    }

    #[test]
    fn new() {
      let vm = Vm::new(&program(&[99]));
      assert_eq!(vm.ip(), 0);
      assert_eq!(vm.relative_base(), 0);
      assert!(!vm.is_halted());
    }

    #[test]
    fn add_in_place() {
      let mut vm = Vm::new(&program(&[1, 0, 0, 0, 99]));
      assert_eq!(vm.step(), Ok(Step::Continue));
      assert_eq!(vm.ip(), 4);
      assert_eq!(vm.step(), Ok(Step::Halted));
      assert_eq!(vm.memory().read(0), 2);
    }

    #[test]
    fn multiply_past_image() {
      let mut vm = Vm::new(&program(&[2, 4, 4, 5, 99, 0]));
      step_until_halt(&mut vm);
      assert_eq!(vm.memory().read(5), 9801);
    }

    #[test]
    fn self_modifying_halt() {
      let mut vm = Vm::new(&program(&[1, 1, 1, 4, 99, 5, 6, 0, 99]));
      step_until_halt(&mut vm);
      assert_eq!(vm.memory().dense(), &[30, 1, 1, 4, 2, 5, 6, 0, 99]);
    }

    #[test]
    fn immediate_operand() {
      let mut vm = Vm::new(&program(&[1002, 4, 3, 4, 33]));
      step_until_halt(&mut vm);
      assert_eq!(vm.memory().read(4), 99);
    }

    #[test]
    fn larger_program() {
      let mut vm = Vm::new(&program(&[1, 9, 10, 3, 2, 3, 11, 0, 99, 30, 40, 50]));
      step_until_halt(&mut vm);
      assert_eq!(vm.memory().read(0), 3500);
      assert_eq!(vm.memory().read(3), 70);
    }

    #[test]
    fn input_parks_until_resumed() {
      let mut vm = Vm::new(&program(&[3, 0, 4, 0, 99]));
      assert_eq!(vm.step(), Ok(Step::Input));
      assert!(vm.is_awaiting_input());
      assert_eq!(vm.ip(), 0);
      assert_eq!(vm.step(), Err(Error::AwaitingInput));
      vm.resume(7).unwrap();
      assert_eq!(vm.ip(), 2);
      assert_eq!(vm.step(), Ok(Step::Output(7)));
      assert_eq!(vm.step(), Ok(Step::Halted));
      assert_eq!(vm.step(), Err(Error::MachineHalted));
      assert_eq!(vm.resume(1), Err(Error::MachineHalted));
    }

    #[test]
    fn resume_without_input() {
      let mut vm = Vm::new(&program(&[99]));
      assert_eq!(vm.resume(1), Err(Error::NotAwaitingInput));
    }

    #[test]
    fn jump_taken_and_not_taken() {
      let mut vm = Vm::new(&program(&[1105, 1, 7, 99, 0, 0, 0, 1106, 1, 3, 99]));
      assert_eq!(vm.step(), Ok(Step::Continue));
      assert_eq!(vm.ip(), 7);
      assert_eq!(vm.step(), Ok(Step::Continue));
      assert_eq!(vm.ip(), 10);
    }

    #[test]
    fn adjust_base_moves_relative_operands() {
      // rb ← 2000 + 19; rb ← rb - 34; out m[rb + 0]
      let mut vm = Vm::new(&program(&[109, 2000, 109, 19, 109, -34, 204, 0, 99]));
      vm.memory.write(1985, 42);
      assert_eq!(vm.step(), Ok(Step::Continue));
      assert_eq!(vm.step(), Ok(Step::Continue));
      assert_eq!(vm.relative_base(), 2019);
      assert_eq!(vm.step(), Ok(Step::Continue));
      assert_eq!(vm.relative_base(), 1985);
      assert_eq!(vm.step(), Ok(Step::Output(42)));
    }

    #[test]
    fn relative_destination() {
      let mut vm = Vm::new(&program(&[109, 10, 21101, 3, 4, 5, 99]));
      step_until_halt(&mut vm);
      assert_eq!(vm.memory().read(15), 7);
    }

    #[test]
    fn invalid_opcode() {
      let mut vm = Vm::new(&program(&[1, 0, 0, 0, 42]));
      assert_eq!(vm.step(), Ok(Step::Continue));
      assert_eq!(
        vm.step(),
        Err(Error::Decode {
          ip: 4,
          source: DecodeError::InvalidOpcode(42)
        })
      );
    }

    #[test]
    fn negative_address() {
      let mut vm = Vm::new(&program(&[1101, 1, 1, -1, 99]));
      assert_eq!(vm.step(), Err(Error::Address { address: -1, ip: 0 }));
      let mut vm = Vm::new(&program(&[4, -5, 99]));
      assert_eq!(vm.step(), Err(Error::Address { address: -5, ip: 0 }));
    }

    #[test]
    fn negative_relative_address() {
      let mut vm = Vm::new(&program(&[204, -1, 99]));
      assert_eq!(vm.step(), Err(Error::Address { address: -1, ip: 0 }));
    }

    #[test]
    fn write_through_immediate() {
      let mut vm = Vm::new(&program(&[11101, 1, 1, 0, 99]));
      assert_eq!(
        vm.step(),
        Err(Error::WriteMode {
          opcode: Opcode::Add,
          ip: 0
        })
      );
      let mut vm = Vm::new(&program(&[103, 0, 99]));
      assert_eq!(
        vm.step(),
        Err(Error::WriteMode {
          opcode: Opcode::Input,
          ip: 0
        })
      );
    }

    #[test]
    fn overflow() {
      let mut vm = Vm::new(&program(&[1102, Word::MAX, 2, 0, 99]));
      assert_eq!(vm.step(), Err(Error::Overflow { ip: 0 }));
    }

    #[test]
    fn snapshot_marks_ip() {
      let mut vm = Vm::new(&program(&[1101, 2, 3, 9, 99]));
      vm.step().unwrap();
      let instruction = vm.decode().unwrap();
      let dump = vm.snapshot(instruction).to_string();
      assert!(dump.starts_with("ip=4 base=0 Halt"));
      assert!(dump.contains(">      99"));
      assert!(dump.contains("     0 |"));
      assert!(dump.contains("     8 |"));
    }
  }

  mod run {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::port::Interrupt;

    #[tokio::test]
    async fn echo() {
      let (_, output) = run_with(&[3, 0, 4, 0, 99], &[7]).await;
      assert_eq!(output, vec![7]);
    }

    #[tokio::test]
    async fn halt_leaves_memory() {
      let (vm, output) = run_with(&[1, 0, 0, 0, 99], &[]).await;
      assert!(output.is_empty());
      assert!(vm.is_halted());
      assert_eq!(vm.memory().read(0), 2);
    }

    #[tokio::test]
    async fn equals_position_mode() {
      let code = [3, 9, 8, 9, 10, 9, 4, 9, 99, -1, 8];
      assert_eq!(run_with(&code, &[8]).await.1, vec![1]);
      assert_eq!(run_with(&code, &[7]).await.1, vec![0]);
    }

    #[tokio::test]
    async fn less_than_immediate_mode() {
      let code = [3, 3, 1107, -1, 8, 3, 4, 3, 99];
      assert_eq!(run_with(&code, &[5]).await.1, vec![1]);
      assert_eq!(run_with(&code, &[8]).await.1, vec![0]);
    }

    #[tokio::test]
    async fn jump_tests() {
      let position = [3, 12, 6, 12, 15, 1, 13, 14, 13, 4, 13, 99, -1, 0, 1, 9];
      let immediate = [3, 3, 1105, -1, 9, 1101, 0, 0, 12, 4, 12, 99, 1];
      for code in [&position[..], &immediate[..]] {
        assert_eq!(run_with(code, &[0]).await.1, vec![0]);
        assert_eq!(run_with(code, &[5]).await.1, vec![1]);
      }
    }

    #[tokio::test]
    async fn compare_around_eight() {
      #[rustfmt::skip]
      let code = [
        3, 21, 1008, 21, 8, 20, 1005, 20, 22, 107, 8, 21, 20, 1006, 20, 31,
        1106, 0, 36, 98, 0, 0, 1002, 21, 125, 20, 4, 20, 1105, 1, 46, 104,
        999, 1105, 1, 46, 1101, 1000, 1, 20, 4, 20, 1105, 1, 46, 98, 99,
      ];
      assert_eq!(run_with(&code, &[7]).await.1, vec![999]);
      assert_eq!(run_with(&code, &[8]).await.1, vec![1000]);
      assert_eq!(run_with(&code, &[9]).await.1, vec![1001]);
    }

    #[tokio::test]
    async fn relative_quine() {
      let code = [
        109, 1, 204, -1, 1001, 100, 1, 100, 1008, 100, 16, 101, 1006, 101, 0, 99,
      ];
      assert_eq!(run_with(&code, &[]).await.1, code.to_vec());
    }

    #[tokio::test]
    async fn large_words() {
      let (_, output) = run_with(&[1102, 34915192, 34915192, 7, 4, 7, 99, 0], &[]).await;
      assert_eq!(output, vec![1219070632396864]);
      let (_, output) = run_with(&[104, 1125899906842624, 99], &[]).await;
      assert_eq!(output, vec![1125899906842624]);
    }

    #[tokio::test]
    async fn free_execute() {
      let mut port = Buffered::new([41]);
      execute(&program(&[3, 0, 1001, 0, 1, 0, 4, 0, 99]), &mut port)
        .await
        .unwrap();
      assert_eq!(port.output, vec![42]);
    }

    #[tokio::test]
    async fn exhausted_input_stops_gracefully() {
      let mut vm = Vm::new(&program(&[3, 0, 3, 0, 99]));
      let mut port = Buffered::new([1]);
      assert_eq!(vm.run(&mut port).await, Ok(()));
      assert!(vm.is_awaiting_input());
      assert!(!vm.is_halted());
    }

    #[tokio::test]
    async fn run_resumes_parked_machine() {
      let mut vm = Vm::new(&program(&[3, 0, 4, 0, 99]));
      assert_eq!(vm.step(), Ok(Step::Input));
      let mut port = Buffered::new([5]);
      vm.run(&mut port).await.unwrap();
      assert_eq!(port.output, vec![5]);
    }

    /// Answers every input with 1 and cancels after a fixed number of
    /// instructions.
    struct Countdown {
      remaining: usize,
      closed: usize,
      traced: usize,
    }

    impl Port for Countdown {
      async fn input(&mut self) -> Result<Word, Interrupt> {
        Ok(1)
      }

      async fn output(&mut self, _: Word) -> Result<(), Interrupt> {
        Ok(())
      }

      async fn yield_now(&mut self) -> Result<(), Interrupt> {
        if self.remaining == 0 {
          return Err(Interrupt::Cancelled);
        }
        self.remaining -= 1;
        Ok(())
      }

      fn close(&mut self) {
        self.closed += 1;
      }

      fn trace(&mut self, _: &Snapshot<'_>) {
        self.traced += 1;
      }
    }

    #[tokio::test]
    async fn cancel_closes_once() {
      // in, out, add, jump back: loops forever
      let code = [3, 20, 4, 20, 1101, 1, 1, 20, 1105, 1, 0];
      for remaining in 0..12 {
        let mut vm = Vm::new(&program(&code));
        let mut port = Countdown {
          remaining,
          closed: 0,
          traced: 0,
        };
        assert_eq!(vm.run(&mut port).await, Ok(()));
        assert_eq!(port.closed, 1);
        assert_eq!(port.traced, remaining + 1);
        assert!(!vm.is_halted());
      }
    }

    #[tokio::test]
    async fn fault_still_closes() {
      let mut vm = Vm::new(&program(&[1101, 1, 1, 5, 77]));
      let mut port = Countdown {
        remaining: usize::MAX,
        closed: 0,
        traced: 0,
      };
      let err = vm.run(&mut port).await.unwrap_err();
      assert!(matches!(err, Error::Decode { ip: 4, .. }));
      assert_eq!(port.closed, 1);
    }

    // counts executed instructions so a test can wait for the loop to start
    struct Spinning {
      executed: Arc<AtomicUsize>,
    }

    impl Port for Spinning {
      async fn input(&mut self) -> Result<Word, Interrupt> {
        Err(Interrupt::Closed)
      }

      async fn output(&mut self, _: Word) -> Result<(), Interrupt> {
        Err(Interrupt::Closed)
      }

      async fn yield_now(&mut self) -> Result<(), Interrupt> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(())
      }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shared_signal_stops_a_spinning_machine() {
      let signal = CancelSignal::new();
      let executed = Arc::new(AtomicUsize::new(0));
      let mut port = Cancellable::new(
        Spinning {
          executed: executed.clone(),
        },
        signal.clone(),
      );
      let handle = tokio::spawn(async move {
        let mut vm = Vm::new(&program(&[1105, 1, 0]));
        let result = vm.run(&mut port).await;
        (vm, result)
      });
      // the machine shares this thread, so it has to give it back for the
      // loop below to make progress
      while executed.load(Ordering::Relaxed) < 1000 {
        tokio::task::yield_now().await;
      }
      signal.cancel();
      let (vm, result) = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("machine ignored the signal")
        .unwrap();
      assert_eq!(result, Ok(()));
      assert!(!vm.is_halted());
      assert_eq!(vm.ip(), 0);
    }
  }
}
