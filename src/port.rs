//! The I/O contract a [`Vm`](crate::vm::Vm) is driven through.
//!
//! `input` and `output` are the suspension points of a running machine,
//! `yield_now` is polled once per executed instruction and is where a caller
//! gets to stop a machine that never touches I/O. Any [`Interrupt`] raised by
//! a port unwinds the machine gracefully; it is never reported as a fault.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::vm::Snapshot;
use crate::Word;

/// Why a port stopped the machine it serves
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
  #[error("cancelled")]
  Cancelled,

  #[error("channel closed")]
  Closed,
}

pub trait Port {
  /// Produce the next input value, suspending until one exists
  fn input(&mut self) -> impl Future<Output = Result<Word, Interrupt>> + Send;

  /// Consume an output value
  fn output(&mut self, value: Word) -> impl Future<Output = Result<(), Interrupt>> + Send;

  /// Called after every executed instruction
  fn yield_now(&mut self) -> impl Future<Output = Result<(), Interrupt>> + Send {
    async { Ok(()) }
  }

  /// Called exactly once when the machine stops, however it stops
  fn close(&mut self) {}

  /// Called after every decoded instruction, before it executes
  fn trace(&mut self, _snapshot: &Snapshot<'_>) {}
}

/// A port over a fixed input queue that collects everything written to it.
///
/// Running out of input closes the port.
#[derive(Debug, Clone, Default)]
pub struct Buffered {
  pub input: VecDeque<Word>,
  pub output: Vec<Word>,
}

impl Buffered {
  pub fn new(input: impl IntoIterator<Item = Word>) -> Self {
    Self {
      input: input.into_iter().collect(),
      output: Vec::new(),
    }
  }
}

impl Port for Buffered {
  async fn input(&mut self) -> Result<Word, Interrupt> {
    self.input.pop_front().ok_or(Interrupt::Closed)
  }

  async fn output(&mut self, value: Word) -> Result<(), Interrupt> {
    self.output.push(value);
    Ok(())
  }
}

/// Shared stop flag for any number of machines
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
  flag: Arc<AtomicBool>,
}

impl CancelSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.flag.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::Acquire)
  }

  pub fn check(&self) -> Result<(), Interrupt> {
    if self.is_cancelled() {
      Err(Interrupt::Cancelled)
    } else {
      Ok(())
    }
  }
}

/// Wraps a port so that a [`CancelSignal`] stops the machine at its next
/// instruction boundary or input request.
#[derive(Debug)]
pub struct Cancellable<P> {
  inner: P,
  signal: CancelSignal,
}

impl<P> Cancellable<P> {
  pub fn new(inner: P, signal: CancelSignal) -> Self {
    Self { inner, signal }
  }

  pub fn into_inner(self) -> P {
    self.inner
  }

  pub fn get_ref(&self) -> &P {
    &self.inner
  }
}

impl<P> Port for Cancellable<P>
where
  P: Port + Send,
{
  async fn input(&mut self) -> Result<Word, Interrupt> {
    self.signal.check()?;
    self.inner.input().await
  }

  async fn output(&mut self, value: Word) -> Result<(), Interrupt> {
    self.inner.output(value).await
  }

  async fn yield_now(&mut self) -> Result<(), Interrupt> {
    self.signal.check()?;
    // hand the thread back once the task budget runs out so whoever holds
    // the signal gets to run
    tokio::task::consume_budget().await;
    self.inner.yield_now().await
  }

  fn close(&mut self) {
    self.inner.close();
  }

  fn trace(&mut self, snapshot: &Snapshot<'_>) {
    self.inner.trace(snapshot);
  }
}

/// Forwards every decoded instruction to `tracing` at TRACE level
#[derive(Debug)]
pub struct Traced<P> {
  inner: P,
}

impl<P> Traced<P> {
  pub fn new(inner: P) -> Self {
    Self { inner }
  }

  pub fn into_inner(self) -> P {
    self.inner
  }
}

impl<P> Port for Traced<P>
where
  P: Port + Send,
{
  async fn input(&mut self) -> Result<Word, Interrupt> {
    self.inner.input().await
  }

  async fn output(&mut self, value: Word) -> Result<(), Interrupt> {
    self.inner.output(value).await
  }

  async fn yield_now(&mut self) -> Result<(), Interrupt> {
    self.inner.yield_now().await
  }

  fn close(&mut self) {
    self.inner.close();
  }

  fn trace(&mut self, snapshot: &Snapshot<'_>) {
    tracing::trace!("\n{snapshot}");
    self.inner.trace(snapshot);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn buffered_closes_when_drained() {
    let mut port = Buffered::new([1, 2]);
    assert_eq!(port.input().await, Ok(1));
    assert_eq!(port.input().await, Ok(2));
    assert_eq!(port.input().await, Err(Interrupt::Closed));
  }

  #[tokio::test]
  async fn cancellable_checks_signal() {
    let signal = CancelSignal::new();
    let mut port = Cancellable::new(Buffered::new([1]), signal.clone());
    assert_eq!(port.yield_now().await, Ok(()));
    signal.cancel();
    assert_eq!(port.yield_now().await, Err(Interrupt::Cancelled));
    assert_eq!(port.input().await, Err(Interrupt::Cancelled));
    assert_eq!(port.get_ref().input.len(), 1);
  }
}
