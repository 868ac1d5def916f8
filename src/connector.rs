//! Single-producer/single-consumer FIFO linking one machine's output to
//! another's input.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::port::{Interrupt, Port};
use crate::Word;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("connector is closed")]
pub struct Closed;

impl From<Closed> for Interrupt {
  fn from(_: Closed) -> Self {
    Interrupt::Closed
  }
}

#[derive(Debug, Default)]
struct Inner {
  queue: VecDeque<Word>,
  // at most one parked reader, handed the next pushed value directly
  waiter: Option<oneshot::Sender<Word>>,
  closed: bool,
}

/// A FIFO of words with at most one pending reader.
///
/// Handles are cheap to clone and all refer to the same queue. Exactly one
/// task may pull at a time; competing pulls are a caller bug and the older
/// one loses its waiter.
#[derive(Debug, Clone, Default)]
pub struct Connector {
  inner: Arc<Mutex<Inner>>,
}

impl Connector {
  pub fn new() -> Self {
    Self::default()
  }

  /// A connector that already holds `values`
  pub fn seeded(values: impl IntoIterator<Item = Word>) -> Self {
    let connector = Self::new();
    connector.inner.lock().queue.extend(values);
    connector
  }

  /// Append a value, waking the pending reader if there is one
  pub fn push(&self, value: Word) -> Result<(), Closed> {
    let mut inner = self.inner.lock();
    if inner.closed {
      return Err(Closed);
    }
    if let Some(waiter) = inner.waiter.take() {
      // the reader may have given up; keep the value for the next pull
      if let Err(value) = waiter.send(value) {
        inner.queue.push_back(value);
      }
    } else {
      inner.queue.push_back(value);
    }
    Ok(())
  }

  /// Append several values so no reader can observe a prefix of them
  pub fn push_all(&self, values: &[Word]) -> Result<(), Closed> {
    let mut inner = self.inner.lock();
    if inner.closed {
      return Err(Closed);
    }
    let mut values = values.iter().copied();
    if let Some(waiter) = inner.waiter.take() {
      if let Some(first) = values.next() {
        if let Err(first) = waiter.send(first) {
          inner.queue.push_back(first);
        }
      } else {
        inner.waiter = Some(waiter);
      }
    }
    inner.queue.extend(values);
    Ok(())
  }

  /// Take the oldest value, waiting for one to be pushed if necessary
  pub async fn pull(&self) -> Result<Word, Closed> {
    let receiver = {
      let mut inner = self.inner.lock();
      if inner.closed {
        return Err(Closed);
      }
      if let Some(value) = inner.queue.pop_front() {
        return Ok(value);
      }
      let (sender, receiver) = oneshot::channel();
      inner.waiter = Some(sender);
      receiver
    };
    receiver.await.map_err(|_| Closed)
  }

  /// Take the oldest value without waiting
  pub fn try_pull(&self) -> Result<Option<Word>, Closed> {
    let mut inner = self.inner.lock();
    if inner.closed {
      return Err(Closed);
    }
    Ok(inner.queue.pop_front())
  }

  /// Fail the pending reader and every later push or pull
  pub fn close(&self) {
    let mut inner = self.inner.lock();
    inner.closed = true;
    inner.waiter = None;
  }

  pub fn is_closed(&self) -> bool {
    self.inner.lock().closed
  }

  /// Number of buffered values
  pub fn len(&self) -> usize {
    self.inner.lock().queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove and return every buffered value, oldest first
  pub fn drain(&self) -> Vec<Word> {
    self.inner.lock().queue.drain(..).collect()
  }
}

/// A port reading from one connector and writing to another
#[derive(Debug, Clone)]
pub struct Link {
  pub input: Connector,
  pub output: Connector,
}

impl Link {
  pub fn new(input: Connector, output: Connector) -> Self {
    Self { input, output }
  }
}

impl Port for Link {
  async fn input(&mut self) -> Result<Word, Interrupt> {
    Ok(self.input.pull().await?)
  }

  async fn output(&mut self, value: Word) -> Result<(), Interrupt> {
    Ok(self.output.push(value)?)
  }
}
