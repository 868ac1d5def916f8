use std::collections::BTreeMap;

use crate::program::Program;
use crate::Word;

/// How far past the dense region a write may land before it goes to the
/// sparse overflow map instead of growing the vector.
const GROWTH_WINDOW: usize = 4096;

/// Sparse, default-zero memory owned by a single machine.
///
/// The loaded image and anything written near it live in a dense vector,
/// far-flung writes go to an ordered map. Unset cells read as zero.
#[derive(Debug, Clone, Default)]
pub struct Memory {
  cells: Vec<Word>,
  overflow: BTreeMap<usize, Word>,
}

impl Memory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn read(&self, address: usize) -> Word {
    match self.cells.get(address) {
      Some(&value) => value,
      None => self.overflow.get(&address).copied().unwrap_or(0),
    }
  }

  pub fn write(&mut self, address: usize, value: Word) {
    if let Some(cell) = self.cells.get_mut(address) {
      *cell = value;
    } else if address < self.cells.len() + GROWTH_WINDOW {
      self.cells.resize(address + 1, 0);
      self.cells[address] = value;
      self.absorb();
    } else {
      self.overflow.insert(address, value);
    }
  }

  /// The dense region, starting at address zero
  pub fn dense(&self) -> &[Word] {
    &self.cells
  }

  /// Cells outside the dense region that have been written
  pub fn overflow(&self) -> impl Iterator<Item = (usize, Word)> + '_ {
    self.overflow.iter().map(|(&address, &value)| (address, value))
  }

  // pull overflow cells the dense region has grown over back into it
  fn absorb(&mut self) {
    let len = self.cells.len();
    let moved = self.overflow.split_off(&len);
    for (address, value) in std::mem::replace(&mut self.overflow, moved) {
      self.cells[address] = value;
    }
  }
}

impl From<&Program> for Memory {
  fn from(program: &Program) -> Self {
    Self {
      cells: program.words().to_vec(),
      overflow: BTreeMap::new(),
    }
  }
}

impl From<Vec<Word>> for Memory {
  fn from(cells: Vec<Word>) -> Self {
    Self {
      cells,
      overflow: BTreeMap::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unset_reads_zero() {
    let memory = Memory::from(vec![1, 2, 3]);
    assert_eq!(memory.read(3), 0);
    assert_eq!(memory.read(1_000_000), 0);
    assert_eq!(memory.read(usize::MAX), 0);
  }

  #[test]
  fn write_near_grows_dense() {
    let mut memory = Memory::from(vec![1, 2, 3]);
    memory.write(10, 7);
    assert_eq!(memory.dense().len(), 11);
    assert_eq!(memory.read(10), 7);
    assert_eq!(memory.read(9), 0);
  }

  #[test]
  fn write_far_goes_sparse() {
    let mut memory = Memory::new();
    memory.write(1 << 40, 5);
    assert!(memory.dense().is_empty());
    assert_eq!(memory.read(1 << 40), 5);
    assert_eq!(memory.overflow().collect::<Vec<_>>(), vec![(1 << 40, 5)]);
  }

  #[test]
  fn growth_absorbs_overflow() {
    let mut memory = Memory::new();
    memory.write(GROWTH_WINDOW + 10, 9);
    assert_eq!(memory.overflow().count(), 1);
    memory.write(GROWTH_WINDOW - 1, 1);
    memory.write(GROWTH_WINDOW + 20, 2);
    assert_eq!(memory.overflow().count(), 0);
    assert_eq!(memory.read(GROWTH_WINDOW + 10), 9);
    assert_eq!(memory.read(GROWTH_WINDOW + 20), 2);
  }
}
