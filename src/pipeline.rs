//! Amplifier rings: machines chained output-to-input, the last one feeding
//! back into the first.

use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info};

use crate::connector::{Connector, Link};
use crate::port::{CancelSignal, Cancellable};
use crate::program::Program;
use crate::vm::{self, Vm};
use crate::Word;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
  #[error("a pipeline needs at least one phase")]
  NoPhases,

  #[error("amplifier {index} faulted")]
  Amplifier {
    index: usize,
    #[source]
    source: vm::Error,
  },

  #[error("every amplifier halted without producing a signal")]
  NoSignal,

  #[error("amplifier task failed")]
  Task(#[from] JoinError),
}

/// Run one copy of `program` per phase, wired into a ring.
///
/// Link `i` feeds amplifier `i` and is seeded with `phases[i]`. The link
/// into amplifier 0 also carries `signal`, and it is the one the last
/// amplifier writes to. Once every amplifier has stopped, the last value
/// left on that link is the result. If any amplifier faults, every link is
/// closed and the shared cancel signal raised so the rest unwind, including
/// ones looping without touching a link, and the fault is returned.
pub async fn run_feedback(
  program: &Program,
  phases: &[Word],
  signal: Word,
) -> Result<Word, PipelineError> {
  if phases.is_empty() {
    return Err(PipelineError::NoPhases);
  }
  let links: Vec<Connector> = phases
    .iter()
    .enumerate()
    .map(|(index, &phase)| match index {
      0 => Connector::seeded([phase, signal]),
      _ => Connector::seeded([phase]),
    })
    .collect();

  let cancel = CancelSignal::new();
  let mut amplifiers = JoinSet::new();
  for index in 0..links.len() {
    let link = Link::new(
      links[index].clone(),
      links[(index + 1) % links.len()].clone(),
    );
    let mut port = Cancellable::new(link, cancel.clone());
    let mut vm = Vm::new(program);
    amplifiers.spawn(async move { (index, vm.run(&mut port).await) });
  }
  debug!(amplifiers = links.len(), ?phases, "pipeline started");

  let mut fault = None;
  while let Some(joined) = amplifiers.join_next().await {
    let (index, result) = joined?;
    if let Err(source) = result {
      if fault.is_none() {
        cancel.cancel();
        for link in &links {
          link.close();
        }
        fault = Some(PipelineError::Amplifier { index, source });
      }
    }
  }
  if let Some(fault) = fault {
    return Err(fault);
  }

  let output = links[0].drain().pop().ok_or(PipelineError::NoSignal)?;
  debug!(?phases, output, "pipeline finished");
  Ok(output)
}

/// Try every ordering of `phases` and return the strongest output signal
/// along with the ordering that produced it
pub async fn best_phase_setting(
  program: &Program,
  phases: &[Word],
  signal: Word,
) -> Result<(Word, Vec<Word>), PipelineError> {
  let mut best: Option<(Word, Vec<Word>)> = None;
  for ordering in permutations(phases) {
    let output = run_feedback(program, &ordering, signal).await?;
    if best.as_ref().map_or(true, |(strongest, _)| output > *strongest) {
      best = Some((output, ordering));
    }
  }
  let best = best.ok_or(PipelineError::NoPhases)?;
  info!(output = best.0, phases = ?best.1, "best phase setting");
  Ok(best)
}

fn permutations(items: &[Word]) -> Vec<Vec<Word>> {
  if items.len() <= 1 {
    return vec![items.to_vec()];
  }
  let mut all = Vec::new();
  for (index, &head) in items.iter().enumerate() {
    let mut rest = items.to_vec();
    rest.remove(index);
    for mut tail in permutations(&rest) {
      tail.insert(0, head);
      all.push(tail);
    }
  }
  all
}
