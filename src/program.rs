use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::Word;

/// An immutable memory image.
///
/// Cloning is cheap, every machine copies the image into its own memory when
/// it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
  words: Arc<[Word]>,
}

impl Program {
  pub fn words(&self) -> &[Word] {
    &self.words
  }

  /// Read and parse a program file
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ParseError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ParseError::Io {
      path: path.display().to_string(),
      source,
    })?;
    text.parse()
  }
}

impl From<Vec<Word>> for Program {
  fn from(words: Vec<Word>) -> Self {
    Self { words: words.into() }
  }
}

impl From<&[Word]> for Program {
  fn from(words: &[Word]) -> Self {
    Self { words: words.into() }
  }
}

impl FromStr for Program {
  type Err = ParseError;

  fn from_str(text: &str) -> Result<Self, Self::Err> {
    let text = text.trim();
    if text.is_empty() {
      return Err(ParseError::Empty);
    }
    let words = text
      .split(',')
      .enumerate()
      .map(|(index, field)| {
        let field = field.trim();
        field.parse::<Word>().map_err(|_| ParseError::InvalidWord {
          index,
          field: field.to_string(),
        })
      })
      .collect::<Result<Vec<_>, _>>()?;
    Ok(words.into())
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
  #[error("program text is empty")]
  Empty,

  #[error("field {index} is not an integer: `{field}`")]
  InvalidWord { index: usize, field: String },

  #[error("could not read `{path}`")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
}
