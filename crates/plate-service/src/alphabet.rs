//! Class-id to symbol table and plate string assembly.
//!
//! The alphabet is tied to the character model it was trained with, so it
//! carries a version tag; a class id outside the table means the model and
//! the alphabet disagree and is reported as [`PipelineError::AlphabetMismatch`].

use crate::error::PipelineError;
use common::plate_tasks::{CharacterDetection, PlateText};
use serde::{Deserialize, Serialize};

/// Symbols of the default character model; `I` is not a class
pub const DEFAULT_ALPHABET: &str = "0123456789ABCDEFGHJKLMNOPQRSTUVWXYZ";
pub const DEFAULT_ALPHABET_VERSION: &str = "v5";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alphabet {
    version: String,
    symbols: Vec<char>,
}

impl Alphabet {
    pub fn new(version: impl Into<String>, symbols: &str) -> Result<Self, PipelineError> {
        let symbols: Vec<char> = symbols.chars().collect();
        if symbols.is_empty() {
            return Err(PipelineError::InvalidAlphabet(
                "alphabet must contain at least one symbol".to_string(),
            ));
        }

        Ok(Self {
            version: version.into(),
            symbols,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbol for `class_id`
    pub fn symbol(&self, class_id: usize) -> Result<char, PipelineError> {
        self.symbols
            .get(class_id)
            .copied()
            .ok_or_else(|| PipelineError::AlphabetMismatch {
                class_id,
                alphabet_len: self.symbols.len(),
                version: self.version.clone(),
            })
    }

    /// Map ordered characters to the plate string.
    ///
    /// An empty sequence gives [`PlateText::Unknown`], never an empty string.
    pub fn assemble(&self, ordered: &[CharacterDetection]) -> Result<PlateText, PipelineError> {
        if ordered.is_empty() {
            return Ok(PlateText::Unknown);
        }

        let text = ordered
            .iter()
            .map(|ch| self.symbol(ch.class_id))
            .collect::<Result<String, _>>()?;

        Ok(PlateText::Recognized(text))
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        Self {
            version: DEFAULT_ALPHABET_VERSION.to_string(),
            symbols: DEFAULT_ALPHABET.chars().collect(),
        }
    }
}
