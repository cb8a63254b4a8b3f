//! Permanent vocabulary: the word behind every `TermId::vocab(i)`.
//!
//! Stored as a JSON array in id order. The vocabulary is append-only;
//! ids handed out once never change.

use crate::error::{BinaryIndexError, Result};
use crate::meta::{read_json, write_json};
use rustc_hash::FxHashMap;
use std::path::Path;
use tern_db_core::TermId;

#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    words: Vec<String>,
    ids: FxHashMap<String, u64>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_words<I, S>(words: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self::new();
        for word in words {
            let word = word.into();
            if vocab.ids.contains_key(&word) {
                return Err(BinaryIndexError::Decode(format!(
                    "duplicate vocabulary word {:?}",
                    word
                )));
            }
            vocab.push_new(word);
        }
        Ok(vocab)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let words: Vec<String> = read_json(path)?;
        Self::from_words(words)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, &self.words)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn id_of(&self, word: &str) -> Option<TermId> {
        self.ids.get(word).map(|&i| TermId::vocab(i))
    }

    pub fn word(&self, id: TermId) -> Option<&str> {
        if !id.is_vocab() {
            return None;
        }
        self.words.get(id.index() as usize).map(String::as_str)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Id of `word`, appending it if unseen. Returns `(id, newly_added)`.
    pub fn get_or_insert(&mut self, word: &str) -> (TermId, bool) {
        match self.ids.get(word) {
            Some(&i) => (TermId::vocab(i), false),
            None => (self.push_new(word.to_string()), true),
        }
    }

    fn push_new(&mut self, word: String) -> TermId {
        let i = self.words.len() as u64;
        self.ids.insert(word.clone(), i);
        self.words.push(word);
        TermId::vocab(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_only() {
        let mut v = Vocabulary::from_words(["<a>", "<b>"]).unwrap();
        assert_eq!(v.get_or_insert("<b>"), (TermId::vocab(1), false));
        assert_eq!(v.get_or_insert("<c>"), (TermId::vocab(2), true));
        assert_eq!(v.word(TermId::vocab(0)), Some("<a>"));
        assert_eq!(v.word(TermId::local(0)), None);
    }

    #[test]
    fn test_duplicates_rejected() {
        assert!(Vocabulary::from_words(["x", "x"]).is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.json");
        let v = Vocabulary::from_words(["\"lit\"", "<iri>"]).unwrap();
        v.save(&path).unwrap();
        let loaded = Vocabulary::load(&path).unwrap();
        assert_eq!(loaded.words(), v.words());
        assert_eq!(loaded.id_of("<iri>"), Some(TermId::vocab(1)));
    }
}
