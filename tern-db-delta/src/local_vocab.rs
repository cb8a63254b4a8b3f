//! Words introduced by overlay edits that are not yet in the permanent vocabulary.

use rustc_hash::FxHashMap;
use tern_db_core::TermId;

/// Overlay-local vocabulary. Ids are `TermId::local(i)` in insertion order.
#[derive(Clone, Debug, Default)]
pub struct LocalVocab {
    words: Vec<String>,
    ids: FxHashMap<String, u64>,
}

impl LocalVocab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert(&mut self, word: &str) -> TermId {
        if let Some(&i) = self.ids.get(word) {
            return TermId::local(i);
        }
        let i = self.words.len() as u64;
        self.ids.insert(word.to_string(), i);
        self.words.push(word.to_string());
        TermId::local(i)
    }

    pub fn id_of(&self, word: &str) -> Option<TermId> {
        self.ids.get(word).map(|&i| TermId::local(i))
    }

    pub fn word(&self, id: TermId) -> Option<&str> {
        if !id.is_local() {
            return None;
        }
        self.words.get(id.index() as usize).map(String::as_str)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_stable() {
        let mut v = LocalVocab::new();
        let a = v.get_or_insert("<a>");
        let b = v.get_or_insert("<b>");
        assert_eq!(v.get_or_insert("<a>"), a);
        assert_eq!(a, TermId::local(0));
        assert_eq!(b, TermId::local(1));
        assert_eq!(v.word(b), Some("<b>"));
        assert_eq!(v.word(TermId::vocab(1)), None);
        assert_eq!(v.len(), 2);
    }
}
