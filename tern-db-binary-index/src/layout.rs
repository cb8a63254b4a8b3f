//! File naming for an index base path.
//!
//! Every generation of an index has its own files. For a base `dir/name`
//! at generation `N`:
//!
//! ```text
//! dir/name.gN.index.<perm>[.internal]            permutation data (magic + zstd blocks)
//! dir/name.gN.index.<perm>[.internal].meta.json  block table for that permutation
//! dir/name.gN.vocabulary.json                    permanent vocabulary, id order
//! dir/name.gN.stats.json                         aggregate statistics (rebuilds only)
//! dir/name.meta.json                             manifest, names the live generation
//! ```
//!
//! The manifest is the only file shared between generations. Replacing it
//! with a single rename switches readers from one generation to the next.

use crate::error::Result;
use crate::meta::{read_manifest, IndexManifest};
use std::path::{Path, PathBuf};
use tern_db_core::PermutationId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexLayout {
    dir: PathBuf,
    name: String,
    generation: u64,
}

impl IndexLayout {
    /// Split `base` into its directory and file-name prefix, at generation 0.
    ///
    /// A base without a parent directory resolves against the current directory.
    pub fn from_base(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        let dir = match base.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "index".to_string());
        Self {
            dir,
            name,
            generation: 0,
        }
    }

    /// The layout of the generation the manifest at `base` currently names.
    pub fn current(base: impl AsRef<Path>) -> Result<Self> {
        Self::open(base).map(|(layout, _)| layout)
    }

    /// Like [`IndexLayout::current`], also returning the manifest it was resolved from.
    pub fn open(base: impl AsRef<Path>) -> Result<(Self, IndexManifest)> {
        let root = Self::from_base(base);
        let manifest = read_manifest(&root.manifest_path())?;
        Ok((root.at_generation(manifest.generation), manifest))
    }

    /// The same base at another generation.
    pub fn at_generation(&self, generation: u64) -> Self {
        Self {
            dir: self.dir.clone(),
            name: self.name.clone(),
            generation,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn base(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    /// Two layouts share a base when they publish through the same manifest.
    pub fn same_base(&self, other: &IndexLayout) -> bool {
        self.dir == other.dir && self.name == other.name
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.g{}.{}", self.name, self.generation, suffix))
    }

    pub fn data_path(&self, id: PermutationId) -> PathBuf {
        self.file(&format!("index.{}", id.file_suffix()))
    }

    pub fn meta_path(&self, id: PermutationId) -> PathBuf {
        self.file(&format!("index.{}.meta.json", id.file_suffix()))
    }

    pub fn vocabulary_path(&self) -> PathBuf {
        self.file("vocabulary.json")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.file("stats.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(format!("{}.meta.json", self.name))
    }

    /// Where a rebuild session writes its manifest before renaming it into place.
    pub fn staged_manifest_path(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{}.staging-{}.meta.json", self.name, session))
    }

    /// Every file that belongs to this generation alone.
    pub fn generation_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for id in PermutationId::all() {
            files.push(self.data_path(id));
            files.push(self.meta_path(id));
        }
        files.push(self.vocabulary_path());
        files.push(self.stats_path());
        files
    }

    /// Every file a reader of this generation opens, manifest last.
    pub fn all_files(&self) -> Vec<PathBuf> {
        let mut files = self.generation_files();
        files.push(self.manifest_path());
        files
    }

    /// An index exists once its manifest has been published.
    pub fn exists(&self) -> bool {
        self.manifest_path().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_db_core::Permutation;

    #[test]
    fn test_paths() {
        let layout = IndexLayout::from_base("/data/kb").at_generation(3);
        assert_eq!(
            layout.data_path(PermutationId::regular(Permutation::Pso)),
            PathBuf::from("/data/kb.g3.index.pso")
        );
        assert_eq!(
            layout.meta_path(PermutationId::internal(Permutation::Pos)),
            PathBuf::from("/data/kb.g3.index.pos.internal.meta.json")
        );
        assert_eq!(layout.vocabulary_path(), PathBuf::from("/data/kb.g3.vocabulary.json"));
        assert_eq!(layout.manifest_path(), PathBuf::from("/data/kb.meta.json"));
    }

    #[test]
    fn test_relative_base() {
        let layout = IndexLayout::from_base("kb");
        assert_eq!(layout.dir(), Path::new("."));
        assert_eq!(layout.name(), "kb");
        assert_eq!(layout.generation(), 0);
    }

    #[test]
    fn test_generations_share_only_the_manifest() {
        let g1 = IndexLayout::from_base("/data/kb").at_generation(1);
        let g2 = g1.at_generation(2);
        assert!(g1.same_base(&g2));
        assert_ne!(g1, g2);
        for path in g2.generation_files() {
            assert!(!g1.all_files().contains(&path), "{}", path.display());
        }
        assert_eq!(g1.manifest_path(), g2.manifest_path());
        assert_eq!(
            g2.staged_manifest_path("abc"),
            PathBuf::from("/data/kb.staging-abc.meta.json")
        );
    }

    #[test]
    fn test_all_files_manifest_last() {
        let files = IndexLayout::from_base("/data/kb").all_files();
        assert_eq!(files.len(), 8 * 2 + 3);
        assert_eq!(files.last().unwrap(), &PathBuf::from("/data/kb.meta.json"));
    }

    #[test]
    fn test_current_follows_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("kb");
        let manifest = IndexManifest {
            format_version: crate::meta::FORMAT_VERSION,
            generation: 7,
            permutations: Vec::new(),
            vocabulary_size: 0,
            triple_count: 0,
            internal_triple_count: 0,
        };
        crate::meta::write_json(&IndexLayout::from_base(&base).manifest_path(), &manifest)
            .unwrap();
        let (layout, read) = IndexLayout::open(&base).unwrap();
        assert_eq!(layout.generation(), 7);
        assert_eq!(read, manifest);
        assert!(IndexLayout::current(dir.path().join("missing")).is_err());
    }
}
