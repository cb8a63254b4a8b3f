//! Overlay merge: apply sorted edits to a stream of scanned blocks.
//!
//! The merger walks the old permutation block by block while keeping a
//! cursor into the permutation's pre-sorted edits, and re-chunks the merged
//! row stream at the source's target block size. Output chunks are handed
//! to a caller-supplied sink in order.
//!
//! Edits are keyed by the whole quad, so each edit meets at most one old row:
//!
//! | old vs edit | insert             | delete              |
//! |-------------|--------------------|---------------------|
//! | old first   | old row emitted    | old row emitted     |
//! | edit first  | new row emitted    | nothing (absent)    |
//! | same quad   | row emitted once   | row dropped         |

use crate::error::Result;
use crate::remap::SortedEdit;
use std::cmp::Ordering;
use tern_db_binary_index::Block;
use tern_db_core::{Permutation, Quad};
use tern_db_delta::EditOp;

// ============================================================================
// Output
// ============================================================================

/// One output block, in permutation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergedChunk {
    /// Merged rows to be encoded as a new block.
    Rows(Vec<Quad>),
    /// Old block `index` is unchanged and can be copied still compressed.
    PassThrough(usize),
}

/// Row accounting for one merged permutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub rows_in: u64,
    pub rows_out: u64,
    /// Rows that were not in the old permutation.
    pub inserted: u64,
    /// Old rows removed by a delete.
    pub deleted: u64,
    pub blocks_out: u64,
    pub passed_through_blocks: u64,
}

// ============================================================================
// BlockMerger
// ============================================================================

pub struct BlockMerger<'a> {
    order: Permutation,
    edits: &'a [SortedEdit],
    cursor: usize,
    target_rows: usize,
    buffer: Vec<Quad>,
    counts: MergeCounts,
}

impl<'a> BlockMerger<'a> {
    /// `edits` must already be sorted in `order`.
    pub fn new(order: Permutation, edits: &'a [SortedEdit], target_rows: usize) -> Self {
        let target_rows = target_rows.max(1);
        Self {
            order,
            edits,
            cursor: 0,
            target_rows,
            buffer: Vec::with_capacity(target_rows),
            counts: MergeCounts::default(),
        }
    }

    pub fn counts(&self) -> MergeCounts {
        self.counts
    }

    fn pending(&self) -> Option<&'a SortedEdit> {
        self.edits.get(self.cursor)
    }

    /// True if `block` can be forwarded as-is: nothing buffered ahead of it,
    /// no edit at or before its last row, and exactly one target block long.
    fn can_pass_through(&self, block: &Block) -> bool {
        let Some(last) = block.last() else {
            return false;
        };
        self.buffer.is_empty()
            && block.rows.len() == self.target_rows
            && self
                .pending()
                .map_or(true, |e| self.order.compare(&e.quad, last).is_gt())
    }

    fn emit_row<F>(&mut self, row: Quad, sink: &mut F) -> Result<()>
    where
        F: FnMut(MergedChunk) -> Result<()>,
    {
        self.buffer.push(row);
        if self.buffer.len() >= self.target_rows {
            self.flush(sink)?;
        }
        Ok(())
    }

    fn flush<F>(&mut self, sink: &mut F) -> Result<()>
    where
        F: FnMut(MergedChunk) -> Result<()>,
    {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.target_rows));
        self.counts.rows_out += rows.len() as u64;
        self.counts.blocks_out += 1;
        sink(MergedChunk::Rows(rows))
    }

    /// Apply an edit that sorts before every remaining old row.
    fn apply_unmatched<F>(&mut self, edit: &SortedEdit, sink: &mut F) -> Result<()>
    where
        F: FnMut(MergedChunk) -> Result<()>,
    {
        if edit.op == EditOp::Insert {
            self.counts.inserted += 1;
            self.emit_row(edit.quad, sink)?;
        }
        Ok(())
    }

    /// Merge one scanned block.
    pub fn push_block<F>(&mut self, block: &Block, sink: &mut F) -> Result<()>
    where
        F: FnMut(MergedChunk) -> Result<()>,
    {
        self.counts.rows_in += block.rows.len() as u64;

        if self.can_pass_through(block) {
            self.counts.rows_out += block.rows.len() as u64;
            self.counts.blocks_out += 1;
            self.counts.passed_through_blocks += 1;
            return sink(MergedChunk::PassThrough(block.index));
        }

        for &row in &block.rows {
            loop {
                let Some(edit) = self.pending() else {
                    self.emit_row(row, sink)?;
                    break;
                };
                match self.order.compare(&row, &edit.quad) {
                    Ordering::Less => {
                        self.emit_row(row, sink)?;
                        break;
                    }
                    Ordering::Greater => {
                        self.cursor += 1;
                        self.apply_unmatched(edit, sink)?;
                    }
                    Ordering::Equal => {
                        self.cursor += 1;
                        match edit.op {
                            EditOp::Insert => self.emit_row(row, sink)?,
                            EditOp::Delete => self.counts.deleted += 1,
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Emit the edits past the last old row and the final partial block.
    pub fn finish<F>(mut self, sink: &mut F) -> Result<MergeCounts>
    where
        F: FnMut(MergedChunk) -> Result<()>,
    {
        while let Some(edit) = self.pending() {
            self.cursor += 1;
            self.apply_unmatched(edit, sink)?;
        }
        self.flush(sink)?;
        Ok(self.counts)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tern_db_core::TermId;

    fn q(s: u64) -> Quad {
        Quad::triple(TermId::vocab(s), TermId::vocab(100), TermId::vocab(200))
    }

    fn ins(s: u64) -> SortedEdit {
        SortedEdit {
            quad: q(s),
            op: EditOp::Insert,
        }
    }

    fn del(s: u64) -> SortedEdit {
        SortedEdit {
            quad: q(s),
            op: EditOp::Delete,
        }
    }

    fn blocks(groups: &[&[u64]]) -> Vec<Block> {
        groups
            .iter()
            .enumerate()
            .map(|(index, g)| Block {
                index,
                rows: g.iter().map(|&s| q(s)).collect(),
            })
            .collect()
    }

    fn run(
        old: &[&[u64]],
        edits: &[SortedEdit],
        target: usize,
    ) -> (Vec<MergedChunk>, MergeCounts) {
        let mut out = Vec::new();
        let mut sink = |chunk: MergedChunk| -> Result<()> {
            out.push(chunk);
            Ok(())
        };
        let mut merger = BlockMerger::new(Permutation::Spo, edits, target);
        for block in blocks(old) {
            merger.push_block(&block, &mut sink).unwrap();
        }
        let counts = merger.finish(&mut sink).unwrap();
        (out, counts)
    }

    fn subjects(chunks: &[MergedChunk], old: &[&[u64]]) -> Vec<u64> {
        chunks
            .iter()
            .flat_map(|c| match c {
                MergedChunk::Rows(rows) => rows.iter().map(|r| r.s.index()).collect::<Vec<_>>(),
                MergedChunk::PassThrough(i) => old[*i].to_vec(),
            })
            .collect()
    }

    #[test]
    fn test_insert_and_delete() {
        // {A, B, D} + insert C - delete B
        let old: &[&[u64]] = &[&[1, 2, 4]];
        let (chunks, counts) = run(old, &[del(2), ins(3)], 8);
        assert_eq!(subjects(&chunks, old), vec![1, 3, 4]);
        assert_eq!(counts.inserted, 1);
        assert_eq!(counts.deleted, 1);
        assert_eq!(counts.rows_in, 3);
        assert_eq!(counts.rows_out, 3);
    }

    #[test]
    fn test_insert_existing_and_delete_missing_are_noops() {
        let old: &[&[u64]] = &[&[1, 2, 4]];
        let (chunks, counts) = run(old, &[ins(2), del(3)], 8);
        assert_eq!(subjects(&chunks, old), vec![1, 2, 4]);
        assert_eq!(counts.inserted, 0);
        assert_eq!(counts.deleted, 0);
    }

    #[test]
    fn test_rechunks_at_target() {
        let old: &[&[u64]] = &[&[2, 4], &[6, 8]];
        let (chunks, counts) = run(old, &[ins(1), ins(5), ins(9)], 3);
        let sizes: Vec<usize> = chunks
            .iter()
            .map(|c| match c {
                MergedChunk::Rows(r) => r.len(),
                MergedChunk::PassThrough(_) => 0,
            })
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(subjects(&chunks, old), vec![1, 2, 4, 5, 6, 8, 9]);
        assert_eq!(counts.blocks_out, 3);
        assert_eq!(counts.passed_through_blocks, 0);
    }

    #[test]
    fn test_untouched_full_blocks_pass_through() {
        let old: &[&[u64]] = &[&[1, 2], &[3, 4], &[5, 6]];
        let (chunks, counts) = run(old, &[ins(7)], 2);
        assert_eq!(
            chunks,
            vec![
                MergedChunk::PassThrough(0),
                MergedChunk::PassThrough(1),
                MergedChunk::PassThrough(2),
                MergedChunk::Rows(vec![q(7)]),
            ]
        );
        assert_eq!(counts.passed_through_blocks, 3);
        assert_eq!(counts.rows_out, 7);
    }

    #[test]
    fn test_no_pass_through_behind_buffered_rows() {
        // The delete leaves block 0 one row short, so block 1 must be re-chunked.
        let old: &[&[u64]] = &[&[1, 2], &[3, 4], &[5, 6]];
        let (chunks, counts) = run(old, &[del(1)], 2);
        assert_eq!(subjects(&chunks, old), vec![2, 3, 4, 5, 6]);
        assert_eq!(counts.passed_through_blocks, 0);
        assert_eq!(counts.deleted, 1);
    }

    #[test]
    fn test_edit_inside_block_prevents_pass_through() {
        let old: &[&[u64]] = &[&[1, 2], &[4, 5]];
        let (chunks, _) = run(old, &[ins(3)], 2);
        assert_eq!(chunks[0], MergedChunk::PassThrough(0));
        assert_eq!(subjects(&chunks, old), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_empty_source() {
        let (chunks, counts) = run(&[], &[ins(2), del(3), ins(4)], 16);
        assert_eq!(chunks, vec![MergedChunk::Rows(vec![q(2), q(4)])]);
        assert_eq!(counts.inserted, 2);
        assert_eq!(counts.deleted, 0);
    }

    #[test]
    fn test_delete_everything() {
        let old: &[&[u64]] = &[&[1, 2]];
        let (chunks, counts) = run(old, &[del(1), del(2)], 2);
        assert!(chunks.is_empty());
        assert_eq!(counts.rows_out, 0);
        assert_eq!(counts.deleted, 2);
    }
}
