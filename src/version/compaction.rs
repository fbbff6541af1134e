//! Leveled compaction: level scoring, input selection, and merge output.
//!
//! A compaction at level L merges `inputs[0]` (files from L) with
//! `inputs[1]` (every overlapping file from L+1) into new files at L+1,
//! keeping only the freshest record of each user key. Level 0 is scored
//! by file count, higher levels by total byte size against an
//! exponentially growing budget.

use std::sync::Arc;

use super::merge::MergeIterator;
use super::{FileMetaData, Version, NUM_LEVELS};
use crate::error::Result;
use crate::files;
use crate::key::{self, InternalKey, KeyType};
use crate::sstable::TableBuilder;

/// Compact `inputs[0]` at `level` with `inputs[1]` at `level + 1`.
pub(crate) struct Compaction {
    level: usize,
    inputs: [Vec<Arc<FileMetaData>>; 2],

    /// Union range of `inputs[0]`, encoded internal keys.
    smallest: Vec<u8>,
    largest: Vec<u8>,
}

impl Compaction {
    /// A single input file with nothing to merge against moves to the
    /// next level without being rewritten.
    fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1 && self.inputs[1].is_empty()
    }
}

fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|f| f.file_size).sum()
}

/// Byte budget for a level: 10MB at level 1, growing 10x per level.
/// Level 0 is scored by file count instead, so this value is unused there.
fn max_bytes_for_level(level: usize) -> f64 {
    let mut result = 10.0 * 1048576.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

impl Version {
    /// The level most in need of compaction, or `None` when every score is
    /// at or below 1. The bottom level has nowhere to compact into and is
    /// never picked.
    fn pick_compaction_level(&self) -> Option<usize> {
        let mut best_level = None;
        let mut best_score = 1.0;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                // Bounding by file count keeps read amplification in
                // check: every L0 file is probed on every read.
                self.files[0].len() as f64 / self.l0_compaction_trigger as f64
            } else {
                total_file_size(&self.files[level]) as f64 / max_bytes_for_level(level)
            };
            if score > best_score {
                best_score = score;
                best_level = Some(level);
            }
        }
        best_level
    }

    fn pick_compaction(&self) -> Option<Compaction> {
        let level = self.pick_compaction_level()?;

        let inputs0: Vec<Arc<FileMetaData>>;
        let (smallest, largest);
        if level == 0 {
            // Level 0 files overlap each other, so they all go.
            inputs0 = self.files[0].clone();
            let mut min: Option<Vec<u8>> = None;
            let mut max: Option<Vec<u8>> = None;
            for f in &inputs0 {
                let s = f.smallest.encode();
                let l = f.largest.encode();
                if min.as_ref().is_none_or(|m| key::compare(&s, m).is_lt()) {
                    min = Some(s);
                }
                if max.as_ref().is_none_or(|m| key::compare(&l, m).is_gt()) {
                    max = Some(l);
                }
            }
            smallest = min?;
            largest = max?;
        } else {
            // Resume after the last compacted key at this level, wrapping
            // to the first file when the pointer is past every file.
            let pointer = &self.compact_pointer[level];
            let file = self.files[level]
                .iter()
                .find(|f| {
                    pointer.is_empty() || key::compare(&f.largest.encode(), pointer).is_gt()
                })
                .or_else(|| self.files[level].first())?;
            smallest = file.smallest.encode();
            largest = file.largest.encode();
            inputs0 = vec![Arc::clone(file)];
        }

        let inputs1 = self.files[level + 1]
            .iter()
            .filter(|f| {
                // Keep any file whose range touches the union range.
                !(key::compare(&f.largest.encode(), &smallest).is_lt()
                    || key::compare(&f.smallest.encode(), &largest).is_gt())
            })
            .cloned()
            .collect();

        Some(Compaction {
            level,
            inputs: [inputs0, inputs1],
            smallest,
            largest,
        })
    }

    /// Merge the inputs into new files for `level + 1`.
    fn compact_output(&mut self, c: &Compaction) -> Result<Vec<Arc<FileMetaData>>> {
        struct Output {
            number: u64,
            builder: TableBuilder,
            smallest: InternalKey,
            largest: InternalKey,
        }

        let mut tables = Vec::with_capacity(c.inputs[0].len() + c.inputs[1].len());
        for meta in c.inputs[0].iter().chain(c.inputs[1].iter()) {
            tables.push(self.open_table(meta)?);
        }
        let mut iters = Vec::with_capacity(tables.len());
        for table in &tables {
            let mut iter = table.iter();
            iter.seek_to_first()?;
            iters.push(iter);
        }
        let mut merge = MergeIterator::new(iters);

        // Tombstones in the bottom level mask nothing: no older record can
        // exist beneath them, so they are dropped instead of rewritten.
        let drop_tombstones = c.level + 1 == NUM_LEVELS - 1;

        let mut outputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut current: Option<Output> = None;
        let mut current_user_key: Option<Vec<u8>> = None;

        while merge.valid() {
            let ik = InternalKey::decode(merge.key())?;

            // Entries sort by user key ascending, seq descending: within a
            // run of equal user keys the first is the freshest and the
            // rest are superseded.
            if current_user_key.as_deref() == Some(ik.user_key.as_slice()) {
                merge.next()?;
                continue;
            }
            current_user_key = Some(ik.user_key.clone());

            if drop_tombstones && ik.kind == KeyType::Deletion {
                merge.next()?;
                continue;
            }

            if current.is_none() {
                let number = self.next_file_number();
                let path = files::sstable_file_name(&self.dir, number);
                current = Some(Output {
                    number,
                    builder: TableBuilder::new(&path)?,
                    smallest: ik.clone(),
                    largest: ik.clone(),
                });
            }
            let output = current.as_mut().unwrap();

            output.builder.add(merge.key(), &[])?;
            output.largest = ik;

            // The builder size is an estimate; the finished file is larger.
            if output.builder.file_size() > self.max_file_size {
                let output = current.take().unwrap();
                outputs.push(finish_output(output)?);
            }

            merge.next()?;
        }

        if let Some(output) = current.take() {
            outputs.push(finish_output(output)?);
        }

        fn finish_output(output: Output) -> Result<Arc<FileMetaData>> {
            let file_size = output.builder.finish()?;
            Ok(Arc::new(FileMetaData {
                allow_seeks: 1 << 30,
                number: output.number,
                file_size,
                smallest: output.smallest,
                largest: output.largest,
            }))
        }

        Ok(outputs)
    }

    /// Run one round of major compaction. Returns false when no level
    /// needs work.
    pub fn compact(&mut self) -> Result<bool> {
        let c = match self.pick_compaction() {
            Some(c) => c,
            None => return Ok(false),
        };

        tracing::info!(
            level = c.level,
            inputs0 = c.inputs[0].len(),
            inputs1 = c.inputs[1].len(),
            "compaction started"
        );

        if c.is_trivial_move() {
            let meta = Arc::clone(&c.inputs[0][0]);
            self.delete_file(c.level, meta.number);
            self.compact_pointer[c.level] = meta.largest.encode();
            self.add_file(c.level + 1, meta);
            tracing::info!(level = c.level, levels = %self.levels_summary(), "trivial move");
            return Ok(true);
        }

        let outputs = self.compact_output(&c)?;

        for meta in &c.inputs[0] {
            self.delete_file(c.level, meta.number);
        }
        for meta in &c.inputs[1] {
            self.delete_file(c.level + 1, meta.number);
        }
        let output_count = outputs.len();
        for meta in outputs {
            self.add_file(c.level + 1, meta);
        }
        self.compact_pointer[c.level] = c.largest.clone();

        tracing::info!(
            level = c.level,
            outputs = output_count,
            levels = %self.levels_summary(),
            "compaction finished"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::key::lookup_key;
    use crate::memtable::Memtable;
    use std::path::Path;

    fn test_config(dir: &Path) -> Config {
        // Small thresholds so a handful of flushes triggers compaction.
        Config::new(dir).l0_compaction_trigger(2)
    }

    fn flush_memtable(version: &mut Version, entries: &[(u64, &[u8], &[u8])]) {
        let mem = Memtable::new(1 << 20);
        for (seq, key, value) in entries {
            mem.add(*seq, KeyType::Value, key, value);
        }
        version.write_level0_table(&mem).expect("flush");
    }

    #[test]
    fn test_no_compaction_when_below_threshold() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut version = Version::new(&test_config(dir.path())).expect("new");
        flush_memtable(&mut version, &[(1, b"a", b"1")]);
        assert!(!version.compact().expect("compact"));
    }

    #[test]
    fn test_l0_compaction_merges_and_dedups() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut version = Version::new(&test_config(dir.path())).expect("new");

        flush_memtable(&mut version, &[(1, b"a", b"a1"), (2, b"b", b"b1")]);
        flush_memtable(&mut version, &[(3, b"a", b"a2"), (4, b"c", b"c1")]);
        flush_memtable(&mut version, &[(5, b"b", b"b2")]);
        assert_eq!(version.num_level_files(0), 3);

        assert!(version.compact().expect("compact"));
        assert_eq!(version.num_level_files(0), 0);
        assert_eq!(version.num_level_files(1), 1);

        // Reads are unchanged by the compaction.
        assert_eq!(
            version.get(b"a", u64::MAX).expect("get"),
            Some(Some(b"a2".to_vec()))
        );
        assert_eq!(
            version.get(b"b", u64::MAX).expect("get"),
            Some(Some(b"b2".to_vec()))
        );
        assert_eq!(
            version.get(b"c", u64::MAX).expect("get"),
            Some(Some(b"c1".to_vec()))
        );

        // Superseded records are gone: the output holds one record per
        // user key.
        let table = version.open_table(&version.files[1][0]).expect("open");
        let mut iter = table.iter();
        iter.seek_to_first().expect("seek");
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next().expect("next");
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_compaction_preserves_get_results() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut version = Version::new(&test_config(dir.path())).expect("new");

        let mut seq = 0u64;
        for batch in 0..6 {
            let mem = Memtable::new(1 << 20);
            for i in 0..50 {
                seq += 1;
                let user_key = format!("key{:04}", (batch * 37 + i * 13) % 200);
                mem.add(
                    seq,
                    KeyType::Value,
                    user_key.as_bytes(),
                    format!("value-{seq}").as_bytes(),
                );
            }
            version.write_level0_table(&mem).expect("flush");
        }

        let mut before = Vec::new();
        for i in 0..200 {
            let user_key = format!("key{:04}", i);
            before.push(version.get(user_key.as_bytes(), u64::MAX).expect("get"));
        }

        while version.compact().expect("compact") {}

        for (i, expected) in before.iter().enumerate() {
            let user_key = format!("key{:04}", i);
            assert_eq!(
                &version.get(user_key.as_bytes(), u64::MAX).expect("get"),
                expected,
                "key {user_key} changed across compaction"
            );
        }
    }

    #[test]
    fn test_trivial_move() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = test_config(dir.path());
        let mut version = Version::new(&config).expect("new");

        // A single oversized level-1 file with an empty level 2 moves down
        // without being rewritten.
        flush_memtable(&mut version, &[(1, b"a", b"1"), (2, b"z", b"2")]);
        let meta = version.files[0].pop().unwrap();
        let number = meta.number;
        let oversized = Arc::new(FileMetaData {
            file_size: 100 << 20,
            ..(*meta).clone()
        });
        version.add_file(1, oversized);

        let mtime_before = std::fs::metadata(files::sstable_file_name(dir.path(), number))
            .expect("stat")
            .modified()
            .expect("mtime");

        assert!(version.compact().expect("compact"));
        assert_eq!(version.num_level_files(1), 0);
        assert_eq!(version.num_level_files(2), 1);
        assert_eq!(version.files[2][0].number, number);
        assert!(!version.compact_pointer[1].is_empty());

        let mtime_after = std::fs::metadata(files::sstable_file_name(dir.path(), number))
            .expect("stat")
            .modified()
            .expect("mtime");
        assert_eq!(mtime_before, mtime_after, "file must not be rewritten");

        assert_eq!(
            version.get(b"a", u64::MAX).expect("get"),
            Some(Some(b"1".to_vec()))
        );
    }

    #[test]
    fn test_tombstones_dropped_only_at_bottom_level() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = test_config(dir.path());

        // Compacting L0 into L1 must keep the tombstone.
        let mut version = Version::new(&config).expect("new");
        flush_memtable(&mut version, &[(1, b"a", b"1")]);
        let mem = Memtable::new(1 << 20);
        mem.add(2, KeyType::Deletion, b"a", &[]);
        mem.add(3, KeyType::Value, b"b", b"2");
        version.write_level0_table(&mem).expect("flush");

        assert!(version.compact().expect("compact"));
        assert_eq!(version.get(b"a", u64::MAX).expect("get"), Some(None));

        // The same records merged into the bottom level drop both the
        // tombstone and the key it masked.
        let meta = version.files[1].pop().unwrap();
        version.add_file(NUM_LEVELS - 2, Arc::clone(&meta));
        let c = Compaction {
            level: NUM_LEVELS - 2,
            inputs: [vec![meta], Vec::new()],
            smallest: Vec::new(),
            largest: Vec::new(),
        };
        let outputs = version.compact_output(&c).expect("output");
        assert_eq!(outputs.len(), 1);

        let table = version.open_table(&outputs[0]).expect("open");
        assert_eq!(table.get(&lookup_key(b"a", u64::MAX)).expect("get"), None);
        assert_eq!(
            table.get(&lookup_key(b"b", u64::MAX)).expect("get"),
            Some(Some(b"2".to_vec()))
        );
    }

    #[test]
    fn test_output_rotation_by_file_size() {
        let dir = tempfile::tempdir().expect("temp dir");
        // Cap output files at 32KB to force rotation.
        let config = Config::new(dir.path())
            .l0_compaction_trigger(2)
            .max_file_size(32 * 1024);
        let mut version = Version::new(&config).expect("new");

        let mut seq = 0u64;
        for batch in 0..3 {
            let mem = Memtable::new(1 << 20);
            for i in 0..300 {
                seq += 1;
                mem.add(
                    seq,
                    KeyType::Value,
                    format!("key{:02}-{:04}", batch, i).as_bytes(),
                    &[7u8; 100],
                );
            }
            version.write_level0_table(&mem).expect("flush");
        }

        assert!(version.compact().expect("compact"));
        assert!(
            version.num_level_files(1) > 1,
            "expected multiple output files, got {}",
            version.num_level_files(1)
        );

        // Level 1 ranges stay disjoint and sorted.
        let level1 = &version.files[1];
        for pair in level1.windows(2) {
            assert!(pair[0].largest.user_key < pair[1].smallest.user_key);
        }
    }
}
