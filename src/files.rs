//! Database file-name conventions and the atomic CURRENT swap.
//!
//! All engine files live directly under the database directory:
//!
//! ```text
//! CURRENT           decimal ASCII of the live manifest's file number
//! MANIFEST-NNNNNN   encoded Version snapshot
//! NNNNNN.ldb        SSTable file
//! NNNNNN.dbtmp      temp file used for the atomic CURRENT swap
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn manifest_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", number))
}

pub fn sstable_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.ldb", number))
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.dbtmp", number))
}

/// Point CURRENT at the manifest named by `number`.
///
/// The content is written to a temp file, synced, and renamed over
/// CURRENT. The rename is the linearization point: CURRENT always names a
/// completely written manifest.
pub fn set_current_file(dir: &Path, number: u64) -> Result<()> {
    let tmp = temp_file_name(dir, number);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(format!("{}", number).as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, current_file_name(dir))?;
    Ok(())
}

/// Read the manifest number from CURRENT. Returns `None` for a fresh
/// database (missing or unparsable CURRENT).
pub fn read_current_file(dir: &Path) -> Option<u64> {
    let content = fs::read_to_string(current_file_name(dir)).ok()?;
    content.trim().parse::<u64>().ok()
}

/// The file number of an SSTable file name, or `None` for anything else.
pub fn parse_sstable_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".ldb")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse::<u64>().ok()
}
