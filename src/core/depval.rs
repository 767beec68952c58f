//! Dependency validation
//!
//! Every cached object records the source files it was built from, together
//! with a snapshot of each file's state at build time. The object is only
//! considered valid while every recorded snapshot still matches the file on
//! the storage backend.

use crate::artifact::ObjectId;
use crate::error::{ArchiveError, Result};
use crate::storage::Storage;
use crate::text_table::{self, TextGroup};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const DOES_NOT_EXIST: &str = "doesnotexist";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotState {
    Normal,
    DoesNotExist,
}

/// State of one file at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub state: SnapshotState,
    /// Nanoseconds since the Unix epoch; 0 when the file does not exist
    pub modification_time: u64,
}

impl FileSnapshot {
    pub fn normal(modification_time: u64) -> Self {
        FileSnapshot {
            state: SnapshotState::Normal,
            modification_time,
        }
    }

    pub fn does_not_exist() -> Self {
        FileSnapshot {
            state: SnapshotState::DoesNotExist,
            modification_time: 0,
        }
    }
}

/// A source file an object depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentFile {
    pub filename: String,
    pub snapshot: FileSnapshot,
}

impl DependentFile {
    pub fn new(filename: impl Into<String>, snapshot: FileSnapshot) -> Self {
        DependentFile {
            filename: filename.into(),
            snapshot,
        }
    }
}

/// The recorded dependencies of one object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyToken {
    files: Vec<DependentFile>,
}

impl DependencyToken {
    pub fn new(files: Vec<DependentFile>) -> Self {
        DependencyToken { files }
    }

    pub fn files(&self) -> &[DependentFile] {
        &self.files
    }

    /// Number of recorded files whose current state differs from the snapshot
    ///
    /// Zero means the token is still valid.
    pub fn validation_index(&self, storage: &dyn Storage) -> u32 {
        self.files
            .iter()
            .filter(|f| storage.snapshot(Path::new(&f.filename)) != f.snapshot)
            .count() as u32
    }

    pub fn is_valid(&self, storage: &dyn Storage) -> bool {
        self.validation_index(storage) == 0
    }
}

/// Dependencies of every flushed object, as stored in the `.deps` file
pub type DependencyTable = BTreeMap<ObjectId, Vec<DependentFile>>;

/// Parse the `.deps` file contents
pub fn parse_dependency_table(text: &str) -> Result<DependencyTable> {
    let mut table = DependencyTable::new();
    for group in text_table::parse_grouped(text)? {
        let object_id = u64::from_str_radix(&group.name, 16).map_err(|_| {
            ArchiveError::CorruptDirectory(format!("bad object id '{}' in dependency table", group.name))
        })?;

        let mut files = Vec::with_capacity(group.entries.len());
        for (filename, value) in group.entries {
            let snapshot = if value == DOES_NOT_EXIST {
                FileSnapshot::does_not_exist()
            } else {
                let time = u64::from_str_radix(&value, 16).map_err(|_| {
                    ArchiveError::CorruptDirectory(format!(
                        "bad modification time '{}' for '{}'",
                        value, filename
                    ))
                })?;
                FileSnapshot::normal(time)
            };
            files.push(DependentFile { filename, snapshot });
        }

        // Repeated groups extend the same object
        table.entry(object_id).or_default().extend(files);
    }
    Ok(table)
}

/// Serialize a dependency table for the `.deps` file
pub fn write_dependency_table(table: &DependencyTable) -> String {
    let groups: Vec<TextGroup> = table
        .iter()
        .map(|(object_id, files)| TextGroup {
            name: format!("{:x}", object_id),
            entries: files
                .iter()
                .map(|f| {
                    let value = match f.snapshot.state {
                        SnapshotState::DoesNotExist => DOES_NOT_EXIST.to_string(),
                        SnapshotState::Normal => format!("{:x}", f.snapshot.modification_time),
                    };
                    (f.filename.clone(), value)
                })
                .collect(),
        })
        .collect();
    text_table::write_grouped(&groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_token_validity() {
        let storage = MemoryStorage::new();
        storage.touch("src/a.txt", 100);

        let token = DependencyToken::new(vec![
            DependentFile::new("src/a.txt", FileSnapshot::normal(100)),
            DependentFile::new("src/missing.txt", FileSnapshot::does_not_exist()),
        ]);
        assert_eq!(token.validation_index(&storage), 0);
        assert!(token.is_valid(&storage));

        storage.touch("src/a.txt", 200);
        assert_eq!(token.validation_index(&storage), 1);

        storage.touch("src/missing.txt", 5);
        assert_eq!(token.validation_index(&storage), 2);
        assert!(!token.is_valid(&storage));
    }

    #[test]
    fn test_empty_token_is_valid() {
        let storage = MemoryStorage::new();
        assert!(DependencyToken::default().is_valid(&storage));
    }

    #[test]
    fn test_table_text_form() {
        let mut table = DependencyTable::new();
        table.insert(
            0xabc,
            vec![
                DependentFile::new("foo.txt", FileSnapshot::normal(100)),
                DependentFile::new("gone.txt", FileSnapshot::does_not_exist()),
            ],
        );

        let text = write_dependency_table(&table);
        assert_eq!(text, "abc=~\n\tfoo.txt=64\n\tgone.txt=doesnotexist\n");
        assert_eq!(parse_dependency_table(&text).unwrap(), table);
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(parse_dependency_table("xyz=~\n\tfoo.txt=64\n").is_err());
        assert!(parse_dependency_table("abc=~\n\tfoo.txt=later\n").is_err());
    }
}
