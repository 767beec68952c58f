//! Write buffer
//!
//! Commits are held in memory, sorted by object id, until the next flush. There
//! is at most one pending commit per object; committing again replaces it.
//! Every commit bumps the object's change id, which readers use to detect that
//! an object changed underneath them.

use crate::artifact::{padded_size, Artifact, AssetState, ObjectId};
use crate::depval::{DependencyToken, DependentFile};
use crate::error::{ArchiveError, Result};
use std::collections::HashMap;
use std::fmt;

/// Callback invoked once the commit has been written out
pub type FlushCallback = Box<dyn FnOnce() + Send + 'static>;

/// A buffered commit awaiting flush
pub struct PendingCommit {
    pub object_id: ObjectId,
    pub artifacts: Vec<Artifact>,
    pub display_name: String,
    pub state: AssetState,
    pub dep_val: DependencyToken,
    pub on_flush: Option<FlushCallback>,
    /// Sum of padded sizes of the binary artifacts
    pub total_binary_size: u32,
}

impl PendingCommit {
    /// Validate and assemble a commit
    ///
    /// Rejects empty artifacts, anything that cannot be addressed with 32-bit
    /// offsets and the `Pending` state.
    pub fn new(
        object_id: ObjectId,
        display_name: impl Into<String>,
        artifacts: Vec<Artifact>,
        state: AssetState,
        deps: Vec<DependentFile>,
        on_flush: Option<FlushCallback>,
    ) -> Result<Self> {
        if state == AssetState::Pending {
            return Err(ArchiveError::InvalidState(object_id));
        }

        let mut total: u64 = 0;
        for artifact in &artifacts {
            if artifact.data.is_empty() {
                return Err(ArchiveError::InvalidArtifact(object_id));
            }
            if !artifact.is_binary() {
                continue;
            }
            let size = u32::try_from(artifact.data.len())
                .map_err(|_| ArchiveError::ArtifactTooLarge(artifact.data.len() as u64))?;
            total += padded_size(size);
        }
        let total_binary_size =
            u32::try_from(total).map_err(|_| ArchiveError::ArtifactTooLarge(total))?;

        Ok(PendingCommit {
            object_id,
            artifacts,
            display_name: display_name.into(),
            state,
            dep_val: DependencyToken::new(deps),
            on_flush,
            total_binary_size,
        })
    }

    pub fn binary_artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter().filter(|a| a.is_binary())
    }

    pub fn find_artifact(&self, chunk_type_code: u64) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.chunk_type_code == chunk_type_code)
    }
}

impl fmt::Debug for PendingCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommit")
            .field("object_id", &format_args!("{:#x}", self.object_id))
            .field("display_name", &self.display_name)
            .field("state", &self.state)
            .field("artifacts", &self.artifacts.len())
            .field("total_binary_size", &self.total_binary_size)
            .field("has_callback", &self.on_flush.is_some())
            .finish()
    }
}

/// Sorted pending commits plus the change id table
#[derive(Debug, Default)]
pub struct WriteBuffer {
    commits: Vec<PendingCommit>,
    change_ids: HashMap<ObjectId, u32>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the pending commit for its object; returns the new change id
    pub fn insert(&mut self, commit: PendingCommit) -> u32 {
        let object_id = commit.object_id;
        match self
            .commits
            .binary_search_by_key(&object_id, |c| c.object_id)
        {
            Ok(index) => self.commits[index] = commit,
            Err(index) => self.commits.insert(index, commit),
        }

        let change_id = self.change_ids.entry(object_id).or_insert(0);
        *change_id = change_id.wrapping_add(1);
        *change_id
    }

    pub fn get(&self, object_id: ObjectId) -> Option<&PendingCommit> {
        self.commits
            .binary_search_by_key(&object_id, |c| c.object_id)
            .ok()
            .map(|i| &self.commits[i])
    }

    /// Change id of an object; 0 if it was never committed
    pub fn change_id(&self, object_id: ObjectId) -> u32 {
        self.change_ids.get(&object_id).copied().unwrap_or(0)
    }

    pub fn commits(&self) -> &[PendingCommit] {
        &self.commits
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Remove every pending commit. Change ids are kept.
    pub fn take_all(&mut self) -> Vec<PendingCommit> {
        std::mem::take(&mut self.commits)
    }
}
