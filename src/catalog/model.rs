//! Backup records

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content_store::{BlobHash, PutOutcome};
use crate::partition::PartitionKey;

/// One partition's serialized content at backup time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRef {
    pub partition: PartitionKey,
    pub hash: BlobHash,
    /// Serialized size before compression
    pub size: u64,
    /// Bytes the blob occupies in the content store
    #[serde(default)]
    pub stored_size: u64,
    #[serde(default)]
    pub compressed: bool,
}

impl PartitionRef {
    pub fn from_put(partition: PartitionKey, out: &PutOutcome) -> Self {
        Self {
            partition,
            hash: out.hash,
            size: out.size,
            stored_size: out.stored_size,
            compressed: out.compressed,
        }
    }
}

/// An immutable catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Safety backups taken automatically before a restore
    #[serde(default)]
    pub temporary: bool,
    pub partitions: Vec<PartitionRef>,
    /// Sum of partition sizes
    pub total_size: u64,
    /// Bytes this backup added to the content store
    pub stored_size: u64,
    /// Sum of on-disk blob sizes, after compression
    #[serde(default)]
    pub zipped_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_url: Option<String>,
}

impl Backup {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &BlobHash> {
        self.partitions.iter().map(|p| &p.hash)
    }

    /// Distinct blobs referenced.
    pub fn unique_hashes(&self) -> BTreeSet<BlobHash> {
        self.hashes().copied().collect()
    }

    pub fn worlds(&self) -> BTreeSet<&str> {
        self.partitions.iter().map(|p| p.partition.world.as_str()).collect()
    }

    /// One-line summary used by listings.
    pub fn describe(&self) -> String {
        let mut s = format!(
            "#{} {} ({} partitions, {} bytes)",
            self.id,
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.partitions.len(),
            self.total_size
        );
        if let Some(ref comment) = self.comment {
            s.push_str(": ");
            s.push_str(comment);
        }
        s
    }

    #[cfg(test)]
    pub(crate) fn for_test(id: u64, partitions: Vec<PartitionRef>) -> Self {
        let total_size = partitions.iter().map(|p| p.size).sum();
        let zipped_size = partitions.iter().map(|p| p.stored_size).sum();
        Self {
            id,
            created_at: Utc::now(),
            comment: None,
            temporary: false,
            partitions,
            total_size,
            stored_size: total_size,
            zipped_size,
            cloud_url: None,
        }
    }
}

/// A backup about to be committed; the catalog assigns the id.
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub created_at: DateTime<Utc>,
    pub comment: Option<String>,
    pub temporary: bool,
    pub partitions: Vec<PartitionRef>,
    pub stored_size: u64,
}

impl NewBackup {
    pub fn new(comment: Option<String>, partitions: Vec<PartitionRef>) -> Self {
        Self {
            created_at: Utc::now(),
            comment,
            temporary: false,
            partitions,
            stored_size: 0,
        }
    }

    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn stored_size(mut self, bytes: u64) -> Self {
        self.stored_size = bytes;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    pub(crate) fn into_backup(self, id: u64) -> Backup {
        let total_size = self.partitions.iter().map(|p| p.size).sum();
        let zipped_size = self.partitions.iter().map(|p| p.stored_size).sum();
        Backup {
            id,
            created_at: self.created_at,
            comment: self.comment,
            temporary: self.temporary,
            partitions: self.partitions,
            total_size,
            stored_size: self.stored_size,
            zipped_size,
            cloud_url: None,
        }
    }
}
