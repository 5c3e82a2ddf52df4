//! Directory gossip (spec §4.9 "Directory gossip", C10): each node
//! publishes its own record to a shared directory and polls it for peers
//! it doesn't yet know. The spec explicitly keeps the directory's backing
//! store out of core scope ("the source uses a filesystem path as a
//! stand-in and this is NOT part of the core") — [`DirectoryClient`] is
//! the seam; this module ships only the trait plus an in-memory double
//! for tests, mirroring how the teacher keeps `ServiceHandler`
//! (`turn-server::observer::Observer`) as a trait the binary implements.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use codec::discovery::DirectoryRecord;
use parking_lot::Mutex;

/// How often each node publishes its own record and polls for others
/// (spec §4.9).
pub const POLL_INTERVAL_SECS: u64 = 30;

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn publish(&self, record: DirectoryRecord) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<DirectoryRecord>>;
}

/// In-memory stand-in used by tests and by any deployment that hasn't
/// wired up a real HTTP/KV-backed directory. Keyed by peer id so a
/// republish overwrites rather than duplicates.
#[derive(Default)]
pub struct InMemoryDirectory {
    records: Mutex<AHashMap<i32, DirectoryRecord>>,
}

impl InMemoryDirectory {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DirectoryClient for InMemoryDirectory {
    async fn publish(&self, record: DirectoryRecord) -> anyhow::Result<()> {
        self.records.lock().insert(record.id, record);
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<DirectoryRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_list_round_trips() {
        let directory = InMemoryDirectory::shared();
        directory
            .publish(DirectoryRecord {
                id: 1,
                ip: "127.0.0.1".into(),
                port: 8000,
                public_ip: "0.0.0.0".into(),
                public_port: 0,
                is_public: false,
            })
            .await
            .unwrap();

        let listed = directory.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 1);
    }

    #[tokio::test]
    async fn republish_overwrites_rather_than_duplicates() {
        let directory = InMemoryDirectory::shared();
        let mut record = DirectoryRecord {
            id: 7,
            ip: "10.0.0.1".into(),
            port: 9000,
            public_ip: "0.0.0.0".into(),
            public_port: 0,
            is_public: false,
        };
        directory.publish(record.clone()).await.unwrap();

        record.port = 9001;
        directory.publish(record).await.unwrap();

        let listed = directory.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].port, 9001);
    }
}
