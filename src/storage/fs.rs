//! Filesystem blob store: one file per key.
//!
//! ```text
//! <root>/state.json
//! <root>/regions/c.<x>.<z>.json
//! <root>/graphs/<016X id>.json
//! ```
//!
//! Writes go to a temporary sibling first and are renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::{BlobKey, BlobKind, BlobStore};
use crate::model::{ColumnPos, GraphId};
use crate::Result;

const REGIONS_DIR: &str = "regions";
const GRAPHS_DIR: &str = "graphs";
const STATE_FILE: &str = "state.json";
const EXTENSION: &str = ".json";

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    sync_writes: bool,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self { root: root.into(), sync_writes }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, key: &BlobKey) -> PathBuf {
        match key {
            BlobKey::Region(pos) => self
                .root
                .join(REGIONS_DIR)
                .join(format!("c.{}.{}{EXTENSION}", pos.x, pos.z)),
            BlobKey::Graph(id) => self.root.join(GRAPHS_DIR).join(format!("{}{EXTENSION}", id.to_hex())),
            BlobKey::State => self.root.join(STATE_FILE),
        }
    }

    async fn write_atomic(&self, path: &Path, blob: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(blob).await?;
        if self.sync_writes {
            file.sync_data().await?;
        }
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn parse_region_name(name: &str) -> Option<ColumnPos> {
    let rest = name.strip_prefix("c.")?.strip_suffix(EXTENSION)?;
    let (x, z) = rest.split_once('.')?;
    Some(ColumnPos::new(x.parse().ok()?, z.parse().ok()?))
}

fn parse_graph_name(name: &str) -> Option<GraphId> {
    GraphId::from_hex(name.strip_suffix(EXTENSION)?)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, key: &BlobKey) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_of(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &BlobKey, blob: Option<Bytes>) -> Result<()> {
        let path = self.path_of(key);
        match blob {
            Some(blob) => self.write_atomic(&path, &blob).await,
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn list(&self, kind: BlobKind) -> Result<Vec<BlobKey>> {
        let dir = match kind {
            BlobKind::State => {
                let exists = tokio::fs::try_exists(self.root.join(STATE_FILE)).await?;
                return Ok(if exists { vec![BlobKey::State] } else { Vec::new() });
            }
            BlobKind::Region => self.root.join(REGIONS_DIR),
            BlobKind::Graph => self.root.join(GRAPHS_DIR),
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue;
            }
            let key = match kind {
                BlobKind::Region => parse_region_name(name).map(BlobKey::Region),
                _ => parse_graph_name(name).map(BlobKey::Graph),
            };
            match key {
                Some(key) => keys.push(key),
                None => tracing::warn!(file = %entry.path().display(), "skipping unrecognised blob file"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_file_name_parsing() {
        assert_eq!(parse_region_name("c.-3.12.json"), Some(ColumnPos::new(-3, 12)));
        assert_eq!(parse_region_name("c.3.json"), None);
        assert_eq!(parse_graph_name("00000000000000FF.json"), Some(GraphId(255)));
        assert_eq!(parse_graph_name("notes.txt"), None);
    }

    #[tokio::test]
    async fn test_fs_store_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), true);

        let region = BlobKey::Region(ColumnPos::new(-1, 4));
        let graph = BlobKey::Graph(GraphId(42));
        store.write(&region, Some(Bytes::from_static(b"{}"))).await.unwrap();
        store.write(&graph, Some(Bytes::from_static(b"[1]"))).await.unwrap();
        tokio::fs::write(dir.path().join(GRAPHS_DIR).join("junk.bin"), b"x").await.unwrap();

        assert_eq!(store.read(&graph).await.unwrap(), Some(Bytes::from_static(b"[1]")));
        assert_eq!(store.list(BlobKind::Region).await.unwrap(), vec![region]);
        assert_eq!(store.list(BlobKind::Graph).await.unwrap(), vec![graph]);
        assert!(store.list(BlobKind::State).await.unwrap().is_empty());

        store.write(&graph, None).await.unwrap();
        store.write(&graph, None).await.unwrap();
        assert_eq!(store.read(&graph).await.unwrap(), None);
    }
}
