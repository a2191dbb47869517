// src/sharing.rs

use crate::file_manager::{MarkedFile, StoreError};
use crate::statistics::UploadStatistics;
use crate::transport::{
    parse_range, Command, DiscoveryQuery, PeerRequest, PeerResponse, ResourceHandler, TransportError,
    RESOURCE_TYPE_INDEX,
};
use std::sync::Arc;

/// URI a file is published under.
pub fn resource_base_uri(namespace: &str, key: &str) -> String {
    format!("/{namespace}/{key}")
}

/// Discovery query matching peers that publish the same file.
pub fn resource_query(namespace: &str, key: &str) -> DiscoveryQuery {
    DiscoveryQuery {
        resource_type: RESOURCE_TYPE_INDEX.to_string(),
        interface: format!("{namespace}.if.{key}"),
    }
}

/// Serves a complete file to peers.
pub struct SharedFile {
    file: Arc<MarkedFile>,
    upload: Arc<UploadStatistics>,
    base_uri: String,
    query: DiscoveryQuery,
}

impl SharedFile {
    pub fn new(file: Arc<MarkedFile>, upload: Arc<UploadStatistics>, namespace: &str) -> Self {
        Self {
            base_uri: resource_base_uri(namespace, file.key()),
            query: resource_query(namespace, file.key()),
            file,
            upload,
        }
    }

    fn data(&self, request: &PeerRequest) -> Result<PeerResponse, TransportError> {
        let index = request
            .block
            .ok_or_else(|| TransportError::Forbidden("data request without block".into()))?;
        let range = request
            .range
            .clone()
            .ok_or_else(|| TransportError::Forbidden("data request without range".into()))?;
        let (offset, len) =
            parse_range(&range).ok_or_else(|| TransportError::Forbidden(format!("bad range '{range}'")))?;

        let data = self.file.read_range(index, offset, len).map_err(|e| match e {
            StoreError::BlockOutOfRange(_) | StoreError::RangeOutOfBlock { .. } => {
                TransportError::NotFound(e.to_string())
            }
            StoreError::InUse | StoreError::NotComplete => TransportError::Forbidden(e.to_string()),
            other => TransportError::Failed(other.to_string()),
        })?;

        self.upload.on_data_sent(data.len());
        if offset + len as u64 == self.file.metadata().block_size(index) {
            self.upload.on_block_sent();
        }
        tracing::trace!(file = %self.file.id(), block = index, %range, "served chunk");
        Ok(PeerResponse::Data { range, data })
    }
}

impl ResourceHandler for SharedFile {
    fn base_uri(&self) -> &str {
        &self.base_uri
    }

    fn resource_type(&self) -> &str {
        &self.query.resource_type
    }

    fn interface(&self) -> &str {
        &self.query.interface
    }

    fn handle(&self, request: &PeerRequest) -> Result<PeerResponse, TransportError> {
        let metadata = self.file.metadata();
        match request.command {
            Command::Index => Ok(PeerResponse::Index {
                blocks: metadata.block_count(),
            }),
            Command::Hash => match request.block {
                None => Ok(PeerResponse::Hash(metadata.hash.clone())),
                Some(i) => metadata
                    .blocks
                    .get(i)
                    .map(|b| PeerResponse::Hash(b.hash.clone()))
                    .ok_or_else(|| TransportError::NotFound(format!("block {i}"))),
            },
            Command::Data => self.data(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_manager::test_support::*;
    use crate::file_manager::FileManager;
    use std::time::Duration;

    fn complete_file(data: &[u8]) -> (tempfile::TempDir, Arc<MarkedFile>) {
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), "f", "", data, 100);
        let file = FileManager::new(dir.path()).get_file("f").unwrap();
        let writer = Arc::new(file.try_open_writer().unwrap());
        for (i, chunk) in data.chunks(100).enumerate() {
            let mut block = writer.open_block(i).unwrap();
            block.append(chunk).unwrap();
            block.close().unwrap();
        }
        writer.close().unwrap();
        (dir, file)
    }

    fn request(command: Command, block: Option<usize>, range: Option<&str>) -> PeerRequest {
        PeerRequest {
            base_uri: String::new(),
            block,
            command,
            range: range.map(str::to_string),
        }
    }

    #[test]
    fn serves_index_hashes_and_ranges() {
        let data = pattern(250, 2);
        let (_dir, file) = complete_file(&data);
        let upload = Arc::new(UploadStatistics::new(Duration::from_secs(5)));
        let shared = SharedFile::new(file.clone(), upload.clone(), "ns");
        assert_eq!(shared.base_uri(), format!("/ns/{}", file.key()));

        assert_eq!(
            shared.handle(&request(Command::Index, None, None)).unwrap(),
            PeerResponse::Index { blocks: 3 }
        );
        assert_eq!(
            shared.handle(&request(Command::Hash, None, None)).unwrap(),
            PeerResponse::Hash(file.metadata().hash.clone())
        );
        assert_eq!(
            shared.handle(&request(Command::Data, Some(2), Some("10-40"))).unwrap(),
            PeerResponse::Data {
                range: "10-40".into(),
                data: data[210..250].to_vec()
            }
        );
        let snap = upload.snapshot();
        assert_eq!(snap.total.bytes, 40);
        assert_eq!(snap.total.blocks, 1);
    }

    #[test]
    fn rejects_malformed_and_out_of_block_requests() {
        let data = pattern(200, 2);
        let (_dir, file) = complete_file(&data);
        let upload = Arc::new(UploadStatistics::new(Duration::from_secs(5)));
        let shared = SharedFile::new(file, upload, "ns");

        assert!(matches!(
            shared.handle(&request(Command::Data, Some(0), Some("nope"))),
            Err(TransportError::Forbidden(_))
        ));
        assert!(matches!(
            shared.handle(&request(Command::Data, Some(0), Some("90-20"))),
            Err(TransportError::NotFound(_))
        ));
        assert!(matches!(
            shared.handle(&request(Command::Hash, Some(9), None)),
            Err(TransportError::NotFound(_))
        ));
    }
}
