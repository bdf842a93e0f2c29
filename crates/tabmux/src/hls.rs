//! Rewrites HLS quality playlists so segment references point at the local
//! streaming route instead of `mtproto:<doc id>` placeholders.

use std::sync::Arc;

use async_trait::async_trait;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::account::AccountNumber;
use crate::channel::Hub;
use crate::message::TabCall;
use crate::storage::{KeyValueStore, StorageError};

const DOCUMENT_REFERENCE: &str = r"mtproto:(\d+)";

#[derive(Debug, Error)]
pub enum HlsError {
    #[error("malformed quality file: {0}")]
    MalformedInput(String),
    #[error("document source failed: {0}")]
    Source(String),
    #[error("quality file cache failed: {0}")]
    Cache(#[from] StorageError),
    #[error("invalid stream origin: {0}")]
    InvalidOrigin(#[from] url::ParseError),
    #[error("invalid reference pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub dc_id: u32,
    pub size: u64,
    pub mime_type: String,
}

/// Network-side access to documents, owned by the file layer.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Downloads the playlist document as text.
    async fn download_doc(&self, doc_id: &str, account: AccountNumber) -> Result<String, HlsError>;

    async fn request_doc(&self, doc_id: &str, account: AccountNumber) -> Result<DocumentInfo, HlsError>;
}

/// Asks a connected tab to fetch documents on the worker's behalf.
pub struct TabDocumentSource {
    hub: Hub,
}

impl TabDocumentSource {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }

    async fn ask<R>(&self, call: TabCall) -> Result<R, HlsError>
    where
        R: serde::de::DeserializeOwned,
    {
        let target = self
            .hub
            .registry()
            .ids()
            .into_iter()
            .next()
            .ok_or_else(|| HlsError::Source("no tab connected".to_string()))?;
        self.hub
            .invoke(target, call)
            .await
            .map_err(|error| HlsError::Source(error.to_string()))
    }
}

#[async_trait]
impl DocumentSource for TabDocumentSource {
    async fn download_doc(&self, doc_id: &str, account: AccountNumber) -> Result<String, HlsError> {
        self.ask(TabCall::DownloadDoc {
            doc_id: doc_id.to_string(),
            account,
        })
        .await
    }

    async fn request_doc(&self, doc_id: &str, account: AccountNumber) -> Result<DocumentInfo, HlsError> {
        self.ask(TabCall::RequestDoc {
            doc_id: doc_id.to_string(),
            account,
        })
        .await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamParams<'a> {
    doc_id: &'a str,
    dc_id: u32,
    size: u64,
    mime_type: &'a str,
}

pub struct QualityFileRewriter {
    source: Arc<dyn DocumentSource>,
    cache: Arc<dyn KeyValueStore>,
    origin: Url,
    pattern: Regex,
}

impl QualityFileRewriter {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        cache: Arc<dyn KeyValueStore>,
        origin: &str,
    ) -> Result<Self, HlsError> {
        Ok(Self {
            source,
            cache,
            origin: Url::parse(origin)?,
            pattern: Regex::new(DOCUMENT_REFERENCE)?,
        })
    }

    pub async fn rewrite(&self, doc_id: &str, account: AccountNumber) -> Result<String, HlsError> {
        let playlist = self.quality_file(doc_id, account).await?;

        let target_doc_id = self
            .pattern
            .captures(&playlist)
            .and_then(|captures| captures.get(1))
            .map(|capture| capture.as_str().to_string())
            .ok_or_else(|| {
                HlsError::MalformedInput(format!("no document reference in quality file {doc_id}"))
            })?;
        debug!(doc_id, target_doc_id = %target_doc_id, "resolving quality file target");

        let document = self.source.request_doc(&target_doc_id, account).await?;
        let target = self.stream_url(&target_doc_id, &document)?;
        Ok(self
            .pattern
            .replace_all(&playlist, NoExpand(target.as_str()))
            .into_owned())
    }

    async fn quality_file(&self, doc_id: &str, account: AccountNumber) -> Result<String, HlsError> {
        let cache_key = format!("hls_quality_{doc_id}");
        if let Some(Value::String(cached)) = self.cache.get(&cache_key).await? {
            debug!(doc_id, "using cached quality file");
            return Ok(cached);
        }
        info!(doc_id, account = account.get(), "fetching quality file");
        let playlist = self.source.download_doc(doc_id, account).await?;
        self.cache
            .set(&cache_key, Value::String(playlist.clone()))
            .await?;
        Ok(playlist)
    }

    fn stream_url(&self, doc_id: &str, document: &DocumentInfo) -> Result<Url, HlsError> {
        let params = serde_json::to_string(&StreamParams {
            doc_id,
            dc_id: document.dc_id,
            size: document.size,
            mime_type: &document.mime_type,
        })
        .map_err(StorageError::from)?;
        let encoded: String = url::form_urlencoded::byte_serialize(params.as_bytes()).collect();
        Ok(self.origin.join(&format!("hls_stream/{encoded}"))?)
    }
}
