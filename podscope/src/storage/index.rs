//! Search-index backend
//!
//! POSTs each document as JSON to `/<index>/_doc` with basic auth. A failed
//! write is reported to the dispatcher and does not block other backends.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{AgentError, Result};
use crate::storage::{Document, StorageBackend};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IndexBackend {
    client: reqwest::Client,
    doc_url: String,
    username: String,
    password: String,
}

impl IndexBackend {
    /// `address` is the node base URL, e.g. `http://es-1:9200`.
    pub fn new(address: &str, username: &str, password: &str, index: &str) -> Result<IndexBackend> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base = address.trim_end_matches('/');
        Ok(IndexBackend {
            client,
            doc_url: format!("{base}/{index}/_doc"),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Check the node answers at all; used at agent init to report a
    /// misconfigured index early without refusing to start.
    pub async fn ping(&self, address: &str) -> Result<()> {
        let resp = self
            .client
            .get(address)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AgentError::InvalidArgs(format!(
                "index node returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for IndexBackend {
    fn name(&self) -> &str {
        "index"
    }

    async fn write(&self, doc: &Document) -> Result<()> {
        let resp = self
            .client
            .post(&self.doc_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(doc)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::InvalidArgs(format!(
                "index document failed with status {status}: {body}"
            )));
        }
        Ok(())
    }
}
