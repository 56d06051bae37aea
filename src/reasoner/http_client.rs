use super::{graph_or_default, Reasoner, SparqlResults};
use crate::config::ReasonerConfig;
use crate::error::{MortarError, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

/// Client for a remote reasoner serving `POST /query/{graph}`.
#[derive(Debug, Clone)]
pub struct HttpReasoner {
    client: Client,
    address: String,
}

impl HttpReasoner {
    pub fn new(config: &ReasonerConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, address: config.address.clone() })
    }

    fn query_url(&self, graph: &str) -> String {
        format!(
            "http://{}/query/{}",
            self.address,
            urlencoding::encode(graph_or_default(graph))
        )
    }

    async fn post(&self, graph: &str, query: &str) -> Result<reqwest::Response> {
        let url = self.query_url(graph);
        debug!(%url, "Querying reasoner");
        let response = self
            .client
            .post(&url)
            .header("Accept", "application/sparql-results+json")
            .form(&[("query", query)])
            .send()
            .await
            .map_err(|e| MortarError::UpstreamQuery(format!("Could not query {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MortarError::UpstreamQuery(format!(
                "Reasoner answered {} for graph {}: {}",
                status,
                graph_or_default(graph),
                body
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    async fn query(&self, graph: &str, query: &str) -> Result<SparqlResults> {
        let body = self.post(graph, query).await?.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| MortarError::UpstreamQuery(format!("Malformed bindings: {}", e)))
    }

    async fn query_raw(&self, graph: &str, query: &str) -> Result<String> {
        Ok(self.post(graph, query).await?.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_query_url() {
        let reasoner = HttpReasoner::new(&ReasonerConfig {
            address: "localhost:3030".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(reasoner.query_url(""), "http://localhost:3030/query/default");
        assert_eq!(reasoner.query_url("bldg 1"), "http://localhost:3030/query/bldg%201");
    }
}
