//! Semantic-query reasoners.
//!
//! A reasoner evaluates a SPARQL query against one named metadata graph and
//! answers with SPARQL JSON result bindings. The graph names `all` and `default`
//! stand for the union of every graph.

use crate::error::Result;
use crate::storage::Store;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod embedded;
pub mod http_client;

pub use embedded::EmbeddedReasoner;
pub use http_client::HttpReasoner;

/// Graph name meaning "every graph"
pub const ALL_GRAPHS: &str = "all";

/// Graph used when a caller does not name one
pub const DEFAULT_GRAPH: &str = "default";

/// Prefixes made available to every query.
pub const STANDARD_PREFIXES: &str = "PREFIX brick: <https://brickschema.org/schema/Brick#>
PREFIX tag: <https://brickschema.org/schema/BrickTag#>
PREFIX rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
PREFIX owl: <http://www.w3.org/2002/07/owl#>
PREFIX qudt: <http://qudt.org/schema/qudt/>
";

/// SPARQL 1.1 JSON results (`application/sparql-results+json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparqlResults {
    #[serde(default)]
    pub head: SparqlHead,
    #[serde(default)]
    pub results: SparqlBindings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparqlHead {
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparqlBindings {
    #[serde(default)]
    pub bindings: Vec<HashMap<String, Binding>>,
}

/// One bound value: `uri`, `literal`, `typed-literal` or `bnode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(rename = "xml:lang", default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl Binding {
    pub fn uri(value: &str) -> Self {
        Self { kind: "uri".to_string(), value: value.to_string(), datatype: None, lang: None }
    }

    pub fn is_uri(&self) -> bool {
        self.kind == "uri"
    }
}

impl SparqlResults {
    /// Number of solutions.
    pub fn len(&self) -> usize {
        self.results.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.bindings.is_empty()
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn query(&self, graph: &str, query: &str) -> Result<SparqlResults>;

    /// The reasoner's JSON answer, unparsed.
    async fn query_raw(&self, graph: &str, query: &str) -> Result<String>;

    /// Called after the metadata store changed. Remote reasoners read the store
    /// themselves and ignore this.
    async fn refresh(&self, _store: &dyn Store) -> Result<()> {
        Ok(())
    }
}

/// Empty graph names mean the default graph.
pub fn graph_or_default(graph: &str) -> &str {
    if graph.is_empty() {
        DEFAULT_GRAPH
    } else {
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sparql_json() {
        let body = r#"{
            "head": {"vars": ["sensor", "label"]},
            "results": {"bindings": [
                {"sensor": {"type": "uri", "value": "http://ex.org/t1"},
                 "label": {"type": "literal", "value": "Temp", "xml:lang": "en"}}
            ]}
        }"#;
        let results: SparqlResults = serde_json::from_str(body).unwrap();
        assert_eq!(results.head.vars, vec!["sensor", "label"]);
        assert_eq!(results.len(), 1);
        let row = &results.results.bindings[0];
        assert!(row["sensor"].is_uri());
        assert_eq!(row["label"].lang.as_deref(), Some("en"));
    }

    #[test]
    fn test_graph_or_default() {
        assert_eq!(graph_or_default(""), "default");
        assert_eq!(graph_or_default("bldg1"), "bldg1");
    }
}
