//! Query target resolution: explicit ids, URIs/names, or a SPARQL query whose
//! URI bindings are matched against the catalog.

use crate::core::{Query, QueryTarget};
use crate::error::Result;
use crate::reasoner::{Reasoner, SparqlResults, ALL_GRAPHS};
use crate::storage::Store;
use std::collections::HashSet;
use tracing::debug;

pub(crate) async fn resolve_ids(
    store: &dyn Store,
    reasoner: &dyn Reasoner,
    query: &Query,
) -> Result<Vec<i64>> {
    match query.target() {
        QueryTarget::Sparql(sparql) => {
            let graph = sparql_graph(&query.sources);
            let results = reasoner
                .query(graph, sparql)
                .await
                .map_err(|e| e.context(format!("Could not run query against graph {}", graph)))?;
            let uris = bound_uris(&results);
            debug!(graph, solutions = results.len(), uris = uris.len(), "Resolved SPARQL bindings");
            if uris.is_empty() {
                return Ok(Vec::new());
            }
            store.resolve_ids(&uris, &query.sources).await
        }
        QueryTarget::Uris(uris) => store.resolve_ids(uris, &query.sources).await,
        QueryTarget::Ids(ids) => Ok(ids.to_vec()),
    }
}

/// A single source filter narrows the reasoner to that graph; otherwise every graph is searched.
pub fn sparql_graph(sources: &[String]) -> &str {
    match sources {
        [only] => only,
        _ => ALL_GRAPHS,
    }
}

/// Every URI bound in any column, deduplicated, in result order.
pub fn bound_uris(results: &SparqlResults) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut uris = Vec::new();
    for row in &results.results.bindings {
        let mut columns: Vec<&String> = results.head.vars.iter().filter(|v| row.contains_key(*v)).collect();
        let mut extra: Vec<&String> =
            row.keys().filter(|k| !results.head.vars.contains(*k)).collect();
        extra.sort();
        columns.extend(extra);

        for column in columns {
            let binding = &row[column];
            if binding.is_uri() && seen.insert(binding.value.clone()) {
                uris.push(binding.value.clone());
            }
        }
    }
    uris
}
