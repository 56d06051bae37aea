use crate::core::QualifyResult;
use crate::error::Result;
use crate::reasoner::Reasoner;
use crate::storage::Store;
use tracing::info;

/// Count the solutions of every query against every known graph.
///
/// Every graph is a key of the result with one count per query, index-aligned.
/// The first failing evaluation aborts the whole batch.
pub(crate) async fn qualify(
    store: &dyn Store,
    reasoner: &dyn Reasoner,
    queries: &[String],
) -> Result<QualifyResult> {
    let graphs = store.graphs().await.map_err(|e| e.context("Could not list graphs"))?;
    let mut result: QualifyResult =
        graphs.iter().map(|g| (g.clone(), vec![0; queries.len()])).collect();

    for (idx, query) in queries.iter().enumerate() {
        for graph in &graphs {
            let count = reasoner
                .query(graph, query)
                .await
                .map_err(|e| e.context(format!("Could not qualify query {} on graph {}", idx, graph)))?
                .len();
            info!(graph = %graph, query = idx, count, "Qualified query");
            if let Some(counts) = result.get_mut(graph) {
                counts[idx] = count;
            }
        }
    }
    Ok(result)
}
