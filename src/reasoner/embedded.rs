//! In-process reasoner evaluating SPARQL with oxigraph over the stored statements.
//!
//! Statements live in one oxigraph store with a named graph per source. The
//! store is rebuilt on refresh and shared by every query until the next one.

use super::{Binding, Reasoner, SparqlResults, ALL_GRAPHS, DEFAULT_GRAPH, STANDARD_PREFIXES};
use crate::core::TripleRecord;
use crate::error::{MortarError, Result};
use crate::storage::Store;
use async_trait::async_trait;
use oxigraph::io::{RdfFormat, RdfParser};
use oxigraph::model::vocab::xsd;
use oxigraph::model::{GraphName, NamedNode, Quad, Term};
use oxigraph::sparql::{QueryResults, SparqlEvaluator};
use oxigraph::store::Store as RdfStore;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use tracing::debug;

/// The statements loaded by the last refresh.
#[derive(Clone)]
struct Loaded {
    store: RdfStore,
    sources: BTreeSet<String>,
}

#[derive(Default)]
pub struct EmbeddedReasoner {
    loaded: RwLock<Option<Loaded>>,
}

impl std::fmt::Debug for EmbeddedReasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedReasoner").field("graphs", &self.graph_names().unwrap_or_default()).finish()
    }
}

impl EmbeddedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every graph with the given statements.
    pub fn load(&self, records: &[TripleRecord]) -> Result<usize> {
        let quads = records.iter().map(parse_record).collect::<Result<Vec<_>>>()?;
        let store = RdfStore::new()?;
        store.extend(quads)?;
        let sources = records.iter().map(|r| r.source.clone()).collect();
        *self.loaded.write().map_err(|_| poisoned())? = Some(Loaded { store, sources });
        Ok(records.len())
    }

    /// Reload every graph from the statements relation.
    pub async fn refresh_from(&self, store: &dyn Store) -> Result<usize> {
        let records = store.statements(None).await?;
        let count = self.load(&records)?;
        debug!(statements = count, "Reloaded reasoner graphs");
        Ok(count)
    }

    pub fn graph_names(&self) -> Result<Vec<String>> {
        let loaded = self.loaded.read().map_err(|_| poisoned())?;
        Ok(loaded.as_ref().map(|l| l.sources.iter().cloned().collect()).unwrap_or_default())
    }

    fn current(&self) -> Result<Loaded> {
        if let Some(loaded) = self.loaded.read().map_err(|_| poisoned())?.as_ref() {
            return Ok(loaded.clone());
        }
        let mut slot = self.loaded.write().map_err(|_| poisoned())?;
        let loaded = match slot.as_ref() {
            Some(loaded) => loaded.clone(),
            None => slot.insert(Loaded { store: RdfStore::new()?, sources: BTreeSet::new() }).clone(),
        };
        Ok(loaded)
    }

    /// Evaluate on the blocking pool; query evaluation is CPU bound.
    async fn evaluate(&self, graph: &str, query: &str) -> Result<SparqlResults> {
        let store = self.current()?.store;
        let (graph, query) = (graph.to_string(), query.to_string());
        tokio::task::spawn_blocking(move || evaluate(&store, &graph, &query))
            .await
            .map_err(|e| MortarError::Internal(format!("Query evaluation panicked: {}", e)))?
    }
}

fn evaluate(store: &RdfStore, graph: &str, query: &str) -> Result<SparqlResults> {
    let full_query = format!("{}{}", STANDARD_PREFIXES, query);
    let mut prepared = SparqlEvaluator::new()
        .parse_query(&full_query)
        .map_err(|e| MortarError::UpstreamQuery(format!("Invalid query: {}", e)))?;
    match graph {
        "" | ALL_GRAPHS | DEFAULT_GRAPH => prepared.dataset_mut().set_default_graph_as_union(),
        name => prepared.dataset_mut().set_default_graph(vec![GraphName::NamedNode(graph_node(name)?)]),
    }

    match prepared.on_store(store).execute()? {
        QueryResults::Solutions(solutions) => {
            let vars: Vec<String> = solutions.variables().iter().map(|v| v.as_str().to_string()).collect();
            let mut bindings = Vec::new();
            for solution in solutions {
                let solution = solution?;
                let row: HashMap<String, Binding> =
                    solution.iter().map(|(var, term)| (var.as_str().to_string(), binding(term))).collect();
                bindings.push(row);
            }
            debug!(graph, solutions = bindings.len(), "Evaluated query");
            let mut out = SparqlResults::default();
            out.head.vars = vars;
            out.results.bindings = bindings;
            Ok(out)
        }
        QueryResults::Boolean(value) => Ok(SparqlResults { boolean: Some(value), ..Default::default() }),
        QueryResults::Graph(_) => Err(MortarError::UpstreamQuery(
            "CONSTRUCT and DESCRIBE queries are not supported".to_string(),
        )),
    }
}

fn poisoned() -> MortarError {
    MortarError::Internal("reasoner graph lock poisoned".to_string())
}

/// Named graph holding one source's statements.
fn graph_node(source: &str) -> Result<NamedNode> {
    NamedNode::new(format!("urn:mortar:graph:{}", urlencoding::encode(source)))
        .map_err(|e| MortarError::Internal(format!("Bad graph name {}: {}", source, e)))
}

/// Statements are stored in N-Triples term form; parse one back into its source's graph.
fn parse_record(record: &TripleRecord) -> Result<Quad> {
    let line = format!(
        "{} {} {} {} .\n",
        record.subject,
        record.predicate,
        record.object,
        graph_node(&record.source)?
    );
    let quad = RdfParser::from_format(RdfFormat::NQuads)
        .for_slice(line.as_bytes())
        .next()
        .ok_or_else(|| MortarError::Internal(format!("Empty statement: {}", line.trim())))??;
    Ok(quad)
}

fn binding(term: &Term) -> Binding {
    match term {
        Term::NamedNode(node) => Binding::uri(node.as_str()),
        Term::BlankNode(node) => Binding {
            kind: "bnode".to_string(),
            value: node.as_str().to_string(),
            datatype: None,
            lang: None,
        },
        Term::Literal(literal) => {
            let lang = literal.language().map(String::from);
            let datatype = (lang.is_none() && literal.datatype() != xsd::STRING)
                .then(|| literal.datatype().as_str().to_string());
            Binding { kind: "literal".to_string(), value: literal.value().to_string(), datatype, lang }
        }
        #[allow(unreachable_patterns)]
        other => Binding {
            kind: "literal".to_string(),
            value: other.to_string(),
            datatype: None,
            lang: None,
        },
    }
}

#[async_trait]
impl Reasoner for EmbeddedReasoner {
    async fn query(&self, graph: &str, query: &str) -> Result<SparqlResults> {
        self.evaluate(graph, query).await
    }

    async fn query_raw(&self, graph: &str, query: &str) -> Result<String> {
        Ok(serde_json::to_string(&self.evaluate(graph, query).await?)?)
    }

    async fn refresh(&self, store: &dyn Store) -> Result<()> {
        self.refresh_from(store).await.map(|_| ())
    }
}
