//! Grafo de llamadas entre las funciones del script.
//!
//! Es un multigrafo dirigido: cada sitio de llamada es una arista propia con
//! una tupla de orden (`ordering`). Al podar un nodo, sus aristas se
//! contraen concatenando los órdenes, de modo que el orden de visita en
//! profundidad se conserva como si el cuerpo de la función podada estuviera
//! inline en cada llamada.

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use tracing::debug;

use crate::error::{Error, Result};
use crate::script::FunctionDef;

/// Posición de una llamada, camino de índices desde el llamador.
pub type Ordering = Vec<u32>;

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    graph: StableDiGraph<String, Ordering>,
    index: HashMap<String, NodeIndex>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arma el grafo desde las funciones del script. Cada función es un nodo;
    /// cada llamada a un identificador simple es una arista numerada desde 0
    /// en orden textual. Falla si hay ciclos.
    pub fn build(functions: &[FunctionDef]) -> Result<Self> {
        let mut graph = CallGraph::new();
        for function in functions {
            graph.add_node(&function.name);
            for (i, callee) in function.calls.iter().enumerate() {
                graph.add_edge(&function.name, callee, vec![i as u32]);
            }
        }
        graph.check_acyclic()?;
        debug!(
            "grafo de llamadas: {} nodos, {} aristas",
            graph.graph.node_count(),
            graph.graph.edge_count()
        );
        Ok(graph)
    }

    pub fn from_edges<'a>(edges: impl IntoIterator<Item = (&'a str, &'a str, Ordering)>) -> Self {
        let mut graph = CallGraph::new();
        for (from, to, ordering) in edges {
            graph.add_edge(from, to, ordering);
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn add_edge(&mut self, from: &str, to: &str, ordering: Ordering) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        self.graph.add_edge(a, b, ordering);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Nombres de los nodos, ordenados.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.index.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Aristas (origen, destino, orden), ordenadas.
    pub fn edges(&self) -> Vec<(String, String, Ordering)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    self.graph[e.source()].clone(),
                    self.graph[e.target()].clone(),
                    e.weight().clone(),
                )
            })
            .collect();
        edges.sort();
        edges
    }

    fn check_acyclic(&self) -> Result<()> {
        if !is_cyclic_directed(&self.graph) {
            return Ok(());
        }

        // componente fuertemente conexa no trivial, o un nodo que se llama a sí mismo
        let cycle = tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .unwrap_or_default();
        let mut names: Vec<String> = cycle.iter().rev().map(|idx| self.graph[*idx].clone()).collect();
        if let Some(first) = names.first().cloned() {
            names.push(first);
        }
        Err(Error::CyclicDependency(names))
    }

    /// Elimina los nodos dados. Por cada par (arista entrante, arista
    /// saliente) del nodo se agrega una arista directa con el orden
    /// concatenado.
    pub fn prune_nodes<'a>(&mut self, nodes: impl IntoIterator<Item = &'a str>) {
        for name in nodes {
            let Some(idx) = self.index.remove(name) else {
                continue;
            };

            let incoming: Vec<(NodeIndex, Ordering)> = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| (e.source(), e.weight().clone()))
                .collect();
            let outgoing: Vec<(NodeIndex, Ordering)> = self
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| (e.target(), e.weight().clone()))
                .collect();

            for (source, e) in &incoming {
                for (target, f) in &outgoing {
                    self.graph.add_edge(*source, *target, contract_edges(e, f));
                }
            }
            self.graph.remove_node(idx);
        }
    }

    /// Para cada nodo, sus sucesores directos ordenados por `ordering`
    /// (lexicográfico). Se conservan los duplicados.
    pub fn ordered_dependencies(&self) -> BTreeMap<String, Vec<String>> {
        self.graph
            .node_indices()
            .map(|idx| {
                let mut edges: Vec<(&Ordering, NodeIndex)> = self
                    .graph
                    .edges_directed(idx, Direction::Outgoing)
                    .map(|e| (e.weight(), e.target()))
                    .collect();
                edges.sort_by(|a, b| a.0.cmp(b.0));
                let callees = edges.into_iter().map(|(_, t)| self.graph[t].clone()).collect();
                (self.graph[idx].clone(), callees)
            })
            .collect()
    }
}

pub fn contract_edges(incoming: &Ordering, outgoing: &Ordering) -> Ordering {
    incoming.iter().chain(outgoing).copied().collect()
}
