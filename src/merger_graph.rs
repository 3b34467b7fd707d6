// Merger Graph Resolver
//
// The change table is a forest of merger edges pointing to the present:
// every code has at most one successor but may have many predecessors.
// Resolving a municipality walks that forest backwards from the current
// code and collects every code whose raw results roll up into it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::load_merger_edges;
use crate::error::{ReconcileError, Result};
use crate::model::{BfsCode, MergeableMunicipality};

// ============================================================================
// MERGER EDGE
// ============================================================================

/// One row of the municipal change table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergerEdge {
    pub old_code: BfsCode,
    pub old_name: String,
    pub new_code: BfsCode,
    pub new_name: String,
    pub mutation_date: NaiveDate,
    pub mutation_type: String,
    pub is_merger: bool,
}

impl MergerEdge {
    /// Renumbering-only rows and the "code retained" row of a merger
    /// (old == new) never contribute a predecessor.
    pub fn is_traversable(&self) -> bool {
        self.is_merger && self.old_code != self.new_code
    }

    fn effective_at(&self, as_of: Option<NaiveDate>) -> bool {
        as_of.map_or(true, |bound| self.mutation_date <= bound)
    }
}

// ============================================================================
// PREDECESSOR SET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predecessor {
    pub code: BfsCode,
    pub name: Option<String>,
    /// None for the resolved municipality itself
    pub mutation_date: Option<NaiveDate>,
    pub merged_into: Option<BfsCode>,
    /// Number of merger steps between this code and the root
    pub depth: u32,
}

/// Ordered result of a resolution: the root first, then predecessors by
/// ascending mutation date and code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredecessorSet {
    pub root: BfsCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<NaiveDate>,
    pub members: Vec<Predecessor>,
}

impl PredecessorSet {
    pub fn codes(&self) -> BTreeSet<BfsCode> {
        self.members.iter().map(|m| m.code).collect()
    }

    pub fn ordered_codes(&self) -> Vec<BfsCode> {
        self.members.iter().map(|m| m.code).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, code: BfsCode) -> bool {
        self.members.iter().any(|m| m.code == code)
    }

    /// True when no merger ever fed into the root
    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }
}

// ============================================================================
// MERGER GRAPH
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MergerGraph {
    /// Sorted by (mutation_date, old_code, new_code), exact duplicates removed
    edges: Vec<MergerEdge>,
    /// new_code -> indices into `edges` (traversable edges only)
    incoming: HashMap<BfsCode, Vec<usize>>,
    /// Latest known display name per code
    names: HashMap<BfsCode, String>,
}

impl MergerGraph {
    pub fn new(mut edges: Vec<MergerEdge>) -> Self {
        edges.sort_by(|a, b| {
            (a.mutation_date, a.old_code, a.new_code).cmp(&(b.mutation_date, b.old_code, b.new_code))
        });
        // Double-imported rows would otherwise look like a revisit
        edges.dedup_by(|a, b| {
            a.old_code == b.old_code && a.new_code == b.new_code && a.mutation_date == b.mutation_date
        });

        let mut incoming: HashMap<BfsCode, Vec<usize>> = HashMap::new();
        let mut names = HashMap::new();

        for (idx, edge) in edges.iter().enumerate() {
            if edge.is_traversable() {
                incoming.entry(edge.new_code).or_default().push(idx);
            }
            if !edge.old_name.is_empty() {
                names.insert(edge.old_code, edge.old_name.clone());
            }
            if !edge.new_name.is_empty() {
                names.insert(edge.new_code, edge.new_name.clone());
            }
        }

        MergerGraph { edges, incoming, names }
    }

    /// Read the whole change table once; the graph is immutable afterwards.
    pub fn load(conn: &Connection) -> Result<Self> {
        let edges = load_merger_edges(conn)?;
        let graph = MergerGraph::new(edges);
        debug!(
            edges = graph.edges.len(),
            successors = graph.incoming.len(),
            "merger graph loaded"
        );
        Ok(graph)
    }

    pub fn edges(&self) -> &[MergerEdge] {
        &self.edges
    }

    /// Whether the code appears anywhere in the change table.
    pub fn contains(&self, code: BfsCode) -> bool {
        self.names.contains_key(&code)
            || self.edges.iter().any(|e| e.old_code == code || e.new_code == code)
    }

    pub fn name_of(&self, code: BfsCode) -> Option<&str> {
        self.names.get(&code).map(String::as_str)
    }

    /// Every code whose results must be summed to reconstruct `code`.
    ///
    /// With `as_of`, only mergers effective on or before that date are
    /// followed. A code reached twice aborts with `GraphIntegrity`.
    pub fn resolve_predecessors(
        &self,
        code: BfsCode,
        as_of: Option<NaiveDate>,
    ) -> Result<PredecessorSet> {
        let (mut members, _) = self.walk(code, as_of)?;

        let root = members.remove(0);
        members.sort_by(|a, b| (a.mutation_date, a.code).cmp(&(b.mutation_date, b.code)));
        members.insert(0, root);

        Ok(PredecessorSet {
            root: code,
            as_of,
            members,
        })
    }

    /// All merger edges in the closure of `code`, by date then code.
    pub fn timeline(&self, code: BfsCode) -> Result<Vec<MergerEdge>> {
        let (_, edge_indices) = self.walk(code, None)?;
        let mut timeline: Vec<MergerEdge> = edge_indices
            .into_iter()
            .map(|idx| self.edges[idx].clone())
            .collect();
        timeline.sort_by(|a, b| {
            (a.mutation_date, a.old_code, a.new_code).cmp(&(b.mutation_date, b.old_code, b.new_code))
        });
        Ok(timeline)
    }

    /// Municipalities that absorbed at least one other code.
    pub fn mergeable_municipalities(&self) -> Vec<MergeableMunicipality> {
        let mut direct: BTreeMap<BfsCode, BTreeSet<BfsCode>> = BTreeMap::new();
        for (successor, indices) in &self.incoming {
            let olds = direct.entry(*successor).or_default();
            olds.extend(indices.iter().map(|&idx| self.edges[idx].old_code));
        }

        direct
            .into_iter()
            .map(|(code, olds)| MergeableMunicipality {
                code,
                name: self.name_of(code).unwrap_or_default().to_string(),
                merger_count: olds.len() as u32,
            })
            .collect()
    }

    /// Reverse breadth-first walk. Returns members (root first, BFS order)
    /// and the indices of the edges that were followed.
    fn walk(
        &self,
        code: BfsCode,
        as_of: Option<NaiveDate>,
    ) -> Result<(Vec<Predecessor>, Vec<usize>)> {
        let mut visited: HashSet<BfsCode> = HashSet::from([code]);
        let mut queue: VecDeque<(BfsCode, u32)> = VecDeque::from([(code, 0)]);
        let mut followed = Vec::new();
        let mut members = vec![Predecessor {
            code,
            name: self.name_of(code).map(str::to_string),
            mutation_date: None,
            merged_into: None,
            depth: 0,
        }];

        while let Some((current, depth)) = queue.pop_front() {
            let Some(indices) = self.incoming.get(&current) else {
                continue;
            };

            for &idx in indices {
                let edge = &self.edges[idx];
                if !edge.effective_at(as_of) {
                    continue;
                }
                if !visited.insert(edge.old_code) {
                    return Err(ReconcileError::GraphIntegrity {
                        code: edge.old_code,
                        via: current,
                    });
                }

                followed.push(idx);
                members.push(Predecessor {
                    code: edge.old_code,
                    name: Some(edge.old_name.clone()).filter(|n| !n.is_empty()),
                    mutation_date: Some(edge.mutation_date),
                    merged_into: Some(current),
                    depth: depth + 1,
                });
                queue.push_back((edge.old_code, depth + 1));
            }
        }

        Ok((members, followed))
    }
}

// ============================================================================
// TESTS
// ============================================================================
