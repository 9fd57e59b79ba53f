//! Dependency analysis: derive the producer→consumer graph from declared
//! file sets.
//!
//! An edge `producer → consumer` exists iff the consumer declares at least
//! one input that the producer declares as an output. Equality of file
//! identifiers is exact string equality after whitespace trimming; paths are
//! not canonicalized, the declared string is the key.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};

use crate::model::JobDeclaration;

/// The declared dependencies form a cycle; lists the jobs along one minimal
/// cycle in edge order.
#[derive(Debug)]
pub struct CycleError(pub Vec<String>);

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dependency cycle among jobs: {}", self.0.join(" -> "))?;
        if let Some(first) = self.0.first() {
            write!(f, " -> {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleError {}

/// Dense adjacency matrix over job indices, row-major:
/// `get(i, j)` is true iff job `j` consumes at least one output of job `i`.
#[derive(Debug, Clone)]
pub struct AdjMatrix {
    n: usize,
    bits: Vec<bool>,
}

impl AdjMatrix {
    pub fn new(n: usize) -> Self {
        AdjMatrix {
            n,
            bits: vec![false; n * n],
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn set(&mut self, producer: usize, consumer: usize) {
        self.bits[producer * self.n + consumer] = true;
    }

    pub fn get(&self, producer: usize, consumer: usize) -> bool {
        self.bits[producer * self.n + consumer]
    }

    /// Drop every constraint a producer imposes; used once it has finished.
    pub fn clear_row(&mut self, producer: usize) {
        self.bits[producer * self.n..(producer + 1) * self.n].fill(false);
    }

    /// True when no remaining producer constrains `consumer`.
    pub fn column_clear(&self, consumer: usize) -> bool {
        (0..self.n).all(|i| !self.get(i, consumer))
    }

    /// All jobs transitively reachable from `start` (excluding `start`
    /// itself), by repeated adjacency-row union until fixpoint.
    pub fn descendants(&self, start: usize) -> Vec<usize> {
        let mut reached = vec![false; self.n];
        let mut frontier = vec![start];
        while let Some(i) = frontier.pop() {
            for j in 0..self.n {
                if self.get(i, j) && !reached[j] {
                    reached[j] = true;
                    frontier.push(j);
                }
            }
        }
        reached[start] = false;
        (0..self.n).filter(|&j| reached[j]).collect()
    }
}

/// Result of dependency analysis over a pipeline declaration.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Canonical job order (declaration order); the index space for masks.
    pub order: Vec<String>,
    pub index: HashMap<String, usize>,
    /// consumer → producer → files carried along that edge.
    pub deps: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub graph: AdjMatrix,
}

/// Derive the dependency graph from file-set overlap and verify it is a DAG.
pub fn analyze(jobs: &[JobDeclaration]) -> Result<Analysis> {
    let n = jobs.len();
    let order: Vec<String> = jobs.iter().map(|j| j.name.clone()).collect();
    let index: HashMap<String, usize> = order
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect();

    let in_sets: Vec<_> = jobs.iter().map(JobDeclaration::inputs).collect();
    let out_sets: Vec<_> = jobs.iter().map(JobDeclaration::outputs).collect();

    let mut graph = AdjMatrix::new(n);
    let mut deps: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
    for producer in 0..n {
        for consumer in 0..n {
            if producer == consumer {
                continue;
            }
            let shared: Vec<String> = in_sets[consumer]
                .intersection(&out_sets[producer])
                .cloned()
                .collect();
            if !shared.is_empty() {
                graph.set(producer, consumer);
                deps.entry(order[consumer].clone())
                    .or_default()
                    .insert(order[producer].clone(), shared);
            }
        }
    }

    check_acyclic(&graph, &order)?;

    Ok(Analysis {
        order,
        index,
        deps,
        graph,
    })
}

/// Kahn topological sort; on failure, report one minimal cycle.
fn check_acyclic(graph: &AdjMatrix, order: &[String]) -> Result<()> {
    let n = graph.len();
    let mut in_degree: Vec<usize> = (0..n)
        .map(|j| (0..n).filter(|&i| graph.get(i, j)).count())
        .collect();
    let mut alive = vec![true; n];
    let mut ready: Vec<usize> = (0..n).filter(|&j| in_degree[j] == 0).collect();
    let mut removed = 0;
    while let Some(i) = ready.pop() {
        alive[i] = false;
        removed += 1;
        for j in 0..n {
            if graph.get(i, j) && alive[j] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(j);
                }
            }
        }
    }
    if removed == n {
        return Ok(());
    }
    let cycle = find_cycle(graph, &alive);
    Err(CycleError(cycle.into_iter().map(|i| order[i].clone()).collect()).into())
}

/// Within the residue left by Kahn every node has a live predecessor, so a
/// backward walk must revisit a node on its own path; that slice, reversed,
/// is a cycle in forward edge order.
fn find_cycle(graph: &AdjMatrix, alive: &[bool]) -> Vec<usize> {
    let n = graph.len();
    let start = alive.iter().position(|&a| a).unwrap_or(0);
    let mut pos_on_path: Vec<Option<usize>> = vec![None; n];
    let mut path = vec![start];
    pos_on_path[start] = Some(0);
    let mut cur = start;
    loop {
        let Some(pred) = (0..n).find(|&i| alive[i] && graph.get(i, cur)) else {
            return path;
        };
        if let Some(first) = pos_on_path[pred] {
            let mut cycle = path[first..].to_vec();
            cycle.reverse();
            return cycle;
        }
        pos_on_path[pred] = Some(path.len());
        path.push(pred);
        cur = pred;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OMITTED;

    fn job(name: &str, files_in: &[&str], files_out: &[&str]) -> JobDeclaration {
        JobDeclaration {
            name: name.into(),
            command: "true".into(),
            files_in: files_in.iter().map(|s| s.to_string()).collect(),
            files_out: files_out.iter().map(|s| s.to_string()).collect(),
            opts: serde_json::Value::Null,
        }
    }

    #[test]
    fn linear_chain_edges() {
        let jobs = vec![
            job("a", &[], &["/t/a.out"]),
            job("b", &["/t/a.out"], &["/t/b.out"]),
            job("c", &["/t/b.out"], &[]),
        ];
        let a = analyze(&jobs).unwrap();
        assert!(a.graph.get(0, 1));
        assert!(a.graph.get(1, 2));
        assert!(!a.graph.get(0, 2));
        assert_eq!(a.deps["b"]["a"], vec!["/t/a.out".to_string()]);
    }

    #[test]
    fn diamond_descendants() {
        let jobs = vec![
            job("a", &[], &["/t/a"]),
            job("b", &["/t/a"], &["/t/b"]),
            job("c", &["/t/a"], &["/t/c"]),
            job("d", &["/t/b", "/t/c"], &[]),
        ];
        let a = analyze(&jobs).unwrap();
        assert_eq!(a.graph.descendants(0), vec![1, 2, 3]);
        assert_eq!(a.graph.descendants(1), vec![3]);
        assert!(a.graph.descendants(3).is_empty());
    }

    #[test]
    fn placeholders_create_no_edges() {
        let jobs = vec![
            job("a", &[], &[OMITTED, ""]),
            job("b", &[OMITTED, ""], &[]),
        ];
        let a = analyze(&jobs).unwrap();
        assert!(!a.graph.get(0, 1));
        assert!(a.deps.is_empty());
    }

    #[test]
    fn whitespace_trimmed_identifiers_match() {
        let jobs = vec![
            job("a", &[], &[" /t/x "]),
            job("b", &["/t/x"], &[]),
        ];
        let a = analyze(&jobs).unwrap();
        assert!(a.graph.get(0, 1));
    }

    #[test]
    fn two_cycle_is_reported() {
        let jobs = vec![
            job("a", &["/t/b"], &["/t/a"]),
            job("b", &["/t/a"], &["/t/b"]),
        ];
        let err = analyze(&jobs).unwrap_err();
        let cycle = err.downcast_ref::<CycleError>().expect("CycleError");
        assert_eq!(cycle.0.len(), 2);
        assert!(cycle.0.contains(&"a".to_string()));
        assert!(cycle.0.contains(&"b".to_string()));
    }

    #[test]
    fn inner_cycle_with_clean_prefix_is_found() {
        let jobs = vec![
            job("pre", &[], &["/t/p"]),
            job("x", &["/t/p", "/t/z"], &["/t/x"]),
            job("y", &["/t/x"], &["/t/y"]),
            job("z", &["/t/y"], &["/t/z"]),
        ];
        let err = analyze(&jobs).unwrap_err();
        let cycle = err.downcast_ref::<CycleError>().expect("CycleError");
        assert_eq!(cycle.0.len(), 3);
        assert!(!cycle.0.contains(&"pre".to_string()));
    }

    #[test]
    fn clear_row_unblocks_consumers() {
        let jobs = vec![job("a", &[], &["/t/a"]), job("b", &["/t/a"], &[])];
        let mut a = analyze(&jobs).unwrap();
        assert!(!a.graph.column_clear(1));
        a.graph.clear_row(0);
        assert!(a.graph.column_clear(1));
    }

    #[test]
    fn empty_pipeline_analyzes() {
        let a = analyze(&[]).unwrap();
        assert!(a.order.is_empty());
        assert!(a.graph.is_empty());
    }
}
