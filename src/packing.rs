//! Partition a store-path dependency graph into size-bounded layer groups.
//!
//! The overall approach is to iteratively remove subtrees from the dependency
//! graph, assigning each one to a layer. Picking the subtree whose closure
//! size best fits the space left in the current layer favours one large
//! cohesive subtree per layer; when no subtree alone is large enough,
//! successive picks accrete onto the same layer.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackingPlanAttrs {
    pub closure_info: ClosureInfo,
    pub target_layer_size: u64,
    pub outputs: PackingPlanOutputs,
}

#[derive(Debug, Deserialize)]
pub struct PackingPlanOutputs {
    pub out: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ClosureInfo {
    /// Inline list of path records.
    Entries(Vec<ClosureInfoEntry>),
    /// Directory containing a `registration` file.
    Registration(PathBuf),
}

/// One store path as described by the driver. Any `closureSize` present in
/// the input is ignored; closure sizes are always recomputed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureInfoEntry {
    pub path: String,
    pub nar_size: u64,
    #[serde(default)]
    pub references: Vec<String>,
}

/// The `nix-packing-plan` sub-command.
pub fn run(attrs: PackingPlanAttrs) -> Result<()> {
    let mut graph = match attrs.closure_info {
        ClosureInfo::Entries(entries) => DepGraph::from_entries(entries)?,
        ClosureInfo::Registration(dir) => DepGraph::from_registration(&dir.join("registration"))?,
    };
    let groups = plan(&mut graph, attrs.target_layer_size)?;
    write_plan(&groups, &attrs.outputs.out)
}

/// Drain `graph` into an ordered sequence of layer groups approximating
/// `target_layer_size` bytes each.
pub fn plan(graph: &mut DepGraph, target_layer_size: u64) -> Result<Vec<LayerGroup>> {
    let mut groups = Vec::new();
    let mut group = LayerGroup::default();
    loop {
        // A group is sealed as soon as it reaches half the target, so an open
        // group is always strictly under it and this cannot underflow.
        let avail = target_layer_size - group.size();

        // Select the subtree that would best satisfy the available space.
        let Some(root) = graph.best_node(|m| m.closure_size.abs_diff(avail)) else {
            break;
        };

        // Remove it from the dependency graph and add it to the group.
        group.members.extend(graph.pop_subtree(root));

        // If the group is over half full (w.r.t. the target), it's done.
        if group.size() >= target_layer_size / 2 {
            groups.push(std::mem::take(&mut group));
        }
    }
    if !group.is_empty() {
        groups.push(group);
    }
    Ok(groups)
}

/// Emit groups as files `0000`, `0001`, ... of sorted paths, one per line.
pub fn write_plan(groups: &[LayerGroup], out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)?;
    for (i, group) in groups.iter().enumerate() {
        let mut contents = String::new();
        for path in group.sorted_paths() {
            contents.push_str(path);
            contents.push('\n');
        }
        fs::write(out_dir.join(format!("{i:04}")), contents)?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PathMeta {
    pub path: String,
    pub size: u64,
    /// Running sum of `size` over this path and its still-live dependencies.
    pub closure_size: u64,
    refs: HashSet<usize>,
}

#[derive(Debug, Default)]
pub struct LayerGroup {
    pub members: Vec<PathMeta>,
}

impl LayerGroup {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.members.iter().map(|m| m.size).sum()
    }

    pub fn sorted_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.members.iter().map(|m| m.path.as_str()).collect();
        paths.sort_unstable();
        paths
    }
}

/// A dependency graph of store paths, indexed by dense integer ids.
///
/// Slots are tombstoned rather than removed so that ids stay stable; a
/// tombstoned slot is never revived. The topological order is computed once
/// over the full initial set and traversed thereafter, skipping dead slots.
pub struct DepGraph {
    slots: Vec<Option<PathMeta>>,
    /// Leaves-first: every node appears after all of its references.
    topo: Vec<usize>,
}

impl DepGraph {
    pub fn from_entries(entries: Vec<ClosureInfoEntry>) -> Result<Self> {
        Self::build(
            entries
                .into_iter()
                .map(|e| (e.path, e.nar_size, e.references))
                .collect(),
        )
    }

    /// Parse a Nix `registration` file: one or more instances of the line
    /// sequence *path / hash / size / deriver / n-refs / ref...*, terminated
    /// by a blank path line.
    pub fn from_registration(path: &Path) -> Result<Self> {
        let malformed = |detail: &str| Error::MalformedRegistration {
            path: path.to_path_buf(),
            detail: detail.to_string(),
        };
        let file = BufReader::new(fs::File::open(path)?);
        let mut lines = file.lines();
        let mut next_line = move || -> Result<Option<String>> { lines.next().transpose().map_err(Error::from) };

        let mut raw = Vec::new();
        loop {
            let Some(store_path) = next_line()? else { break };
            if store_path.is_empty() {
                break;
            }
            let mut field = |name: &str| -> Result<String> {
                next_line()?.ok_or_else(|| malformed(&format!("truncated record: expected {name}")))
            };
            let _hash = field("hash")?;
            let size = field("size")?
                .parse::<u64>()
                .map_err(|e| malformed(&format!("unparseable size for {store_path}: {e}")))?;
            let _deriver = field("deriver")?;
            let n_refs = field("reference count")?
                .parse::<usize>()
                .map_err(|e| malformed(&format!("unparseable reference count for {store_path}: {e}")))?;
            let refs = (0..n_refs)
                .map(|_| field("reference"))
                .collect::<Result<Vec<String>>>()?;
            raw.push((store_path, size, refs));
        }
        Self::build(raw)
    }

    fn build(raw: Vec<(String, u64, Vec<String>)>) -> Result<Self> {
        // Memoize the store paths by assigning a unique integer to each one:
        // its position in the input.
        let ids: HashMap<String, usize> = raw
            .iter()
            .enumerate()
            .map(|(i, (path, _, _))| (path.clone(), i))
            .collect();

        let mut slots = Vec::with_capacity(raw.len());
        for (path, size, references) in raw {
            let mut refs = HashSet::new();
            for reference in references {
                // Sometimes a path declares a dependency on itself; strip
                // such self-loops here.
                if reference == path {
                    log::warn!("{path} lists itself as a reference");
                    continue;
                }
                let id = *ids.get(&reference).ok_or_else(|| Error::UnknownReference {
                    path: path.clone(),
                    reference: reference.clone(),
                })?;
                refs.insert(id);
            }
            slots.push(Some(PathMeta {
                path,
                size,
                closure_size: 0,
                refs,
            }));
        }

        let topo = topological_order(&slots)?;
        let mut graph = Self { slots, topo };
        graph.recompute_closure_sizes();
        Ok(graph)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// The live node minimising `cost`. Ties go to the earliest input id.
    pub fn best_node<F: Fn(&PathMeta) -> u64>(&self, cost: F) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(meta) = slot {
                let c = cost(meta);
                match best {
                    Some((_, best_cost)) if best_cost <= c => {}
                    _ => best = Some((i, c)),
                }
            }
        }
        best.map(|(i, _)| i)
    }

    /// Pop `root` and every still-live node transitively reachable from it.
    pub fn pop_subtree(&mut self, root: usize) -> Vec<PathMeta> {
        // Walking roots-before-leaves visits every descendant exactly once,
        // without an explicit traversal of the graph.
        let mut selected: HashSet<usize> = HashSet::from([root]);
        for &i in self.topo.iter().rev() {
            if selected.contains(&i) {
                if let Some(meta) = &self.slots[i] {
                    selected.extend(meta.refs.iter().copied());
                }
            }
        }
        self.pop(&selected)
    }

    fn pop(&mut self, ids: &HashSet<usize>) -> Vec<PathMeta> {
        let mut ordered: Vec<usize> = ids.iter().copied().collect();
        ordered.sort_unstable();
        let mut metas = Vec::with_capacity(ordered.len());
        for i in ordered {
            if let Some(meta) = self.slots[i].take() {
                metas.push(meta);
            }
        }
        for slot in self.slots.iter_mut().flatten() {
            slot.refs.retain(|r| !ids.contains(r));
        }
        self.recompute_closure_sizes();
        metas
    }

    fn recompute_closure_sizes(&mut self) {
        let mut closures = vec![0u64; self.slots.len()];
        for &i in &self.topo {
            if let Some(meta) = &self.slots[i] {
                closures[i] = meta.size
                    + meta.refs.iter().map(|&r| closures[r]).sum::<u64>();
            }
        }
        for &i in &self.topo {
            if let Some(meta) = &mut self.slots[i] {
                meta.closure_size = closures[i];
            }
        }
    }
}

/// Kahn's algorithm, leaves first. The graph is expected to be acyclic once
/// self-loops have been stripped; a remaining cycle is a driver bug.
fn topological_order(slots: &[Option<PathMeta>]) -> Result<Vec<usize>> {
    let mut pending = vec![0usize; slots.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); slots.len()];
    for (i, slot) in slots.iter().enumerate() {
        let Some(meta) = slot else { continue };
        pending[i] = meta.refs.len();
        for &r in &meta.refs {
            dependents[r].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..slots.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(slots.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &d in &dependents[i] {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.push_back(d);
            }
        }
    }

    if order.len() != slots.len() {
        let culprit = pending
            .iter()
            .position(|&p| p > 0)
            .and_then(|i| slots[i].as_ref())
            .map(|m| m.path.clone())
            .unwrap_or_default();
        return Err(Error::DependencyCycle(culprit));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    //       ddd
    //      /   \
    //   bbb     fff
    //   / \     / \
    // aaa ccc eee ggg
    //
    // Expected analysis:
    //   * The subtree with closure size closest to 500 is the one rooted at
    //     bbb. Since this is more than half the target layer size, no further
    //     subtrees are pulled into this group.
    //   * Now eee has the closest closure size to 500, but it's not enough to
    //     fill a group to half the target, so more subtrees are pulled in;
    //     the next closest is ggg, and together they reach half the target.
    //   * fff and ddd each fill a group of their own.
    fn sample_closure() -> Vec<ClosureInfoEntry> {
        let entry = |path: &str, nar_size: u64, references: &[&str]| ClosureInfoEntry {
            path: format!("/mockstore/{path}"),
            nar_size,
            references: references.iter().map(|r| format!("/mockstore/{r}")).collect(),
        };
        vec![
            entry("aaa", 266, &[]),
            entry("bbb", 100, &["aaa", "bbb", "ccc"]),
            entry("ccc", 39, &[]),
            entry("ddd", 45, &["bbb", "fff"]),
            entry("eee", 221, &[]),
            entry("fff", 901, &["eee", "ggg"]),
            entry("ggg", 88, &[]),
        ]
    }

    #[test]
    fn plans_small_closure() {
        let mut graph = DepGraph::from_entries(sample_closure()).unwrap();
        let groups = plan(&mut graph, 500).unwrap();

        let paths: Vec<Vec<&str>> = groups.iter().map(|g| g.sorted_paths()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["/mockstore/aaa", "/mockstore/bbb", "/mockstore/ccc"],
                vec!["/mockstore/eee", "/mockstore/ggg"],
                vec!["/mockstore/fff"],
                vec!["/mockstore/ddd"],
            ],
        );
    }

    #[test]
    fn writes_plan_files() {
        let out_dir = tempfile::tempdir().unwrap();
        run(PackingPlanAttrs {
            closure_info: ClosureInfo::Entries(sample_closure()),
            target_layer_size: 500,
            outputs: PackingPlanOutputs {
                out: out_dir.path().to_path_buf(),
            },
        })
        .unwrap();

        let mut names: Vec<String> = fs::read_dir(out_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["0000", "0001", "0002", "0003"]);
        assert_eq!(
            fs::read_to_string(out_dir.path().join("0000")).unwrap(),
            "/mockstore/aaa\n/mockstore/bbb\n/mockstore/ccc\n",
        );
        assert_eq!(
            fs::read_to_string(out_dir.path().join("0001")).unwrap(),
            "/mockstore/eee\n/mockstore/ggg\n",
        );
        assert_eq!(
            fs::read_to_string(out_dir.path().join("0002")).unwrap(),
            "/mockstore/fff\n",
        );
        assert_eq!(
            fs::read_to_string(out_dir.path().join("0003")).unwrap(),
            "/mockstore/ddd\n",
        );
    }

    #[test]
    fn groups_partition_the_input() {
        let mut graph = DepGraph::from_entries(sample_closure()).unwrap();
        let groups = plan(&mut graph, 500).unwrap();

        let mut seen: Vec<String> = groups
            .iter()
            .flat_map(|g| g.members.iter().map(|m| m.path.clone()))
            .collect();
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!(total, seen.len(), "no path may appear twice");
        assert_eq!(seen.len(), sample_closure().len());
        assert!(graph.is_empty());
    }

    #[test]
    fn groups_are_dependency_closed() {
        let entries = sample_closure();
        let mut graph = DepGraph::from_entries(sample_closure()).unwrap();
        let groups = plan(&mut graph, 500).unwrap();

        // Each member's original references must land in the same group or an
        // earlier one.
        let mut group_of: HashMap<String, usize> = HashMap::new();
        for (i, group) in groups.iter().enumerate() {
            for member in &group.members {
                group_of.insert(member.path.clone(), i);
            }
        }
        for entry in &entries {
            for reference in &entry.references {
                if reference == &entry.path {
                    continue;
                }
                assert!(
                    group_of[reference] <= group_of[&entry.path],
                    "{reference} must not land after {}",
                    entry.path,
                );
            }
        }
    }

    #[test]
    fn non_trailing_groups_are_at_least_half_full() {
        let mut graph = DepGraph::from_entries(sample_closure()).unwrap();
        let groups = plan(&mut graph, 500).unwrap();
        for group in &groups[..groups.len() - 1] {
            assert!(group.size() >= 250);
        }
    }

    #[test]
    fn closure_sizes_follow_the_invariant() {
        let graph = DepGraph::from_entries(sample_closure()).unwrap();
        let by_path: HashMap<&str, &PathMeta> = graph
            .slots
            .iter()
            .flatten()
            .map(|m| (m.path.as_str(), m))
            .collect();
        assert_eq!(by_path["/mockstore/aaa"].closure_size, 266);
        assert_eq!(by_path["/mockstore/bbb"].closure_size, 405);
        assert_eq!(by_path["/mockstore/ddd"].closure_size, 1660);
        assert_eq!(by_path["/mockstore/fff"].closure_size, 1210);
    }

    #[test]
    fn self_loops_are_stripped() {
        let graph = DepGraph::from_entries(sample_closure()).unwrap();
        let bbb = graph.slots[1].as_ref().unwrap();
        assert!(!bbb.refs.contains(&1));
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let entries = vec![ClosureInfoEntry {
            path: "/mockstore/aaa".to_string(),
            nar_size: 1,
            references: vec!["/mockstore/zzz".to_string()],
        }];
        assert!(matches!(
            DepGraph::from_entries(entries),
            Err(Error::UnknownReference { .. }),
        ));
    }

    #[test]
    fn registration_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registration");
        let mut f = fs::File::create(&path).unwrap();
        write!(
            f,
            "/mockstore/aaa\nsha256:0000\n266\n\n0\n\
             /mockstore/bbb\nsha256:1111\n100\n\n2\n/mockstore/aaa\n/mockstore/bbb\n",
        )
        .unwrap();
        drop(f);

        let graph = DepGraph::from_registration(&path).unwrap();
        let bbb = graph.slots[1].as_ref().unwrap();
        assert_eq!(bbb.path, "/mockstore/bbb");
        assert_eq!(bbb.size, 100);
        assert_eq!(bbb.closure_size, 366);
        assert_eq!(bbb.refs, HashSet::from([0]));
    }

    #[test]
    fn cycle_is_reported() {
        let entry = |path: &str, references: &[&str]| ClosureInfoEntry {
            path: path.to_string(),
            nar_size: 1,
            references: references.iter().map(|r| r.to_string()).collect(),
        };
        let entries = vec![entry("/a", &["/b"]), entry("/b", &["/a"])];
        assert!(matches!(
            DepGraph::from_entries(entries),
            Err(Error::DependencyCycle(_)),
        ));
    }
}
