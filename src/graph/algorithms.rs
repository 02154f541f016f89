//! Graph algorithms used by the feature builder's global analytics pass and
//! the structural pattern detectors: Tarjan SCC, bounded simple-cycle and
//! simple-path enumeration, weighted PageRank, sampled weighted
//! betweenness, closeness, clustering coefficient, k-core, greedy weighted
//! modularity communities, and k-hop neighborhoods.

use super::Graph;
use crate::{AnalyticsError, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// Tarjan's algorithm. Returns every strongly connected component,
/// including singletons; callers filter by `len() >= 2` where the spec
/// requires it.
pub fn tarjan_scc(graph: &Graph) -> Vec<Vec<usize>> {
    struct State {
        index_counter: usize,
        stack: Vec<usize>,
        on_stack: Vec<bool>,
        indices: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        result: Vec<Vec<usize>>,
    }

    fn strongconnect(v: usize, graph: &Graph, st: &mut State) {
        st.indices[v] = Some(st.index_counter);
        st.lowlink[v] = st.index_counter;
        st.index_counter += 1;
        st.stack.push(v);
        st.on_stack[v] = true;

        for w in graph.successors(v) {
            if st.indices[w].is_none() {
                strongconnect(w, graph, st);
                st.lowlink[v] = st.lowlink[v].min(st.lowlink[w]);
            } else if st.on_stack[w] {
                st.lowlink[v] = st.lowlink[v].min(st.indices[w].unwrap());
            }
        }

        if st.lowlink[v] == st.indices[v].unwrap() {
            let mut component = Vec::new();
            loop {
                let w = st.stack.pop().unwrap();
                st.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            st.result.push(component);
        }
    }

    let n = graph.node_count();
    let mut st = State {
        index_counter: 0,
        stack: Vec::new(),
        on_stack: vec![false; n],
        indices: vec![None; n],
        lowlink: vec![0; n],
        result: Vec::new(),
    };

    for v in 0..n {
        if st.indices[v].is_none() {
            strongconnect(v, graph, &mut st);
        }
    }

    st.result
}

/// Enumerate simple cycles within `members` (one SCC's node set) of length
/// in `[min_len, max_len]`, capped at `max_cycles`. Discovery order is
/// preserved in the returned paths; canonical identity is the caller's
/// responsibility (hash on `sorted(nodes)`).
pub fn simple_cycles_in_scc(
    graph: &Graph,
    members: &[usize],
    min_len: usize,
    max_len: usize,
    max_cycles: usize,
) -> Vec<Vec<usize>> {
    let member_set: HashSet<usize> = members.iter().copied().collect();
    let mut found = Vec::new();

    for &start in members {
        if found.len() >= max_cycles {
            break;
        }
        let mut path = vec![start];
        let mut on_path = HashSet::new();
        on_path.insert(start);
        dfs_cycles(
            graph,
            start,
            start,
            &member_set,
            &mut path,
            &mut on_path,
            min_len,
            max_len,
            max_cycles,
            &mut found,
        );
    }

    found.truncate(max_cycles);
    found
}

#[allow(clippy::too_many_arguments)]
fn dfs_cycles(
    graph: &Graph,
    start: usize,
    current: usize,
    members: &HashSet<usize>,
    path: &mut Vec<usize>,
    on_path: &mut HashSet<usize>,
    min_len: usize,
    max_len: usize,
    max_cycles: usize,
    found: &mut Vec<Vec<usize>>,
) {
    if found.len() >= max_cycles {
        return;
    }
    if path.len() > max_len {
        return;
    }

    for next in graph.successors(current) {
        if found.len() >= max_cycles {
            return;
        }
        if !members.contains(&next) {
            continue;
        }
        if next == start {
            if path.len() >= min_len {
                found.push(path.clone());
            }
            continue;
        }
        // Only extend through nodes with a higher index than `start`,
        // which guarantees each rotation of a cycle is only discovered
        // once (from its minimum-index member).
        if next < start || on_path.contains(&next) {
            continue;
        }
        path.push(next);
        on_path.insert(next);
        dfs_cycles(graph, start, next, members, path, on_path, min_len, max_len, max_cycles, found);
        on_path.remove(&next);
        path.pop();
    }
}

/// Enumerate all simple paths from each of `sources` to each of `targets`,
/// up to `max_len` edges, globally capped at `max_paths`.
pub fn simple_paths(
    graph: &Graph,
    sources: &[usize],
    targets: &[usize],
    max_len: usize,
    max_paths: usize,
) -> Vec<Vec<usize>> {
    let target_set: HashSet<usize> = targets.iter().copied().collect();
    let mut found = Vec::new();

    for &src in sources {
        if found.len() >= max_paths {
            break;
        }
        let mut path = vec![src];
        let mut on_path = HashSet::new();
        on_path.insert(src);
        dfs_paths(graph, src, &target_set, &mut path, &mut on_path, max_len, max_paths, &mut found);
    }

    found.truncate(max_paths);
    found
}

#[allow(clippy::too_many_arguments)]
fn dfs_paths(
    graph: &Graph,
    current: usize,
    targets: &HashSet<usize>,
    path: &mut Vec<usize>,
    on_path: &mut HashSet<usize>,
    max_len: usize,
    max_paths: usize,
    found: &mut Vec<Vec<usize>>,
) {
    if found.len() >= max_paths {
        return;
    }
    if targets.contains(&current) && path.len() > 1 {
        found.push(path.clone());
    }
    if path.len() > max_len {
        return;
    }
    for next in graph.successors(current) {
        if found.len() >= max_paths {
            return;
        }
        if on_path.contains(&next) {
            continue;
        }
        path.push(next);
        on_path.insert(next);
        dfs_paths(graph, next, targets, path, on_path, max_len, max_paths, found);
        on_path.remove(&next);
        path.pop();
    }
}

/// Weighted PageRank, damping 0.85 by default, weighted by
/// `amount_usd_sum`.
pub fn pagerank(graph: &Graph, damping: f64) -> Vec<f64> {
    let n = graph.node_count();
    if n == 0 {
        return Vec::new();
    }
    let out_weight: Vec<f64> = (0..n).map(|v| graph.out_edges(v).map(|e| e.weight.max(0.0)).sum()).collect();

    let mut rank = vec![1.0 / n as f64; n];
    for _ in 0..100 {
        let mut next = vec![(1.0 - damping) / n as f64; n];
        let mut dangling_mass = 0.0;
        for v in 0..n {
            if out_weight[v] <= 0.0 {
                dangling_mass += rank[v];
            }
        }
        if dangling_mass > 0.0 {
            for x in next.iter_mut() {
                *x += damping * dangling_mass / n as f64;
            }
        }
        for v in 0..n {
            if out_weight[v] <= 0.0 {
                continue;
            }
            for e in graph.out_edges(v) {
                let share = if out_weight[v] > 0.0 { e.weight.max(0.0) / out_weight[v] } else { 0.0 };
                next[e.to] += damping * rank[v] * share;
            }
        }
        let delta: f64 = next.iter().zip(rank.iter()).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < 1e-9 {
            break;
        }
    }
    rank
}

/// Weighted Brandes betweenness, approximated with `k = min(1000, |V|-1)`
/// pivots sampled deterministically (first-k by node index) when `|V| > 1`.
pub fn betweenness(graph: &Graph) -> Vec<f64> {
    let n = graph.node_count();
    if n <= 1 {
        return vec![0.0; n];
    }
    let k = 1000.min(n - 1);
    let mut centrality = vec![0.0; n];

    for s in 0..k {
        let (dist, sigma, preds, order) = dijkstra_weighted(graph, s, n);
        let mut delta = vec![0.0; n];
        for &w in order.iter().rev() {
            for &v in &preds[w] {
                if sigma[w] > 0.0 {
                    delta[v] += (sigma[v] / sigma[w]) * (1.0 + delta[w]);
                }
            }
            if w != s && dist[w].is_finite() {
                centrality[w] += delta[w];
            }
        }
    }

    if k < n {
        let scale = n as f64 / k as f64;
        for c in centrality.iter_mut() {
            *c *= scale;
        }
    }

    centrality
}

/// Single-source weighted shortest paths (edge cost = `1/weight` so that
/// high-volume edges are "closer"), returning distances, path counts
/// (sigma), predecessor lists, and a non-decreasing-distance visit order —
/// the quantities Brandes' algorithm needs.
#[allow(clippy::type_complexity)]
fn dijkstra_weighted(graph: &Graph, source: usize, n: usize) -> (Vec<f64>, Vec<f64>, Vec<Vec<usize>>, Vec<usize>) {
    let mut dist = vec![f64::INFINITY; n];
    let mut sigma = vec![0.0; n];
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    dist[source] = 0.0;
    sigma[source] = 1.0;

    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);

    // A minimal total-order wrapper over f64 so a plain BinaryHeap can be
    // used as the priority queue; graph edge weights are always finite.
    #[derive(PartialEq)]
    struct HeapKey(f64);
    impl Eq for HeapKey {}
    impl PartialOrd for HeapKey {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for HeapKey {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
        }
    }

    let mut heap: std::collections::BinaryHeap<std::cmp::Reverse<(HeapKey, usize)>> = std::collections::BinaryHeap::new();
    heap.push(std::cmp::Reverse((HeapKey(0.0), source)));

    while let Some(std::cmp::Reverse((d, u))) = heap.pop() {
        if visited[u] {
            continue;
        }
        visited[u] = true;
        order.push(u);
        let du = d.0;
        for e in graph.out_edges(u) {
            let cost = 1.0 / e.weight.max(1e-9);
            let alt = du + cost;
            if alt < dist[e.to] - 1e-12 {
                dist[e.to] = alt;
                sigma[e.to] = sigma[u];
                preds[e.to] = vec![u];
                heap.push(std::cmp::Reverse((HeapKey(alt), e.to)));
            } else if (alt - dist[e.to]).abs() < 1e-9 {
                sigma[e.to] += sigma[u];
                preds[e.to].push(u);
            }
        }
    }

    (dist, sigma, preds, order)
}

/// Unweighted closeness centrality on the undirected projection:
/// `(reachable_count - 1) / sum(distances)`, 0 if unreachable from all
/// others.
pub fn closeness(graph: &Graph) -> Vec<f64> {
    let n = graph.node_count();
    let mut result = vec![0.0; n];
    for s in 0..n {
        let dist = bfs_undirected(graph, s);
        let reachable: usize = dist.iter().filter(|d| d.is_some()).count();
        let sum: i64 = dist.iter().flatten().sum();
        if reachable > 1 && sum > 0 {
            result[s] = (reachable as f64 - 1.0) / sum as f64;
        }
    }
    result
}

fn bfs_undirected(graph: &Graph, source: usize) -> Vec<Option<i64>> {
    let n = graph.node_count();
    let mut dist = vec![None; n];
    dist[source] = Some(0);
    let mut q = VecDeque::new();
    q.push_back(source);
    while let Some(u) = q.pop_front() {
        let du = dist[u].unwrap();
        for (v, _) in graph.undirected_neighbors(u) {
            if dist[v].is_none() {
                dist[v] = Some(du + 1);
                q.push_back(v);
            }
        }
    }
    dist
}

/// Local clustering coefficient on the undirected projection (unweighted):
/// `2 * triangles / (deg * (deg - 1))`, 0 when `deg < 2`.
pub fn clustering_coefficient(graph: &Graph) -> Vec<f64> {
    let n = graph.node_count();
    let neighbor_sets: Vec<HashSet<usize>> =
        (0..n).map(|v| graph.undirected_neighbors(v).keys().copied().collect()).collect();

    let mut result = vec![0.0; n];
    for v in 0..n {
        let neighbors = &neighbor_sets[v];
        let deg = neighbors.len();
        if deg < 2 {
            continue;
        }
        let mut links = 0usize;
        let list: Vec<usize> = neighbors.iter().copied().collect();
        for i in 0..list.len() {
            for j in (i + 1)..list.len() {
                if neighbor_sets[list[i]].contains(&list[j]) {
                    links += 1;
                }
            }
        }
        result[v] = (2 * links) as f64 / (deg * (deg - 1)) as f64;
    }
    result
}

/// Undirected, unweighted k-core decomposition via iterative peeling.
/// Returns the core number of each node.
pub fn k_core(graph: &Graph) -> Vec<usize> {
    let n = graph.node_count();
    let mut degree: Vec<usize> = (0..n).map(|v| graph.undirected_neighbors(v).len()).collect();
    let neighbor_sets: Vec<Vec<usize>> =
        (0..n).map(|v| graph.undirected_neighbors(v).keys().copied().collect()).collect();
    let mut core = vec![0usize; n];
    let mut removed = vec![false; n];
    let mut remaining = n;

    while remaining > 0 {
        let k = *degree.iter().enumerate().filter(|(v, _)| !removed[*v]).map(|(_, d)| d).min().unwrap_or(&0);
        loop {
            let to_remove: Vec<usize> =
                (0..n).filter(|&v| !removed[v] && degree[v] <= k).collect();
            if to_remove.is_empty() {
                break;
            }
            for v in to_remove {
                removed[v] = true;
                core[v] = k;
                remaining -= 1;
                for &u in &neighbor_sets[v] {
                    if !removed[u] {
                        degree[u] = degree[u].saturating_sub(1);
                    }
                }
            }
        }
    }

    core
}

/// Greedy weighted-modularity community detection on the undirected
/// projection (agglomerative merge of the pair that most increases
/// modularity, à la Clauset-Newman-Moore). Fatal on a degenerate graph
/// (`CommunityDetectionFailed`) rather than a silent empty assignment.
pub fn greedy_modularity_communities(graph: &Graph) -> Result<Vec<Vec<usize>>> {
    let n = graph.node_count();
    if n == 0 {
        return Err(AnalyticsError::CommunityDetectionFailed("empty graph".to_string()));
    }

    let total_weight: f64 = graph.edges().map(|e| e.weight.max(0.0)).sum::<f64>() * 2.0;
    if total_weight <= 0.0 {
        // No weighted edges to form communities from; every node is its
        // own community (a valid degenerate partition, not a failure).
        return Ok((0..n).map(|v| vec![v]).collect());
    }
    let m2 = total_weight;

    let mut communities: Vec<HashSet<usize>> = (0..n).map(|v| HashSet::from([v])).collect();
    let mut comm_weight: Vec<f64> = (0..n)
        .map(|v| graph.undirected_neighbors(v).values().sum())
        .collect();

    // Adjacency between current communities, keyed by (min, max) community id.
    let mut comm_adj: HashMap<(usize, usize), f64> = HashMap::new();
    for v in 0..n {
        for (u, w) in graph.undirected_neighbors(v) {
            if u == v {
                continue;
            }
            let key = if v < u { (v, u) } else { (u, v) };
            *comm_adj.entry(key).or_insert(0.0) += w;
        }
    }

    let mut alive: Vec<bool> = vec![true; n];
    loop {
        let mut best: Option<((usize, usize), f64)> = None;
        for (&(a, b), &w_ab) in comm_adj.iter() {
            if !alive[a] || !alive[b] {
                continue;
            }
            let dq = w_ab / m2 - (comm_weight[a] * comm_weight[b]) / (m2 * m2);
            if best.map(|(_, bq)| dq > bq).unwrap_or(true) {
                best = Some(((a, b), dq));
            }
        }

        match best {
            Some(((a, b), dq)) if dq > 0.0 => {
                let b_members: Vec<usize> = communities[b].drain().collect();
                communities[a].extend(b_members);
                comm_weight[a] += comm_weight[b];
                comm_weight[b] = 0.0;
                alive[b] = false;

                let moved: Vec<((usize, usize), f64)> = comm_adj
                    .iter()
                    .filter(|(&(x, y), _)| x == b || y == b)
                    .map(|(&k, &v)| (k, v))
                    .collect();
                for ((x, y), w) in moved {
                    comm_adj.remove(&(x, y));
                    let other = if x == b { y } else { x };
                    if other == a {
                        continue;
                    }
                    let key = if a < other { (a, other) } else { (other, a) };
                    *comm_adj.entry(key).or_insert(0.0) += w;
                }
            }
            _ => break,
        }
    }

    let result: Vec<Vec<usize>> = communities
        .into_iter()
        .enumerate()
        .filter(|(i, _)| alive[*i])
        .map(|(_, members)| members.into_iter().collect())
        .collect();

    if result.is_empty() {
        return Err(AnalyticsError::CommunityDetectionFailed("no communities produced".to_string()));
    }

    Ok(result)
}

/// Per-node k-hop neighborhood size and cumulative incident-edge volume
/// for `k ∈ {1, 2, 3}`, on the undirected projection.
pub struct KHopStats {
    pub count: [i64; 3],
    pub volume_usd: [f64; 3],
}

pub fn k_hop_neighborhoods(graph: &Graph) -> Vec<KHopStats> {
    let n = graph.node_count();
    let mut stats: Vec<KHopStats> = (0..n).map(|_| KHopStats { count: [0; 3], volume_usd: [0.0; 3] }).collect();

    for source in 0..n {
        let mut dist = vec![None; n];
        dist[source] = Some(0usize);
        let mut frontier = vec![source];
        let mut seen_edges: HashSet<(usize, usize)> = HashSet::new();
        let mut cum_count = 0i64;
        let mut cum_volume = 0.0f64;

        for depth in 1..=3 {
            let mut next_frontier = Vec::new();
            for &u in &frontier {
                for (v, w) in graph.undirected_neighbors(u) {
                    let key = if u < v { (u, v) } else { (v, u) };
                    if seen_edges.insert(key) {
                        cum_volume += w;
                    }
                    if dist[v].is_none() {
                        dist[v] = Some(depth);
                        cum_count += 1;
                        next_frontier.push(v);
                    }
                }
            }
            stats[source].count[depth - 1] = cum_count;
            stats[source].volume_usd[depth - 1] = cum_volume;
            frontier = next_frontier;
            if frontier.is_empty() {
                for d in depth..3 {
                    stats[source].count[d] = cum_count;
                    stats[source].volume_usd[d] = cum_volume;
                }
                break;
            }
        }
    }

    stats
}
