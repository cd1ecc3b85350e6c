use std::collections::VecDeque;

use rayon::prelude::*;

use crate::config::ClusterConfig;

/// DBSCAN over embedding vectors with Euclidean distance.
///
/// Returns one label per point; `None` is noise. Clusters with fewer than
/// `min_cluster_size` members become noise and the survivors are renumbered
/// from 0 in discovery order.
pub fn dbscan(points: &[Vec<f32>], params: &ClusterConfig) -> Vec<Option<usize>> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }

    let eps_sq = params.eps * params.eps;
    let neighbours: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .filter(|&j| squared_distance(&points[i], &points[j]) <= eps_sq)
                .collect()
        })
        .collect();

    let is_core = |i: usize| neighbours[i].len() >= params.min_samples;

    let mut raw: Vec<Option<usize>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_label = 0usize;

    for start in 0..n {
        if visited[start] || !is_core(start) {
            continue;
        }

        let label = next_label;
        next_label += 1;
        visited[start] = true;
        raw[start] = Some(label);

        let mut queue: VecDeque<usize> = neighbours[start].iter().copied().collect();
        while let Some(p) = queue.pop_front() {
            if raw[p].is_none() {
                raw[p] = Some(label);
            }
            if visited[p] {
                continue;
            }
            visited[p] = true;
            if is_core(p) {
                queue.extend(neighbours[p].iter().copied().filter(|&q| !visited[q]));
            }
        }
    }

    prune_small(raw, next_label, params.min_cluster_size)
}

fn prune_small(raw: Vec<Option<usize>>, clusters: usize, min_size: usize) -> Vec<Option<usize>> {
    let mut sizes = vec![0usize; clusters];
    for label in raw.iter().flatten() {
        sizes[*label] += 1;
    }

    let mut remap: Vec<Option<usize>> = vec![None; clusters];
    let mut next = 0;
    for label in raw.iter().flatten() {
        if remap[*label].is_none() && sizes[*label] >= min_size {
            remap[*label] = Some(next);
            next += 1;
        }
    }

    raw.into_iter()
        .map(|label| label.and_then(|l| remap[l]))
        .collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Number of distinct clusters in a label vector.
pub fn cluster_count(labels: &[Option<usize>]) -> usize {
    labels.iter().flatten().max().map_or(0, |m| m + 1)
}
