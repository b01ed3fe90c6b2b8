//! Cluster-count selection, seeded k-means, and representative selection.
//!
//! [`choose_k`] grows the topic count sub-linearly with the number of
//! fragments (`round(sqrt(n / 2))`, clamped to `[2, n]`). [`KMeans`] is a
//! Lloyd's-algorithm k-means with k-means++ seeding drawn from a
//! [`StdRng`] seeded by the caller, restarted `n_init` times keeping the
//! lowest-inertia run, so identical inputs and seed give identical
//! partitions.
//!
//! Every cluster of a returned [`Clustering`] is non-empty: a point only
//! changes cluster when another centroid is strictly closer, and a cluster
//! that ends up empty takes over the point lying farthest from its own
//! centroid.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::similarity::{cosine_distance, mean_vector, squared_euclidean};

/// Choose the number of clusters for `n` embedded fragments.
pub fn choose_k(n: usize) -> usize {
    if n <= 2 {
        return n.max(1);
    }
    let k = (n as f64 / 2.0).sqrt().round() as usize;
    k.clamp(2, n)
}

/// Result of partitioning points into `k` clusters.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// Cluster id per input point, in input order.
    pub assignments: Vec<usize>,
    /// Mean vector per cluster id.
    pub centroids: Vec<Vec<f32>>,
    /// Sum of squared distances of points to their centroid.
    pub inertia: f64,
}

impl Clustering {
    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    /// Point indices grouped by cluster id, each group in input order.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.k()];
        for (point, &cluster) in self.assignments.iter().enumerate() {
            groups[cluster].push(point);
        }
        groups
    }
}

#[derive(Debug, Clone)]
pub struct KMeans {
    pub k: usize,
    pub n_init: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

impl KMeans {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            n_init: 10,
            max_iterations: 300,
            seed,
        }
    }

    pub fn n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init.max(1);
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn fit(&self, points: &[Vec<f32>]) -> Result<Clustering> {
        if points.is_empty() {
            bail!("cannot cluster an empty point set");
        }
        if self.k == 0 || self.k > points.len() {
            bail!(
                "cluster count {} is invalid for {} points",
                self.k,
                points.len()
            );
        }
        let dims = points[0].len();
        if dims == 0 || points.iter().any(|p| p.len() != dims) {
            bail!("all points must share one non-zero dimension");
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<Clustering> = None;

        for run in 0..self.n_init {
            let candidate = self.run_once(points, dims, &mut rng);
            debug!(run, inertia = candidate.inertia, "k-means run finished");
            let better = best
                .as_ref()
                .map_or(true, |b| candidate.inertia < b.inertia);
            if better {
                best = Some(candidate);
            }
        }

        best.ok_or_else(|| anyhow::anyhow!("k-means produced no result"))
    }

    fn run_once(&self, points: &[Vec<f32>], dims: usize, rng: &mut StdRng) -> Clustering {
        let k = self.k;
        let mut centroids = init_plus_plus(points, k, rng);

        let mut assignments: Vec<usize> = points
            .iter()
            .map(|p| nearest(p, &centroids))
            .collect();
        fill_empty_clusters(points, &mut assignments, &mut centroids);

        for _ in 0..self.max_iterations {
            centroids = recompute_centroids(points, &assignments, k, dims);

            let mut changed = false;
            for (i, p) in points.iter().enumerate() {
                let current = assignments[i];
                let mut best = current;
                let mut best_d = squared_euclidean(p, &centroids[current]);
                for (c, centroid) in centroids.iter().enumerate() {
                    let d = squared_euclidean(p, centroid);
                    if d < best_d {
                        best = c;
                        best_d = d;
                    }
                }
                if best != current {
                    assignments[i] = best;
                    changed = true;
                }
            }
            changed |= fill_empty_clusters(points, &mut assignments, &mut centroids);

            if !changed {
                break;
            }
        }

        let centroids = recompute_centroids(points, &assignments, k, dims);
        let inertia = points
            .iter()
            .zip(assignments.iter())
            .map(|(p, &c)| squared_euclidean(p, &centroids[c]))
            .sum();

        Clustering {
            assignments,
            centroids,
            inertia,
        }
    }
}

/// k-means++ seeding: each next center is drawn with probability
/// proportional to its squared distance from the nearest chosen center.
fn init_plus_plus(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let n = points.len();
    let mut centers = Vec::with_capacity(k);
    centers.push(points[rng.random_range(0..n)].clone());

    let mut dist: Vec<f64> = points
        .iter()
        .map(|p| squared_euclidean(p, &centers[0]))
        .collect();

    while centers.len() < k {
        let total: f64 = dist.iter().sum();
        let idx = if total <= 0.0 {
            // Every point coincides with a center already
            rng.random_range(0..n)
        } else {
            let mut target = rng.random::<f64>() * total;
            let mut chosen = n - 1;
            for (i, d) in dist.iter().enumerate() {
                if target < *d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };

        let center = points[idx].clone();
        for (d, p) in dist.iter_mut().zip(points.iter()) {
            *d = d.min(squared_euclidean(p, &center));
        }
        centers.push(center);
    }

    centers
}

fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let d = squared_euclidean(point, centroid);
        if d < best_d {
            best = c;
            best_d = d;
        }
    }
    best
}

fn recompute_centroids(
    points: &[Vec<f32>],
    assignments: &[usize],
    k: usize,
    dims: usize,
) -> Vec<Vec<f32>> {
    (0..k)
        .map(|c| {
            let mean = mean_vector(
                points
                    .iter()
                    .zip(assignments.iter())
                    .filter(|(_, &a)| a == c)
                    .map(|(p, _)| p.as_slice()),
                dims,
            );
            if mean.is_empty() {
                vec![0.0; dims]
            } else {
                mean
            }
        })
        .collect()
}

/// Give every empty cluster the point farthest from its centroid, taken
/// from a cluster that can spare one. Returns whether anything moved.
fn fill_empty_clusters(
    points: &[Vec<f32>],
    assignments: &mut [usize],
    centroids: &mut [Vec<f32>],
) -> bool {
    let k = centroids.len();
    let mut sizes = vec![0usize; k];
    for &a in assignments.iter() {
        sizes[a] += 1;
    }

    let mut moved = false;
    for empty in 0..k {
        if sizes[empty] > 0 {
            continue;
        }
        let donor = (0..points.len())
            .filter(|&i| sizes[assignments[i]] > 1)
            .max_by(|&a, &b| {
                let da = squared_euclidean(&points[a], &centroids[assignments[a]]);
                let db = squared_euclidean(&points[b], &centroids[assignments[b]]);
                da.total_cmp(&db).then(b.cmp(&a))
            });
        let Some(i) = donor else {
            break;
        };
        sizes[assignments[i]] -= 1;
        sizes[empty] += 1;
        assignments[i] = empty;
        centroids[empty] = points[i].clone();
        moved = true;
    }
    moved
}

/// Indices of the `top_n` members closest (by cosine distance) to `centroid`.
///
/// Ties keep member order.
pub fn select_representatives(
    members: &[usize],
    points: &[Vec<f32>],
    centroid: &[f32],
    top_n: usize,
) -> Vec<usize> {
    let mut ranked: Vec<(usize, f32)> = members
        .iter()
        .map(|&i| (i, cosine_distance(&points[i], centroid)))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    ranked.into_iter().take(top_n).map(|(i, _)| i).collect()
}
