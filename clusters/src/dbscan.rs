use crossbeam::channel::{self, Sender};
use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;

use crate::distance::BatchDistanceFunc;
use crate::error::ClusterError;

/// Label of a point that has not been reached yet.
pub const UNASSIGNED: i32 = 0;

/// Label of a point that is not density-reachable from any core point.
pub const NOISE: i32 = -1;

/// DBSCAN with concurrent neighbourhood queries.
///
/// Cluster ids start at 1 and follow input order: the cluster containing the
/// lowest-index core point gets id 1, and so on.
pub struct Dbscan {
    min_pts: usize,
    eps: f32,
    workers: usize,
    distance: BatchDistanceFunc,

    guesses: Vec<i32>,
    sizes: Vec<usize>,
}

impl Dbscan {
    /// Creates a clusterer.
    ///
    /// - `min_pts`: neighbours (the point itself included) needed for a core point
    /// - `eps`: neighbourhood radius; a point at exactly `eps` is not a neighbour
    /// - `workers`: upper bound for query workers, `0` picks one from the data size
    pub fn new(
        min_pts: usize,
        eps: f32,
        workers: usize,
        distance: BatchDistanceFunc,
    ) -> Result<Self, ClusterError> {
        if min_pts < 1 {
            return Err(ClusterError::ZeroMinPoints);
        }
        if eps.is_nan() || eps <= 0.0 {
            return Err(ClusterError::InvalidEpsilon(eps));
        }

        Ok(Self {
            min_pts,
            eps,
            workers,
            distance,
            guesses: Vec::new(),
            sizes: Vec::new(),
        })
    }

    /// Clusters the whole batch, replacing any previous result.
    ///
    /// On error the previous result is left untouched.
    pub fn learn(&mut self, data: &[Vec<f32>]) -> Result<(), ClusterError> {
        if data.is_empty() {
            return Err(ClusterError::EmptySet);
        }
        let dim = data[0].len();
        if let Some((row, v)) = data.iter().enumerate().find(|(_, v)| v.len() != dim) {
            return Err(ClusterError::DimensionMismatch {
                row,
                expected: dim,
                got: v.len(),
            });
        }

        let len = data.len();
        let workers = num_workers(len, self.workers);
        let chunk = len.div_ceil(workers);
        let (min_pts, eps, distance) = (self.min_pts, self.eps, self.distance);

        tracing::debug!(
            "clusters: dbscan over {} points, {} workers, eps {}, min points {}",
            len,
            workers,
            eps,
            min_pts
        );

        let found = Mutex::new(Vec::new());
        let (tx, rx) = channel::unbounded::<RangeJob>();

        let (guesses, sizes) = std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let found = &found;
                scope.spawn(move || {
                    for job in rx.iter() {
                        let near: Vec<usize> = distance(data, job.anchor, job.start, job.end)
                            .iter()
                            .enumerate()
                            .filter(|(_, d)| **d < eps)
                            .map(|(i, _)| job.start + i)
                            .collect();
                        if !near.is_empty() {
                            found.lock().extend(near);
                        }
                        drop(job.done);
                    }
                });
            }

            // Dropping the query at the end of this closure closes the
            // channel and lets the workers exit before the scope joins them.
            let query = NeighbourQuery {
                jobs: tx,
                found: &found,
                len,
                chunk,
            };
            expand(&query, len, min_pts)
        });

        self.guesses = guesses;
        self.sizes = sizes;
        Ok(())
    }

    /// Population of each cluster; index `k - 1` holds the size of cluster `k`.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Cluster id per input point: `k >= 1`, or [`NOISE`].
    pub fn guesses(&self) -> &[i32] {
        &self.guesses
    }
}

struct RangeJob {
    anchor: usize,
    start: usize,
    end: usize,
    done: WaitGroup,
}

/// Scatter-gather neighbourhood search over the worker pool.
struct NeighbourQuery<'a> {
    jobs: Sender<RangeJob>,
    found: &'a Mutex<Vec<usize>>,
    len: usize,
    chunk: usize,
}

impl NeighbourQuery<'_> {
    /// Returns the sorted indices of all points within eps of `anchor`.
    fn nearest(&self, anchor: usize) -> Vec<usize> {
        self.found.lock().clear();

        let wg = WaitGroup::new();
        let mut start = 0;
        while start < self.len {
            let end = (start + self.chunk).min(self.len);
            let job = RangeJob {
                anchor,
                start,
                end,
                done: wg.clone(),
            };
            if self.jobs.send(job).is_err() {
                // Workers are gone; nothing left to wait for.
                break;
            }
            start = end;
        }
        wg.wait();

        let mut near = std::mem::take(&mut *self.found.lock());
        near.sort_unstable();
        near
    }
}

fn expand(query: &NeighbourQuery<'_>, len: usize, min_pts: usize) -> (Vec<i32>, Vec<usize>) {
    let mut visited = vec![false; len];
    let mut guesses = vec![UNASSIGNED; len];
    let mut sizes: Vec<usize> = Vec::new();
    let mut cluster: i32 = 1;

    for i in 0..len {
        if visited[i] {
            continue;
        }
        visited[i] = true;

        let mut frontier = query.nearest(i);
        if frontier.len() < min_pts {
            guesses[i] = NOISE;
            continue;
        }

        guesses[i] = cluster;
        sizes.push(1);
        let size = sizes.len() - 1;

        // The frontier grows while it is walked; border points already
        // claimed by an earlier cluster keep their id.
        let mut j = 0;
        while j < frontier.len() {
            let q = frontier[j];
            if !visited[q] {
                visited[q] = true;
                let next = query.nearest(q);
                if next.len() >= min_pts {
                    frontier.extend(next);
                }
            }
            if guesses[q] == UNASSIGNED || guesses[q] == NOISE {
                guesses[q] = cluster;
                sizes[size] += 1;
            }
            j += 1;
        }

        cluster += 1;
    }

    (guesses, sizes)
}

/// Picks the worker count from the data size, capped by `requested` if set.
fn num_workers(len: usize, requested: usize) -> usize {
    let by_size = if len < 1_000 {
        1
    } else if len < 10_000 {
        4
    } else if len < 100_000 {
        16
    } else {
        64
    };

    if requested == 0 || requested >= by_size {
        by_size
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{batch_euclidean_distance, euclidean_distance};

    fn learn(data: &[Vec<f32>], min_pts: usize, eps: f32, workers: usize) -> Dbscan {
        let mut c = Dbscan::new(min_pts, eps, workers, batch_euclidean_distance).unwrap();
        c.learn(data).unwrap();
        c
    }

    /// Deterministic pseudo-random blobs around a few centres.
    fn blobs(per_blob: usize, centres: &[[f32; 3]], spread: f32) -> Vec<Vec<f32>> {
        let mut state: u64 = 42;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f32) / ((1u64 << 31) as f32) - 0.5
        };
        let mut out = Vec::new();
        for i in 0..per_blob * centres.len() {
            let c = centres[i % centres.len()];
            out.push(vec![c[0] + next() * spread, c[1] + next() * spread, c[2] + next() * spread]);
        }
        out
    }

    #[test]
    fn three_points_two_clusters() {
        let data = vec![vec![0.0, 0.0], vec![0.0, 0.1], vec![5.0, 5.0]];
        let c = learn(&data, 1, 1.0, 0);
        assert_eq!(c.guesses(), &[1, 1, 2]);
        assert_eq!(c.sizes(), &[2, 1]);
    }

    #[test]
    fn isolated_point_is_noise() {
        let data = vec![vec![0.0, 0.0], vec![0.0, 0.1], vec![0.1, 0.0], vec![9.0, 9.0]];
        let c = learn(&data, 2, 0.5, 0);
        assert_eq!(c.guesses(), &[1, 1, 1, NOISE]);
        assert_eq!(c.sizes(), &[3]);
    }

    #[test]
    fn distance_equal_to_eps_is_not_a_neighbour() {
        let data = vec![vec![0.0], vec![1.0]];
        let c = learn(&data, 2, 1.0, 0);
        assert_eq!(c.guesses(), &[NOISE, NOISE]);
        assert!(c.sizes().is_empty());
    }

    #[test]
    fn noise_is_absorbed_as_border_point() {
        // Point 0 only sees itself and point 1, too few for min_pts 3,
        // but core point 1 reaches it later.
        let data = vec![vec![0.0], vec![0.9], vec![1.5], vec![2.0]];
        let c = learn(&data, 3, 1.0, 0);
        assert_eq!(c.guesses(), &[1, 1, 1, 1]);
        assert_eq!(c.sizes(), &[4]);
    }

    #[test]
    fn sizes_match_guesses() {
        let data = blobs(40, &[[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [0.0, 10.0, 0.0]], 1.0);
        let c = learn(&data, 4, 0.9, 0);

        for (k, size) in c.sizes().iter().enumerate() {
            let count = c.guesses().iter().filter(|&&g| g == k as i32 + 1).count();
            assert_eq!(count, *size, "cluster {}", k + 1);
        }
        for g in c.guesses() {
            assert!(*g == NOISE || *g >= 1);
        }
    }

    #[test]
    fn core_neighbours_are_never_noise() {
        let data = blobs(30, &[[0.0, 0.0, 0.0], [6.0, 6.0, 6.0]], 2.0);
        let (min_pts, eps) = (5, 0.8_f32);
        let c = learn(&data, min_pts, eps, 0);

        for (i, p) in data.iter().enumerate() {
            let neighbours: Vec<usize> = (0..data.len())
                .filter(|&j| (euclidean_distance(p, &data[j]) as f32) < eps)
                .collect();
            if neighbours.len() >= min_pts {
                for j in neighbours {
                    assert!(c.guesses()[j] >= 1, "point {j} near core point {i}");
                }
            }
        }
    }

    #[test]
    fn deterministic_across_worker_counts() {
        // 1200 points force more than one range per query.
        let data = blobs(400, &[[0.0, 0.0, 0.0], [5.0, 0.0, 0.0], [0.0, 5.0, 0.0]], 1.5);

        let single = learn(&data, 4, 0.4, 1);
        let many = learn(&data, 4, 0.4, 4);
        let again = learn(&data, 4, 0.4, 4);

        assert_eq!(single.guesses(), many.guesses());
        assert_eq!(many.guesses(), again.guesses());
        assert_eq!(single.sizes(), many.sizes());
    }

    #[test]
    fn invalid_parameters() {
        assert_eq!(
            Dbscan::new(0, 1.0, 0, batch_euclidean_distance).err(),
            Some(ClusterError::ZeroMinPoints)
        );
        assert_eq!(
            Dbscan::new(1, 0.0, 0, batch_euclidean_distance).err(),
            Some(ClusterError::InvalidEpsilon(0.0))
        );
        assert!(Dbscan::new(1, f32::NAN, 0, batch_euclidean_distance).is_err());
    }

    #[test]
    fn empty_and_ragged_input_leave_state_untouched() {
        let mut c = Dbscan::new(1, 1.0, 0, batch_euclidean_distance).unwrap();
        c.learn(&[vec![0.0], vec![0.5]]).unwrap();
        assert_eq!(c.guesses(), &[1, 1]);

        assert_eq!(c.learn(&[]), Err(ClusterError::EmptySet));
        assert_eq!(
            c.learn(&[vec![0.0, 1.0], vec![2.0]]),
            Err(ClusterError::DimensionMismatch {
                row: 1,
                expected: 2,
                got: 1
            })
        );
        assert_eq!(c.guesses(), &[1, 1]);
    }

    #[test]
    fn worker_count_scales_and_clamps() {
        assert_eq!(num_workers(10, 0), 1);
        assert_eq!(num_workers(5_000, 0), 4);
        assert_eq!(num_workers(50_000, 0), 16);
        assert_eq!(num_workers(500_000, 0), 64);
        assert_eq!(num_workers(500_000, 8), 8);
        assert_eq!(num_workers(10, 8), 1);
    }
}
