use criterion::{Criterion, black_box, criterion_group, criterion_main};
use facekit_clusters::{Dbscan, batch_euclidean_distance, l2_normalize};

fn random_unit_vec(dim: usize, seed: u64) -> Vec<f32> {
    let mut v = Vec::with_capacity(dim);
    let mut state = seed;
    for _ in 0..dim {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        v.push(((state >> 33) as f32) / (u32::MAX as f32) - 0.5);
    }
    l2_normalize(&mut v, 1e-12);
    v
}

fn make_cluster(centroid: &[f32], n: usize, noise: f32, base_seed: u64) -> Vec<Vec<f32>> {
    let dim = centroid.len();
    (0..n)
        .map(|i| {
            let mut v = centroid.to_vec();
            let rvec = random_unit_vec(dim, base_seed.wrapping_add(i as u64 * 997));
            for (j, x) in v.iter_mut().enumerate() {
                *x += rvec[j] * noise;
            }
            l2_normalize(&mut v, 1e-12);
            v
        })
        .collect()
}

fn bench_batch_distance(c: &mut Criterion) {
    let dim = 512;
    let data: Vec<Vec<f32>> = (0..1000).map(|i| random_unit_vec(dim, i)).collect();

    c.bench_function("batch_euclidean_512d_1000rows", |b| {
        b.iter(|| black_box(batch_euclidean_distance(black_box(&data), 0, 0, data.len())));
    });
}

fn bench_learn(c: &mut Criterion) {
    let dim = 512;
    let mut data = Vec::new();
    for (k, seed) in [10u64, 20, 30].iter().enumerate() {
        let centre = random_unit_vec(dim, *seed);
        data.extend(make_cluster(&centre, 400, 0.3, 100 * (k as u64 + 1)));
    }

    c.bench_function("dbscan_learn_512d_1200points_3clusters", |b| {
        b.iter_with_setup(
            || Dbscan::new(4, 0.64, 0, batch_euclidean_distance).unwrap(),
            |mut clusterer| {
                clusterer.learn(&data).unwrap();
                black_box(clusterer.sizes().len())
            },
        );
    });
}

criterion_group!(benches, bench_batch_distance, bench_learn);
criterion_main!(benches);
