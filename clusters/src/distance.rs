/// Computes the distance from `data[anchor]` to every row in `data[start..end]`.
///
/// The result has `end - start` entries; entry `i` belongs to row `start + i`.
pub type BatchDistanceFunc = fn(data: &[Vec<f32>], anchor: usize, start: usize, end: usize) -> Vec<f32>;

/// Euclidean distance between two vectors of equal length.
///
/// Accumulates in `f32` like the input and takes the root in `f64`.
/// Callers must check dimensions first; extra components of the longer
/// vector are ignored.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut sum: f32 = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let t = x - y;
        sum += t * t;
    }
    (sum as f64).sqrt()
}

/// Default [`BatchDistanceFunc`]: Euclidean distance of one anchor row to a
/// contiguous range of rows. Produces exactly what [`euclidean_distance`]
/// returns for each pair.
pub fn batch_euclidean_distance(data: &[Vec<f32>], anchor: usize, start: usize, end: usize) -> Vec<f32> {
    let a = data[anchor].as_slice();
    data[start..end]
        .iter()
        .map(|b| euclidean_distance(a, b) as f32)
        .collect()
}

/// Normalizes a vector to unit length in-place and returns the original norm.
/// The norm is clamped from below by `epsilon` so zero vectors stay finite.
pub fn l2_normalize(v: &mut [f32], epsilon: f64) -> f64 {
    let mut sum: f64 = 0.0;
    for &x in v.iter() {
        sum += (x as f64) * (x as f64);
    }
    let norm = sum.max(epsilon).sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
    norm
}
