//! The clustering pass: builds new faces from unclustered embeddings.

use facekit_clusters::{Dbscan, batch_euclidean_distance};

use crate::embedding::Embeddings;
use crate::error::{FacesError, Result};
use crate::face::Face;
use crate::source::Source;
use crate::worker::{Faces, FacesOptions};

impl Faces {
    /// Clusters the embeddings of face markers that have no face yet and
    /// stores a face per cluster. Returns the faces that were added.
    ///
    /// Without `force`, the pass is skipped until at least the sample
    /// threshold of new markers exists. Clusters smaller than
    /// `cluster_min_size` and unsuitable clusters are dropped. A cluster
    /// whose face already exists only bumps that face's update time.
    /// Fails with `Disabled` when face recognition is turned off.
    pub fn cluster(&self, opts: FacesOptions) -> Result<Vec<Face>> {
        if self.disabled() {
            return Err(FacesError::Disabled);
        }
        let mut added = Vec::new();

        let tuning = self.tuning();
        let threshold = opts.sample_threshold(tuning);

        if opts.force {
            tracing::info!("faces: enforced clustering");
        } else {
            let n = self.store.count_new_face_markers(tuning)?;
            if n < threshold {
                tracing::debug!("faces: skipped clustering, {} new markers", n);
                return Ok(added);
            }
        }

        let embeddings = self.store.unclustered_embeddings(tuning)?;
        tracing::debug!("faces: found {} unclustered samples", embeddings.len());
        if embeddings.len() < threshold.max(1) {
            tracing::debug!("faces: at least {} samples needed for clustering", threshold);
            return Ok(added);
        }

        let mut dbscan = Dbscan::new(
            tuning.cluster_core,
            tuning.cluster_dist,
            self.config.workers,
            batch_euclidean_distance,
        )?;
        let data: Vec<Vec<f32>> = embeddings.iter().map(|e| e.as_slice().to_vec()).collect();
        dbscan.learn(&data)?;

        let sizes = dbscan.sizes();
        if sizes.is_empty() {
            tracing::debug!("faces: found no new clusters");
            return Ok(added);
        }
        tracing::info!("faces: found {} new clusters", sizes.len());

        let mut groups: Vec<Vec<_>> = sizes.iter().map(|n| Vec::with_capacity(*n)).collect();
        for (e, &guess) in embeddings.into_iter().zip(dbscan.guesses()) {
            if guess < 1 {
                continue;
            }
            if let Some(g) = groups.get_mut(guess as usize - 1) {
                g.push(e);
            }
        }

        for group in groups {
            if group.len() < tuning.cluster_min_size {
                continue;
            }
            let samples = Embeddings::from_vec(group)?;
            let Some(face) = Face::new(None, Source::Auto, &samples, tuning) else {
                continue;
            };
            if face.unsuitable {
                tracing::info!("faces: skipped cluster {}, embedding not distinct enough", face.id);
                continue;
            }

            if self.store.create_face(&face)? {
                tracing::debug!(
                    "faces: added cluster {} based on {} samples, radius {}",
                    face.id,
                    face.samples,
                    face.sample_radius
                );
                added.push(face);
            } else {
                self.store.update_face(&face.id, |_| true)?;
                tracing::debug!("faces: updated cluster {}", face.id);
            }
        }

        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::FacesConfig;
    use crate::marker::{Area, Marker};
    use crate::store::FaceStore;

    fn worker() -> Faces {
        let mut config = FacesConfig::default();
        config.workers = 2;
        config.tuning.cluster_min_size = 3;
        Faces::new(Arc::new(FaceStore::in_memory()), config)
    }

    fn add_marker(w: &Faces, x: f32, y: f32) {
        let e = Embeddings::from_rows(vec![vec![x, y]]).unwrap();
        let m = Marker::new_face("f1", Source::Image, Area::new(0.1, 0.1, 0.2, 0.2), 100, 40, &e)
            .unwrap();
        w.store().create_marker(&m).unwrap();
    }

    #[test]
    fn below_threshold_skips() {
        let w = worker();
        for i in 0..4 {
            add_marker(&w, 0.01 * i as f32, 0.0);
        }
        let opts = FacesOptions::default();
        assert!(w.cluster(opts).unwrap().is_empty());
        assert!(w.store().faces().unwrap().is_empty());
    }

    #[test]
    fn dense_groups_become_faces() {
        let w = worker();
        for i in 0..6 {
            add_marker(&w, 0.01 * i as f32, 0.0);
            add_marker(&w, 10.0 + 0.01 * i as f32, 10.0);
        }
        add_marker(&w, 50.0, -50.0);

        let added = w.cluster(FacesOptions::default()).unwrap();
        assert_eq!(added.len(), 2);
        assert!(added.iter().all(|f| f.samples == 6 && f.face_src == Source::Auto));

        let again = w
            .cluster(FacesOptions {
                force: true,
                ..FacesOptions::default()
            })
            .unwrap();
        assert!(again.is_empty(), "recurring clusters map to existing faces");
        assert_eq!(w.store().faces().unwrap().len(), 2);
    }
}
