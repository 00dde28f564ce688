//! Known-face store for the recognition overlay.
//!
//! Embeddings come from an [`Embedder`]; this module only keeps them and
//! matches new ones against them.

use std::{collections::BTreeMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::video::Image;

/// Name given to faces that match nobody in the store.
pub const UNKNOWN: &str = "unknown";

/// Where a face is in an image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceLocation {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

/// Finds faces in an image and computes an embedding for each one.
pub trait Embedder {
    fn embed(&mut self, image: &Image) -> anyhow::Result<Vec<(FaceLocation, Vec<f32>)>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identified {
    pub name: String,
    pub location: FaceLocation,
    /// Mean distance to the matched person's embeddings. `None` when the
    /// store is empty.
    pub distance: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceEncodingStore {
    encodings: BTreeMap<String, Vec<Vec<f32>>>,
}

impl FaceEncodingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, embedding: Vec<f32>) {
        self.encodings.entry(name.into()).or_default().push(embedding);
    }

    /// Adds the first face found in `image` under `name`. Returns whether a
    /// face was found.
    pub fn encode_face(
        &mut self,
        name: &str,
        image: &Image,
        embedder: &mut impl Embedder,
    ) -> anyhow::Result<bool> {
        let faces = embedder.embed(image)?;

        match faces.into_iter().next() {
            Some((_, embedding)) => {
                self.insert(name, embedding);
                Ok(true)
            }
            None => {
                debug!("no face found for {}", name);
                Ok(false)
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.encodings.keys().map(|k| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.values().all(|e| e.is_empty())
    }

    /// Returns the closest known name and its mean distance, or
    /// [`UNKNOWN`] if nobody is within `threshold`.
    pub fn identify(&self, embedding: &[f32], threshold: f32) -> (String, Option<f32>) {
        let best = self
            .encodings
            .iter()
            .filter(|(_, known)| !known.is_empty())
            .map(|(name, known)| {
                let total: f32 = known.iter().map(|k| distance(k, embedding)).sum();
                (name, total / known.len() as f32)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((name, d)) if d <= threshold => (name.clone(), Some(d)),
            Some((_, d)) => (UNKNOWN.to_owned(), Some(d)),
            None => (UNKNOWN.to_owned(), None),
        }
    }

    /// Finds every face in `image` and labels it.
    pub fn detect(
        &self,
        image: &Image,
        embedder: &mut impl Embedder,
        threshold: f32,
    ) -> anyhow::Result<Vec<Identified>> {
        let faces = embedder.embed(image)?;

        Ok(faces
            .into_iter()
            .map(|(location, embedding)| {
                let (name, distance) = self.identify(&embedding, threshold);
                Identified {
                    name,
                    location,
                    distance,
                }
            })
            .collect())
    }

    /// Adds everything from `other`, keeping what is already here.
    pub fn merge(&mut self, other: FaceEncodingStore) {
        for (name, embeddings) in other.encodings {
            self.encodings.entry(name).or_default().extend(embeddings);
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_vec(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write face store to {}", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read face store from {}", path.display()))?;
        serde_json::from_slice(&data).context("invalid face store")
    }
}

/// Euclidean distance. Extra components in the longer vector are ignored.
fn distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::video::PixelFormat;

    struct FixedEmbedder(Vec<(FaceLocation, Vec<f32>)>);

    impl Embedder for FixedEmbedder {
        fn embed(&mut self, _: &Image) -> anyhow::Result<Vec<(FaceLocation, Vec<f32>)>> {
            Ok(self.0.clone())
        }
    }

    fn image() -> Image {
        Image {
            width: 4,
            height: 4,
            format: PixelFormat::Rgb24,
            data: Bytes::from(vec![0; 48]),
        }
    }

    const LOC: FaceLocation = FaceLocation {
        top: 0,
        right: 2,
        bottom: 2,
        left: 0,
    };

    #[test]
    fn identifies_nearest_within_threshold() {
        let mut store = FaceEncodingStore::new();
        store.insert("ada", vec![0.0, 0.0]);
        store.insert("ada", vec![0.2, 0.0]);
        store.insert("grace", vec![1.0, 1.0]);

        let (name, d) = store.identify(&[0.1, 0.0], 0.6);
        assert_eq!(name, "ada");
        assert!((d.unwrap() - 0.1).abs() < 1e-6);

        let (name, _) = store.identify(&[5.0, 5.0], 0.6);
        assert_eq!(name, UNKNOWN);
    }

    #[test]
    fn empty_store_labels_everything_unknown() {
        let store = FaceEncodingStore::new();
        let mut embedder = FixedEmbedder(vec![(LOC, vec![0.0]), (LOC, vec![1.0])]);

        let faces = store.detect(&image(), &mut embedder, 0.6).unwrap();
        assert_eq!(faces.len(), 2);
        assert!(faces.iter().all(|f| f.name == UNKNOWN && f.distance.is_none()));
    }

    #[test]
    fn encode_face_uses_first_face() {
        let mut store = FaceEncodingStore::new();

        let mut none = FixedEmbedder(vec![]);
        assert!(!store.encode_face("ada", &image(), &mut none).unwrap());
        assert!(store.is_empty());

        let mut two = FixedEmbedder(vec![(LOC, vec![1.0, 2.0]), (LOC, vec![9.0, 9.0])]);
        assert!(store.encode_face("ada", &image(), &mut two).unwrap());
        assert_eq!(store.identify(&[1.0, 2.0], 0.1).0, "ada");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");

        let mut store = FaceEncodingStore::new();
        store.insert("ada", vec![0.25, -1.5, 3.0]);
        store.insert("grace", vec![0.0; 3]);
        store.save(&path).unwrap();

        let loaded = FaceEncodingStore::load(&path).unwrap();
        assert_eq!(loaded, store);
        assert_eq!(loaded.names().collect::<Vec<_>>(), ["ada", "grace"]);

        let mut merged = loaded.clone();
        merged.merge(store);
        assert_eq!(merged.encodings["ada"].len(), 2);
    }
}
