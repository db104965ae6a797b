// SPDX-License-Identifier: PMPL-1.0-or-later
//! Content fingerprinting for spatial events.
//!
//! Maps a [`SpatialEvent`] to a stable 128-bit hex content hash (SHA-256
//! truncated to its first 16 bytes) used for version dedup, and meshes to a
//! coarse geometric signature used as an additional dedup filter.
//!
//! Large geometry is sampled rather than hashed in full: above 1000
//! vertices/points only every 10th triple is fed to the digest, and above
//! 1000 face indices / depth values only every 10th scalar. Two large meshes
//! differing only in non-sampled elements therefore collide; that trade-off
//! buys a bounded per-event hashing cost at ingest rates.
//!
//! Camera frames hash their dimensions, format, intrinsics and image-data
//! *length* only, never the pixel content. Two frames with identical
//! dimensions, format, byte length and intrinsics collide on hash.

use sha2::{Digest, Sha256};
use std::sync::Mutex;

use stag_storage::types::{
    CameraData, DepthData, EventPayload, LightingData, MeshData, PointCloudData, PoseData,
    SpatialEvent, Transform,
};

/// Element count above which geometry sampling kicks in.
const SAMPLE_THRESHOLD: usize = 1000;
/// Flat-array stride for sampling every 10th (x, y, z) triple.
const TRIPLE_STRIDE: usize = 30;
/// Stride for sampling every 10th scalar (face indices, depth values).
const SCALAR_STRIDE: usize = 10;

/// Reusable content hasher for spatial events.
///
/// One instance is acquired from the [`FingerprintPool`] per event; the
/// digest state is consumed by [`content_hash`](Self::content_hash) and
/// reset again on release, so a pooled instance never leaks content between
/// users.
pub struct Fingerprinter {
    hasher: Sha256,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Compute the hex content hash of an event.
    ///
    /// The byte feed is: event-type string, frame number (little-endian),
    /// the variant-specific bytes, then the top-level transform if present.
    /// The same event always yields the same hex string.
    pub fn content_hash(&mut self, event: &SpatialEvent) -> String {
        self.hasher.update(event.event_type.as_bytes());
        self.hasher.update(event.frame_number.to_le_bytes());

        match &event.payload {
            Some(EventPayload::Mesh(mesh)) => self.hash_mesh(mesh),
            Some(EventPayload::Pose(pose)) => self.hash_pose(pose),
            Some(EventPayload::Camera(camera)) => self.hash_camera(camera),
            Some(EventPayload::Depth(depth)) => self.hash_depth(depth),
            Some(EventPayload::PointCloud(points)) => self.hash_point_cloud(points),
            Some(EventPayload::Lighting(lighting)) => self.hash_lighting(lighting),
            None => {}
        }

        if let Some(transform) = &event.transform {
            self.hash_transform(transform);
        }

        let digest = self.hasher.finalize_reset();
        hex::encode(&digest[..16])
    }

    /// Clear any accumulated digest state.
    pub fn reset(&mut self) {
        self.hasher.reset();
    }

    fn write_f64(&mut self, value: f64) {
        self.hasher.update(value.to_le_bytes());
    }

    fn write_i32(&mut self, value: i32) {
        self.hasher.update(value.to_le_bytes());
    }

    fn write_f64s(&mut self, values: &[f64]) {
        for value in values {
            self.write_f64(*value);
        }
    }

    /// Feed every 10th (x, y, z) triple of a flat coordinate array.
    fn write_sampled_triples(&mut self, values: &[f64]) {
        let mut i = 0;
        while i + 2 < values.len() {
            self.write_f64(values[i]);
            self.write_f64(values[i + 1]);
            self.write_f64(values[i + 2]);
            i += TRIPLE_STRIDE;
        }
    }

    fn hash_mesh(&mut self, mesh: &MeshData) {
        self.hasher.update(mesh.anchor_id.as_bytes());
        self.write_i32(mesh.vertices.len() as i32);
        self.write_i32(mesh.faces.len() as i32);

        let vertex_count = mesh.vertices.len() / 3;
        if vertex_count > SAMPLE_THRESHOLD {
            self.write_sampled_triples(&mesh.vertices);
        } else {
            self.write_f64s(&mesh.vertices);
        }

        if mesh.faces.len() > SAMPLE_THRESHOLD {
            for index in mesh.faces.iter().step_by(SCALAR_STRIDE) {
                self.hasher.update(index.to_le_bytes());
            }
        } else {
            for index in &mesh.faces {
                self.hasher.update(index.to_le_bytes());
            }
        }

        self.hasher.update(mesh.classification.as_bytes());
        self.write_f64(mesh.confidence);
    }

    fn hash_pose(&mut self, pose: &PoseData) {
        if let Some(transform) = &pose.transform {
            self.hash_transform(transform);
        }
        self.write_f64s(&pose.velocity);
        self.write_f64s(&pose.acceleration);
        self.write_f64(pose.confidence);
    }

    fn hash_camera(&mut self, camera: &CameraData) {
        self.write_i32(camera.width as i32);
        self.write_i32(camera.height as i32);
        self.hasher.update(camera.format.as_bytes());
        // Length only; pixel content is deliberately excluded.
        self.write_i32(camera.image_data.len() as i32);
        self.write_f64s(&camera.intrinsics);
        if let Some(transform) = &camera.transform {
            self.hash_transform(transform);
        }
    }

    fn hash_depth(&mut self, depth: &DepthData) {
        self.write_i32(depth.width as i32);
        self.write_i32(depth.height as i32);
        self.write_i32(depth.data.len() as i32);

        if depth.data.len() > SAMPLE_THRESHOLD {
            for value in depth.data.iter().step_by(SCALAR_STRIDE) {
                self.write_f64(*value);
            }
        } else {
            self.write_f64s(&depth.data);
        }
    }

    fn hash_point_cloud(&mut self, points: &PointCloudData) {
        self.write_i32(points.points.len() as i32);

        let point_count = points.points.len() / 3;
        if point_count > SAMPLE_THRESHOLD {
            self.write_sampled_triples(&points.points);
        } else {
            self.write_f64s(&points.points);
        }
    }

    fn hash_lighting(&mut self, lighting: &LightingData) {
        self.write_f64(lighting.ambient_intensity);
        self.write_f64s(&lighting.directional_light);
        self.write_f64s(&lighting.spherical_harmonics);
        self.write_f64(lighting.color_temperature);
    }

    fn hash_transform(&mut self, transform: &Transform) {
        self.write_f64s(&transform.translation);
        self.write_f64s(&transform.rotation);
        self.write_f64s(&transform.scale);
    }
}

/// Coarse geometric signature of a mesh:
/// `"<anchor_id>_<vertex_count>_<face_count>_<bbox_volume_to_3dp>"`, or
/// `"empty"` for a mesh without vertices.
///
/// This is not the content hash; it is a cheaper filter applied before
/// version append so that re-uploads of the same geometry under fresh event
/// ids do not grow the chain.
pub fn geometry_signature(mesh: &MeshData) -> String {
    if mesh.vertices.is_empty() {
        return "empty".to_string();
    }

    let vertex_count = mesh.vertices.len() / 3;
    let face_count = mesh.faces.len();

    let (mut min, mut max) = (
        [mesh.vertices[0], mesh.vertices[1], mesh.vertices[2]],
        [mesh.vertices[0], mesh.vertices[1], mesh.vertices[2]],
    );
    let mut i = 0;
    while i + 2 < mesh.vertices.len() {
        for axis in 0..3 {
            let v = mesh.vertices[i + axis];
            min[axis] = min[axis].min(v);
            max[axis] = max[axis].max(v);
        }
        i += 3;
    }

    let volume = (max[0] - min[0]) * (max[1] - min[1]) * (max[2] - min[2]);
    format!("{}_{}_{}_{:.3}", mesh.anchor_id, vertex_count, face_count, volume)
}

/// Shared pool of reusable [`Fingerprinter`] instances.
///
/// Acquire grants exclusive use of one instance for the duration of a single
/// fingerprint computation; release resets the digest state before the
/// instance becomes available again.
pub struct FingerprintPool {
    pool: Mutex<Vec<Fingerprinter>>,
}

impl Default for FingerprintPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintPool {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Take a fingerprinter out of the pool, or build a fresh one if the
    /// pool is empty. The returned instance has clean digest state.
    pub fn acquire(&self) -> Fingerprinter {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .unwrap_or_default()
    }

    /// Return a fingerprinter to the pool. State is reset here, not on
    /// acquire, so content never leaks between users.
    pub fn release(&self, mut fingerprinter: Fingerprinter) {
        fingerprinter.reset();
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(fingerprinter);
    }

    /// Number of idle instances currently pooled.
    pub fn idle(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
