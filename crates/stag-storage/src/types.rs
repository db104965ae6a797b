// SPDX-License-Identifier: PMPL-1.0-or-later
//
// The stag spatial data model.
//
// Events arrive on the wire with an `event_type` string and at most one of
// several optional payload fields (`mesh_data`, `pose`, `camera_data`, ...).
// Internally the payload is a tagged sum ([`EventPayload`]); the string
// discriminator only exists at the serde boundary, where mirror structs map
// between the two shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form string-keyed metadata carried by events, anchors and graphs.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Rigid pose plus scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: [f64; 3],
    /// Unit quaternion [x, y, z, w].
    pub rotation: [f64; 4],
    pub scale: [f64; 3],
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
        }
    }
}

/// Triangle mesh geometry reported by a client device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    #[serde(default)]
    pub anchor_id: String,
    /// Flat [x, y, z, x, y, z, ...]; length is a multiple of 3.
    pub vertices: Vec<f64>,
    /// Flat triangle indices; length is a multiple of 3.
    pub faces: Vec<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub normals: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colors: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub texture_coords: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub classification: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Device pose sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseData {
    pub transform: Option<Transform>,
    #[serde(default)]
    pub velocity: [f64; 3],
    #[serde(default)]
    pub acceleration: [f64; 3],
    #[serde(default)]
    pub angular_velocity: [f64; 3],
    #[serde(default)]
    pub confidence: f64,
}

/// Camera frame. The image bytes are opaque to the core and are
/// base64-encoded when the outer transport is textual JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraData {
    #[serde(default, with = "base64_bytes")]
    pub image_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: String,
    /// Row-major 3x3 intrinsic matrix.
    pub intrinsics: [f64; 9],
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distortion: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exposure: f64,
    #[serde(default)]
    pub iso: u32,
    #[serde(default)]
    pub focal_length: f64,
}

/// Depth map sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthData {
    pub data: Vec<f64>,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confidence: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default)]
    pub min_range: f64,
    #[serde(default)]
    pub max_range: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Unstructured point cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudData {
    /// Flat [x, y, z, x, y, z, ...]; length is a multiple of 3.
    pub points: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colors: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub normals: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confidence: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Environmental lighting probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingData {
    pub ambient_intensity: f64,
    pub directional_light: [f64; 3],
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spherical_harmonics: Vec<f64>,
    #[serde(default)]
    pub color_temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// The payload variants a spatial event can carry, exactly one per event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Mesh(MeshData),
    Pose(PoseData),
    Camera(CameraData),
    Depth(DepthData),
    PointCloud(PointCloudData),
    Lighting(LightingData),
}

impl EventPayload {
    /// The kind tag for this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Mesh(_) => EventKind::Mesh,
            EventPayload::Pose(_) => EventKind::Pose,
            EventPayload::Camera(_) => EventKind::Camera,
            EventPayload::Depth(_) => EventKind::Depth,
            EventPayload::PointCloud(_) => EventKind::PointCloud,
            EventPayload::Lighting(_) => EventKind::Lighting,
        }
    }

    /// The mesh payload, if this is a mesh.
    pub fn as_mesh(&self) -> Option<&MeshData> {
        match self {
            EventPayload::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }
}

/// Event kind derived from the wire-level `event_type` string.
///
/// Unknown strings map to [`EventKind::Generic`]; they are stored, not
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Mesh,
    Pose,
    Camera,
    Depth,
    PointCloud,
    Lighting,
    Generic,
}

impl EventKind {
    /// Map a wire-level `event_type` string to its kind.
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "mesh" => EventKind::Mesh,
            "pose" => EventKind::Pose,
            "camera" => EventKind::Camera,
            "depth" => EventKind::Depth,
            "pointCloud" => EventKind::PointCloud,
            "lighting" => EventKind::Lighting,
            _ => EventKind::Generic,
        }
    }
}

/// Relay/engine bookkeeping attached to events and batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Wall-clock processing duration in nanoseconds.
    #[serde(default)]
    pub processing_time: u64,
    #[serde(default)]
    pub relay: String,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// One spatial event as received from a client device.
///
/// `payload` is `None` when the wire message did not carry the variant named
/// by `event_type` (or when `event_type` is unrecognised); the engine decides
/// whether that is an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawSpatialEvent", into = "RawSpatialEvent")]
pub struct SpatialEvent {
    pub event_id: String,
    pub event_type: String,
    /// Client-side capture timestamp.
    pub timestamp: DateTime<Utc>,
    pub server_timestamp: Option<DateTime<Utc>>,
    pub session_id: String,
    pub client_id: String,
    pub device_id: String,
    pub frame_number: u64,
    pub transform: Option<Transform>,
    pub payload: Option<EventPayload>,
    pub metadata: Metadata,
    pub processing_info: ProcessingInfo,
}

impl SpatialEvent {
    /// The kind this event declares via its `event_type` string.
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }
}

/// Wire shape of a [`SpatialEvent`]: the payload sum spread across optional
/// named fields, selected by `event_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawSpatialEvent {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    event_type: String,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    frame_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pose: Option<PoseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mesh_data: Option<MeshData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    camera_data: Option<CameraData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth_data: Option<DepthData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    point_cloud_data: Option<PointCloudData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lighting_data: Option<LightingData>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    processing_info: ProcessingInfo,
}

impl From<RawSpatialEvent> for SpatialEvent {
    fn from(raw: RawSpatialEvent) -> Self {
        let payload = match EventKind::from_type(&raw.event_type) {
            EventKind::Mesh => raw.mesh_data.map(EventPayload::Mesh),
            EventKind::Pose => raw.pose.map(EventPayload::Pose),
            EventKind::Camera => raw.camera_data.map(EventPayload::Camera),
            EventKind::Depth => raw.depth_data.map(EventPayload::Depth),
            EventKind::PointCloud => raw.point_cloud_data.map(EventPayload::PointCloud),
            EventKind::Lighting => raw.lighting_data.map(EventPayload::Lighting),
            EventKind::Generic => None,
        };

        Self {
            event_id: raw.event_id,
            event_type: raw.event_type,
            timestamp: raw.timestamp,
            server_timestamp: raw.server_timestamp,
            session_id: raw.session_id,
            client_id: raw.client_id,
            device_id: raw.device_id,
            frame_number: raw.frame_number,
            transform: raw.transform,
            payload,
            metadata: raw.metadata,
            processing_info: raw.processing_info,
        }
    }
}

impl From<SpatialEvent> for RawSpatialEvent {
    fn from(event: SpatialEvent) -> Self {
        let mut raw = RawSpatialEvent {
            event_id: event.event_id,
            event_type: event.event_type,
            timestamp: event.timestamp,
            server_timestamp: event.server_timestamp,
            session_id: event.session_id,
            client_id: event.client_id,
            device_id: event.device_id,
            frame_number: event.frame_number,
            transform: event.transform,
            pose: None,
            mesh_data: None,
            camera_data: None,
            depth_data: None,
            point_cloud_data: None,
            lighting_data: None,
            metadata: event.metadata,
            processing_info: event.processing_info,
        };
        match event.payload {
            Some(EventPayload::Mesh(mesh)) => raw.mesh_data = Some(mesh),
            Some(EventPayload::Pose(pose)) => raw.pose = Some(pose),
            Some(EventPayload::Camera(camera)) => raw.camera_data = Some(camera),
            Some(EventPayload::Depth(depth)) => raw.depth_data = Some(depth),
            Some(EventPayload::PointCloud(points)) => raw.point_cloud_data = Some(points),
            Some(EventPayload::Lighting(lighting)) => raw.lighting_data = Some(lighting),
            None => {}
        }
        raw
    }
}

/// How a version changed its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    /// Reserved: accepted and stored, but no event path produces it.
    Delete,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Create => write!(f, "create"),
            ChangeType::Update => write!(f, "update"),
            ChangeType::Delete => write!(f, "delete"),
        }
    }
}

/// An immutable snapshot of an anchor's payload and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawAnchorVersion", into = "RawAnchorVersion")]
pub struct AnchorVersion {
    /// Engine-assigned, strictly monotone per anchor; sorts in insertion
    /// order.
    pub version_id: String,
    /// Hex content fingerprint of the originating event.
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub change_type: ChangeType,
    pub transform: Option<Transform>,
    pub payload: Option<EventPayload>,
    pub event_id: String,
    pub session_id: String,
    pub client_id: String,
    pub device_id: String,
    pub frame_number: u64,
    pub metadata: Metadata,
}

/// Wire/record shape of an [`AnchorVersion`]. Unlike events there is no
/// discriminator string; exactly one payload field is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawAnchorVersion {
    #[serde(default)]
    version_id: String,
    #[serde(default)]
    hash: String,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transform: Option<Transform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mesh_data: Option<MeshData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pose_data: Option<PoseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    camera_data: Option<CameraData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth_data: Option<DepthData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    point_cloud_data: Option<PointCloudData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lighting_data: Option<LightingData>,
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    frame_number: u64,
    #[serde(default)]
    metadata: Metadata,
}

impl From<RawAnchorVersion> for AnchorVersion {
    fn from(raw: RawAnchorVersion) -> Self {
        let payload = raw
            .mesh_data
            .map(EventPayload::Mesh)
            .or(raw.pose_data.map(EventPayload::Pose))
            .or(raw.camera_data.map(EventPayload::Camera))
            .or(raw.depth_data.map(EventPayload::Depth))
            .or(raw.point_cloud_data.map(EventPayload::PointCloud))
            .or(raw.lighting_data.map(EventPayload::Lighting));

        Self {
            version_id: raw.version_id,
            hash: raw.hash,
            timestamp: raw.timestamp,
            change_type: raw.change_type,
            transform: raw.transform,
            payload,
            event_id: raw.event_id,
            session_id: raw.session_id,
            client_id: raw.client_id,
            device_id: raw.device_id,
            frame_number: raw.frame_number,
            metadata: raw.metadata,
        }
    }
}

impl From<AnchorVersion> for RawAnchorVersion {
    fn from(version: AnchorVersion) -> Self {
        let mut raw = RawAnchorVersion {
            version_id: version.version_id,
            hash: version.hash,
            timestamp: version.timestamp,
            change_type: version.change_type,
            transform: version.transform,
            mesh_data: None,
            pose_data: None,
            camera_data: None,
            depth_data: None,
            point_cloud_data: None,
            lighting_data: None,
            event_id: version.event_id,
            session_id: version.session_id,
            client_id: version.client_id,
            device_id: version.device_id,
            frame_number: version.frame_number,
            metadata: version.metadata,
        };
        match version.payload {
            Some(EventPayload::Mesh(mesh)) => raw.mesh_data = Some(mesh),
            Some(EventPayload::Pose(pose)) => raw.pose_data = Some(pose),
            Some(EventPayload::Camera(camera)) => raw.camera_data = Some(camera),
            Some(EventPayload::Depth(depth)) => raw.depth_data = Some(depth),
            Some(EventPayload::PointCloud(points)) => raw.point_cloud_data = Some(points),
            Some(EventPayload::Lighting(lighting)) => raw.lighting_data = Some(lighting),
            None => {}
        }
        raw
    }
}

/// Mutable head of a version chain.
///
/// The persisted record carries only the head fields; `versions` is
/// materialised by the store at read time and skipped on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub id: String,
    pub graph_id: String,
    /// Hash of the newest accepted version.
    pub current_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<AnchorVersion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_session_id: String,
    #[serde(default)]
    pub last_client_id: String,
    #[serde(default)]
    pub last_device_id: String,
    /// Count of versions appended so far; the next version id is derived
    /// from this, keeping ids strictly monotone per anchor.
    #[serde(default)]
    pub version_seq: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Per-graph statistics, updated transactionally with every accepted event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    #[serde(default)]
    pub anchor_count: u64,
    #[serde(default)]
    pub version_count: u64,
    /// Events that produced a version; dedup-skipped events do not count.
    #[serde(default)]
    pub event_count: u64,
    #[serde(default)]
    pub session_count: u64,
    #[serde(default)]
    pub client_count: u64,
    #[serde(default)]
    pub device_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data_size: u64,
}

/// A versioned spatial-object container, correlated 1:1 with a client
/// session.
///
/// The persisted record carries no anchor bodies; `anchors` is materialised
/// at read time by prefix scan and skipped on write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialGraph {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub anchors: BTreeMap<String, Anchor>,
    #[serde(default)]
    pub stats: GraphStats,
    /// Also memoises the distinct session/client/device id sets so
    /// cardinality stats update in O(1).
    #[serde(default)]
    pub metadata: Metadata,
}

/// Process-wide totals across all graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub graph_count: u64,
    #[serde(default)]
    pub anchor_count: u64,
    #[serde(default)]
    pub version_count: u64,
    #[serde(default)]
    pub event_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ingest_time: Option<DateTime<Utc>>,
    /// Snapshot of the database file size in bytes.
    #[serde(default)]
    pub database_size: u64,
}

impl SystemStats {
    /// Fresh zeroed stats for a store opened at `start_time`.
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            graph_count: 0,
            anchor_count: 0,
            version_count: 0,
            event_count: 0,
            last_ingest_time: None,
            database_size: 0,
        }
    }
}

/// One page of an anchor's version chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorHistory {
    pub anchor_id: String,
    pub graph_id: String,
    pub versions: Vec<AnchorVersion>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// A group of events accepted together at ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestBatch {
    #[serde(default)]
    pub batch_id: String,
    pub events: Vec<SpatialEvent>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub relay_id: String,
    #[serde(default)]
    pub processing_info: ProcessingInfo,
}

/// Acknowledgement for an ingest batch. `processed` is the count queued,
/// not the count committed; `queued = true` signals asynchronous acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestAck {
    pub batch_id: String,
    pub processed: usize,
    pub errors: usize,
    pub queued: bool,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh_event_json() -> serde_json::Value {
        serde_json::json!({
            "event_id": "e-1",
            "event_type": "mesh",
            "timestamp": "2026-01-02T03:04:05Z",
            "session_id": "S1",
            "client_id": "C1",
            "device_id": "D1",
            "frame_number": 7,
            "mesh_data": {
                "anchor_id": "A",
                "vertices": [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                "faces": [0, 1, 2],
                "classification": "wall",
                "confidence": 0.9
            },
            "metadata": {}
        })
    }

    #[test]
    fn test_event_payload_selected_by_type() {
        let event: SpatialEvent = serde_json::from_value(mesh_event_json()).unwrap();
        assert_eq!(event.kind(), EventKind::Mesh);
        let mesh = event.payload.as_ref().and_then(|p| p.as_mesh()).unwrap();
        assert_eq!(mesh.anchor_id, "A");
        assert_eq!(mesh.vertices.len(), 9);
        assert_eq!(mesh.faces, vec![0, 1, 2]);
    }

    #[test]
    fn test_event_missing_payload_is_representable() {
        let mut json = mesh_event_json();
        json.as_object_mut().unwrap().remove("mesh_data");
        let event: SpatialEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.kind(), EventKind::Mesh);
        assert!(event.payload.is_none());
    }

    #[test]
    fn test_mismatched_payload_field_ignored() {
        // A pose event carrying only mesh_data has no usable payload.
        let mut json = mesh_event_json();
        json["event_type"] = "pose".into();
        let event: SpatialEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.kind(), EventKind::Pose);
        assert!(event.payload.is_none());
    }

    #[test]
    fn test_unknown_event_type_is_generic() {
        let mut json = mesh_event_json();
        json["event_type"] = "hologram".into();
        let event: SpatialEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.kind(), EventKind::Generic);
        assert!(event.payload.is_none());
    }

    #[test]
    fn test_event_round_trip_keeps_wire_field_names() {
        let event: SpatialEvent = serde_json::from_value(mesh_event_json()).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("mesh_data").is_some());
        assert!(json.get("pose").is_none());
        assert_eq!(json["event_type"], "mesh");
    }

    #[test]
    fn test_camera_image_data_base64() {
        let camera = CameraData {
            image_data: vec![0xDE, 0xAD, 0xBE, 0xEF],
            width: 2,
            height: 2,
            format: "rgba8".to_string(),
            intrinsics: [1.0; 9],
            distortion: Vec::new(),
            transform: None,
            timestamp: None,
            exposure: 0.0,
            iso: 0,
            focal_length: 0.0,
        };
        let json = serde_json::to_value(&camera).unwrap();
        assert_eq!(json["image_data"], "3q2+7w==");

        let back: CameraData = serde_json::from_value(json).unwrap();
        assert_eq!(back.image_data, camera.image_data);
    }

    #[test]
    fn test_change_type_serde_lowercase() {
        assert_eq!(serde_json::to_value(ChangeType::Create).unwrap(), "create");
        assert_eq!(serde_json::to_value(ChangeType::Update).unwrap(), "update");
        assert_eq!(serde_json::to_value(ChangeType::Delete).unwrap(), "delete");
        let parsed: ChangeType = serde_json::from_value("delete".into()).unwrap();
        assert_eq!(parsed, ChangeType::Delete);
    }

    #[test]
    fn test_version_round_trip_including_delete() {
        let version = AnchorVersion {
            version_id: "v0000000003".to_string(),
            hash: "abc123".to_string(),
            timestamp: Utc::now(),
            change_type: ChangeType::Delete,
            transform: None,
            payload: Some(EventPayload::Pose(PoseData {
                transform: Some(Transform::default()),
                velocity: [0.1, 0.2, 0.3],
                acceleration: [0.0; 3],
                angular_velocity: [0.0; 3],
                confidence: 1.0,
            })),
            event_id: "e-9".to_string(),
            session_id: "S1".to_string(),
            client_id: "C1".to_string(),
            device_id: "D1".to_string(),
            frame_number: 42,
            metadata: Metadata::new(),
        };

        let json = serde_json::to_value(&version).unwrap();
        assert!(json.get("pose_data").is_some());
        let back: AnchorVersion = serde_json::from_value(json).unwrap();
        assert_eq!(back.change_type, ChangeType::Delete);
        assert_eq!(back.version_id, version.version_id);
        assert!(matches!(back.payload, Some(EventPayload::Pose(_))));
    }

    #[test]
    fn test_graph_record_skips_empty_anchor_map() {
        let graph = SpatialGraph {
            id: "S1".to_string(),
            name: "Session S1".to_string(),
            description: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            anchors: BTreeMap::new(),
            stats: GraphStats::default(),
            metadata: Metadata::new(),
        };
        let json = serde_json::to_value(&graph).unwrap();
        assert!(json.get("anchors").is_none());
    }
}
