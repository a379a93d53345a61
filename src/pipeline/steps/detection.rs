//! Video Intelligence detection steps: shots, labels, people, faces.
//!
//! Each step requires the cloud-upload step's `gcsUri` and calls the
//! annotation service synchronously (the client waits out the long-running
//! operation). Parsing trims the verbose API payloads down to what the UI
//! and the agent actually consume.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::error::{AppError, Result};
use crate::pipeline::registry::StepRunner;
use crate::pipeline::types::{metadata_map, PipelineContext, PipelineResult};
use crate::pipeline::PipelineDeps;
use crate::services::video_intelligence::{offset_seconds, VideoFeature};

const MAX_SEGMENT_LABELS: usize = 50;
const MAX_SHOT_LABELS: usize = 50;
const MAX_FRAME_LABELS: usize = 30;
const MAX_PERSON_TRACKS: usize = 50;

async fn upload_uri_for(deps: &PipelineDeps, ctx: &PipelineContext, what: &str) -> Result<String> {
    let state = deps.state.get(&ctx.user_id, &ctx.project_id, &ctx.asset.id).await?;
    super::upload_gcs_uri(&state)
        .ok_or_else(|| AppError::Validation(format!("cloud upload must complete before {what}")))
}

fn values<'a>(payload: &'a Value, key: &str) -> &'a [Value] {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|a| a.as_slice())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Shot detection

pub struct ShotDetectionStep {
    deps: Arc<PipelineDeps>,
}

impl ShotDetectionStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

/// Flatten `shotAnnotations` into `{index, start, end, duration}` entries.
pub fn parse_shots(results: &Value) -> Vec<Value> {
    values(results, "shotAnnotations")
        .iter()
        .enumerate()
        .map(|(index, shot)| {
            let start = offset_seconds(shot.get("startTimeOffset"));
            let end = offset_seconds(shot.get("endTimeOffset"));
            json!({
                "index": index,
                "start": start,
                "end": end,
                "duration": (end - start).max(0.0),
            })
        })
        .collect()
}

#[async_trait]
impl StepRunner for ShotDetectionStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        let gcs_uri = upload_uri_for(&self.deps, ctx, "shot detection").await?;
        let results = self
            .deps
            .annotator
            .annotate(&gcs_uri, VideoFeature::ShotChangeDetection)
            .await?;

        let shots = parse_shots(&results);
        info!(asset_id = %ctx.asset.id, shots = shots.len(), "shot detection complete");

        Ok(PipelineResult::succeeded(metadata_map([
            ("shotCount", json!(shots.len())),
            ("shots", json!(shots)),
            ("gcsUri", json!(gcs_uri)),
        ])))
    }
}

// ---------------------------------------------------------------------------
// Label detection

pub struct LabelDetectionStep {
    deps: Arc<PipelineDeps>,
}

impl LabelDetectionStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

fn parse_entity(entity: Option<&Value>) -> Value {
    let get = |key: &str, default: &str| -> String {
        entity
            .and_then(|e| e.get(key))
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    };
    json!({
        "entityId": get("entityId", ""),
        "description": get("description", ""),
        "languageCode": get("languageCode", "en"),
    })
}

/// Parse one label annotation: entity, categories, scored segments.
pub fn parse_label_annotation(annotation: &Value) -> Value {
    let entity = parse_entity(annotation.get("entity"));
    let categories: Vec<Value> = values(annotation, "categoryEntities")
        .iter()
        .map(|c| parse_entity(Some(c)))
        .collect();

    let mut max_confidence: f64 = 0.0;
    let segments: Vec<Value> = values(annotation, "segments")
        .iter()
        .map(|seg| {
            let confidence = seg.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
            max_confidence = max_confidence.max(confidence);
            json!({
                "start": offset_seconds(seg.pointer("/segment/startTimeOffset")),
                "end": offset_seconds(seg.pointer("/segment/endTimeOffset")),
                "confidence": confidence,
            })
        })
        .collect();

    json!({
        "entity": entity,
        "categories": categories,
        "segments": segments,
        "confidence": max_confidence,
    })
}

/// Frame-level labels deduplicated by description.
pub fn parse_frame_labels(annotations: &[Value]) -> Vec<Value> {
    let mut by_description: Map<String, Value> = Map::new();

    for annotation in annotations {
        let entity = parse_entity(annotation.get("entity"));
        let description = entity["description"].as_str().unwrap_or("").to_string();
        if description.is_empty() {
            continue;
        }

        let frames: Vec<Value> = values(annotation, "frames")
            .iter()
            .map(|frame| {
                json!({
                    "time": offset_seconds(frame.get("timeOffset")),
                    "confidence": frame.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
                })
            })
            .collect();

        by_description.insert(description, json!({"entity": entity, "frames": frames}));
    }

    by_description.into_iter().map(|(_, v)| v).collect()
}

fn sorted_by_confidence(mut labels: Vec<Value>) -> Vec<Value> {
    labels.sort_by(|a, b| {
        let ca = a.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        let cb = b.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        cb.partial_cmp(&ca).unwrap_or(std::cmp::Ordering::Equal)
    });
    labels
}

#[async_trait]
impl StepRunner for LabelDetectionStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        let gcs_uri = upload_uri_for(&self.deps, ctx, "label detection").await?;
        let results = self
            .deps
            .annotator
            .annotate(&gcs_uri, VideoFeature::LabelDetection)
            .await?;

        let segment_labels = sorted_by_confidence(
            values(&results, "segmentLabelAnnotations")
                .iter()
                .map(parse_label_annotation)
                .collect(),
        );
        let shot_labels = sorted_by_confidence(
            values(&results, "shotLabelAnnotations")
                .iter()
                .map(parse_label_annotation)
                .collect(),
        );
        let frame_labels = parse_frame_labels(values(&results, "frameLabelAnnotations"));

        info!(
            asset_id = %ctx.asset.id,
            segment_labels = segment_labels.len(),
            shot_labels = shot_labels.len(),
            "label detection complete"
        );

        Ok(PipelineResult::succeeded(metadata_map([
            ("segmentLabelCount", json!(segment_labels.len())),
            ("shotLabelCount", json!(shot_labels.len())),
            ("frameLabelCount", json!(frame_labels.len())),
            (
                "segmentLabels",
                json!(segment_labels.into_iter().take(MAX_SEGMENT_LABELS).collect::<Vec<_>>()),
            ),
            (
                "shotLabels",
                json!(shot_labels.into_iter().take(MAX_SHOT_LABELS).collect::<Vec<_>>()),
            ),
            (
                "frameLabels",
                json!(frame_labels.into_iter().take(MAX_FRAME_LABELS).collect::<Vec<_>>()),
            ),
            ("gcsUri", json!(gcs_uri)),
        ])))
    }
}

// ---------------------------------------------------------------------------
// Face detection

pub struct FaceDetectionStep {
    deps: Arc<PipelineDeps>,
}

impl FaceDetectionStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

fn parse_bounding_box(bbox: Option<&Value>) -> Value {
    let side = |key: &str| -> f64 {
        bbox.and_then(|b| b.get(key)).and_then(Value::as_f64).unwrap_or(0.0)
    };
    json!({
        "left": side("left"),
        "top": side("top"),
        "right": side("right"),
        "bottom": side("bottom"),
    })
}

/// Summarise one face annotation: attributes, track segments, timestamped
/// boxes, and the first appearance.
pub fn parse_face_annotation(annotation: &Value, index: usize) -> Value {
    let tracks = values(annotation, "tracks");

    let attributes: Vec<String> = tracks
        .first()
        .map(|track| values(track, "timestampedObjects"))
        .and_then(|objects| objects.first())
        .map(|object| {
            values(object, "attributes")
                .iter()
                .filter_map(|attr| attr.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut boxes: Vec<Value> = Vec::new();
    for track in tracks {
        for object in values(track, "timestampedObjects") {
            if let Some(bbox) = object.get("normalizedBoundingBox") {
                boxes.push(json!({
                    "time": offset_seconds(object.get("timeOffset")),
                    "boundingBox": parse_bounding_box(Some(bbox)),
                }));
            }
        }
    }

    let segments: Vec<Value> = tracks
        .iter()
        .filter_map(|track| track.get("segment"))
        .map(|segment| {
            json!({
                "start": offset_seconds(segment.get("startTimeOffset")),
                "end": offset_seconds(segment.get("endTimeOffset")),
            })
        })
        .collect();

    let first = boxes.first().cloned();
    json!({
        "faceIndex": index,
        "trackCount": tracks.len(),
        "attributes": attributes,
        "segments": segments,
        "timestampedBoxes": boxes,
        "firstAppearance": first,
    })
}

#[async_trait]
impl StepRunner for FaceDetectionStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        // Long clips are skipped to keep the remote operation inside its
        // timeout budget.
        let max_duration = self.deps.config.face_detection_max_duration_secs as f64;
        let state = self
            .deps
            .state
            .get(&ctx.user_id, &ctx.project_id, &ctx.asset.id)
            .await?;
        if let Some(duration) = super::known_duration(ctx.asset.duration, &state) {
            if duration > max_duration {
                info!(asset_id = %ctx.asset.id, duration, "clip too long for face detection");
                return Ok(PipelineResult::succeeded(metadata_map([
                    ("skipped", json!(true)),
                    ("reason", json!("duration_exceeds_limit")),
                    ("duration", json!(duration)),
                    ("maxDuration", json!(max_duration)),
                ])));
            }
        }

        let gcs_uri = super::upload_gcs_uri(&state).ok_or_else(|| {
            AppError::Validation("cloud upload must complete before face detection".to_string())
        })?;

        let results = self
            .deps
            .annotator
            .annotate(&gcs_uri, VideoFeature::FaceDetection)
            .await?;

        let faces: Vec<Value> = values(&results, "faceDetectionAnnotations")
            .iter()
            .enumerate()
            .map(|(i, annotation)| parse_face_annotation(annotation, i))
            .collect();

        info!(asset_id = %ctx.asset.id, faces = faces.len(), "face detection complete");

        Ok(PipelineResult::succeeded(metadata_map([
            ("faceCount", json!(faces.len())),
            ("faces", json!(faces)),
            ("gcsUri", json!(gcs_uri)),
        ])))
    }
}

// ---------------------------------------------------------------------------
// Person detection

pub struct PersonDetectionStep {
    deps: Arc<PipelineDeps>,
}

impl PersonDetectionStep {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }
}

fn parse_timestamped_object(object: &Value) -> Value {
    let landmarks: Vec<Value> = values(object, "landmarks")
        .iter()
        .map(|lm| {
            json!({
                "name": lm.get("name").and_then(Value::as_str).unwrap_or(""),
                "x": lm.pointer("/point/x").and_then(Value::as_f64).unwrap_or(0.0),
                "y": lm.pointer("/point/y").and_then(Value::as_f64).unwrap_or(0.0),
                "confidence": lm.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
            })
        })
        .collect();

    let attributes: Vec<Value> = values(object, "attributes")
        .iter()
        .map(|attr| {
            json!({
                "name": attr.get("name").and_then(Value::as_str).unwrap_or(""),
                "value": attr.get("value").and_then(Value::as_str).unwrap_or(""),
                "confidence": attr.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
            })
        })
        .collect();

    json!({
        "time": offset_seconds(object.get("timeOffset")),
        "boundingBox": parse_bounding_box(object.get("normalizedBoundingBox")),
        "landmarks": landmarks,
        "attributes": attributes,
    })
}

/// Flatten person annotations into per-track entries sorted by start time.
pub fn parse_people(results: &Value) -> Vec<Value> {
    let mut people: Vec<Value> = Vec::new();

    for annotation in values(results, "personDetectionAnnotations") {
        for track in values(annotation, "tracks") {
            let objects: Vec<Value> = values(track, "timestampedObjects")
                .iter()
                .map(parse_timestamped_object)
                .collect();
            let first = objects.first().cloned();

            people.push(json!({
                "personIndex": people.len(),
                "startTime": offset_seconds(track.pointer("/segment/startTimeOffset")),
                "endTime": offset_seconds(track.pointer("/segment/endTimeOffset")),
                "confidence": track.get("confidence").and_then(Value::as_f64).unwrap_or(0.0),
                "timestampedObjects": objects,
                "firstAppearance": first,
            }));
        }
    }

    people.sort_by(|a, b| {
        let sa = a.get("startTime").and_then(Value::as_f64).unwrap_or(0.0);
        let sb = b.get("startTime").and_then(Value::as_f64).unwrap_or(0.0);
        sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
    });
    people
}

/// Distinct attribute values seen across all tracks.
pub fn summarise_attributes(people: &[Value]) -> Vec<Value> {
    let mut by_name: Map<String, Value> = Map::new();

    for person in people {
        for object in values(person, "timestampedObjects") {
            for attr in values(object, "attributes") {
                let name = attr.get("name").and_then(Value::as_str).unwrap_or("");
                let value = attr.get("value").and_then(Value::as_str).unwrap_or("");
                if name.is_empty() {
                    continue;
                }
                let entry = by_name
                    .entry(name.to_string())
                    .or_insert_with(|| json!([]));
                if let Some(items) = entry.as_array_mut() {
                    if !value.is_empty() && !items.iter().any(|v| v == value) {
                        items.push(json!(value));
                    }
                }
            }
        }
    }

    by_name
        .into_iter()
        .map(|(name, vals)| json!({"name": name, "values": vals}))
        .collect()
}

#[async_trait]
impl StepRunner for PersonDetectionStep {
    async fn run(&self, ctx: &PipelineContext) -> Result<PipelineResult> {
        let gcs_uri = upload_uri_for(&self.deps, ctx, "person detection").await?;
        let results = self
            .deps
            .annotator
            .annotate(&gcs_uri, VideoFeature::PersonDetection)
            .await?;

        let people = parse_people(&results);
        let attribute_summary = summarise_attributes(&people);

        info!(asset_id = %ctx.asset.id, people = people.len(), "person detection complete");

        Ok(PipelineResult::succeeded(metadata_map([
            ("personCount", json!(people.len())),
            (
                "people",
                json!(people.into_iter().take(MAX_PERSON_TRACKS).collect::<Vec<_>>()),
            ),
            ("attributeSummary", json!(attribute_summary)),
            ("gcsUri", json!(gcs_uri)),
        ])))
    }
}
