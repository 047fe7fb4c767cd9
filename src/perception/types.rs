use serde::{Deserialize, Serialize};

/// Pixel-space box, `(x1, y1)` top-left inclusive, `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        (self.x2 as i64 - self.x1 as i64).max(0)
    }

    pub fn height(&self) -> i64 {
        (self.y2 as i64 - self.y1 as i64).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (i32, i32) {
        (
            ((self.x1 as i64 + self.x2 as i64) / 2) as i32,
            ((self.y1 as i64 + self.y2 as i64) / 2) as i32,
        )
    }

    /// True when `other` lies entirely inside `self` (edges may touch).
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }

    pub fn top_left_distance(&self, other: &BoundingBox) -> f64 {
        let dx = self.x1 as f64 - other.x1 as f64;
        let dy = self.y1 as f64 - other.y1 as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticRole {
    Action,
    Input,
    Navigation,
    Static,
}

impl SemanticRole {
    /// Role inferred from the detector's element type label.
    pub fn infer(element_type: &str) -> Self {
        let t = element_type.to_lowercase();
        if t.contains("button") {
            SemanticRole::Action
        } else if t.contains("input") || t.contains("text") {
            SemanticRole::Input
        } else if t.contains("link") {
            SemanticRole::Navigation
        } else {
            SemanticRole::Static
        }
    }
}

/// Element as reported by the external screen analyzer, before ids and
/// relations are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedElement {
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default)]
    pub text: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub clickable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub bbox: BoundingBox,
}

/// Raw output of one analyzer pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCapture {
    pub elements: Vec<DetectedElement>,
    #[serde(default)]
    pub regions: Vec<Region>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenElement {
    /// Sequential, and only meaningful within the snapshot that assigned it.
    pub id: u32,
    #[serde(rename = "type")]
    pub element_type: String,
    pub text: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub clickable: bool,
    pub semantic_role: SemanticRole,
    pub related_ids: std::collections::BTreeSet<u32>,
}

/// Encoded screenshot ready to travel as a realtime media chunk.
#[derive(Debug, Clone)]
pub struct ScreenshotResult {
    pub mime_type: String,
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
}
