/// Screen context construction: turns one analyzer pass into an immutable
/// snapshot with ids, roles, containment hierarchy and proximity relations.
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::DeskPilotResult;
use crate::perception::traits::ScreenAnalyzer;
use crate::perception::types::{
    BoundingBox, RawCapture, Region, ScreenElement, SemanticRole,
};

/// Top-left corners closer than this (in px) make two elements related.
pub const RELATED_DISTANCE_PX: f64 = 100.0;

/// Height of the derived header and footer bands.
const BAND_HEIGHT: i32 = 100;

/// Elements listed per snapshot in outbound context.
const SUMMARY_ELEMENT_LIMIT: usize = 40;

#[derive(Debug, Clone, Serialize)]
pub struct ScreenContext {
    elements: Vec<ScreenElement>,
    regions: Vec<Region>,
    /// parent id -> children ids, children in id order
    hierarchy: BTreeMap<u32, Vec<u32>>,
    roots: Vec<u32>,
    captured_at: DateTime<Utc>,
}

impl ScreenContext {
    /// A snapshot with nothing on it; stands in when capture is unavailable.
    pub fn empty() -> Self {
        Self {
            elements: Vec::new(),
            regions: Vec::new(),
            hierarchy: BTreeMap::new(),
            roots: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn from_capture(raw: RawCapture) -> Self {
        let mut elements: Vec<ScreenElement> = raw
            .elements
            .into_iter()
            .enumerate()
            .map(|(idx, e)| ScreenElement {
                id: idx as u32,
                semantic_role: SemanticRole::infer(&e.element_type),
                element_type: e.element_type,
                text: e.text,
                bbox: e.bbox,
                confidence: e.confidence.clamp(0.0, 1.0),
                clickable: e.clickable,
                related_ids: BTreeSet::new(),
            })
            .collect();

        compute_relations(&mut elements);
        let parents = compute_parents(&elements);

        let mut hierarchy: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        let mut roots = Vec::new();
        for (child, parent) in elements.iter().map(|e| e.id).zip(parents) {
            match parent {
                Some(p) => hierarchy.entry(p).or_default().push(child),
                None => roots.push(child),
            }
        }

        let regions = if raw.regions.is_empty() {
            derive_regions(&elements)
        } else {
            raw.regions
        };

        tracing::debug!(
            elements = elements.len(),
            roots = roots.len(),
            regions = regions.len(),
            "screen context built"
        );

        Self {
            elements,
            regions,
            hierarchy,
            roots,
            captured_at: Utc::now(),
        }
    }

    pub fn elements(&self) -> &[ScreenElement] {
        &self.elements
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn element(&self, id: u32) -> Option<&ScreenElement> {
        // ids are assigned sequentially, so the index is the id
        self.elements.get(id as usize).filter(|e| e.id == id)
    }

    pub fn children(&self, id: u32) -> &[u32] {
        self.hierarchy.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parent(&self, id: u32) -> Option<u32> {
        self.hierarchy
            .iter()
            .find(|(_, kids)| kids.contains(&id))
            .map(|(p, _)| *p)
    }

    pub fn roots(&self) -> &[u32] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Counts only; attached to every history entry.
    pub fn summary(&self) -> ScreenSummary {
        ScreenSummary {
            captured_at: self.captured_at,
            element_count: self.elements.len(),
            clickable_count: self.elements.iter().filter(|e| e.clickable).count(),
        }
    }

    /// Compact element listing sent to the remote agent with user turns.
    pub fn digest(&self) -> ScreenDigest {
        ScreenDigest {
            summary: self.summary(),
            regions: self.regions.iter().map(|r| r.name.clone()).collect(),
            elements: self
                .elements
                .iter()
                .take(SUMMARY_ELEMENT_LIMIT)
                .map(|e| ElementBrief {
                    id: e.id,
                    element_type: e.element_type.clone(),
                    text: e.text.clone(),
                    role: e.semantic_role,
                    clickable: e.clickable,
                    center: e.bbox.center(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ScreenSummary {
    pub captured_at: DateTime<Utc>,
    pub element_count: usize,
    pub clickable_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ElementBrief {
    pub id: u32,
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub text: String,
    pub role: SemanticRole,
    pub clickable: bool,
    pub center: (i32, i32),
}

#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ScreenDigest {
    pub summary: ScreenSummary,
    pub regions: Vec<String>,
    pub elements: Vec<ElementBrief>,
}

/// Runs the analyzer and builds a fresh snapshot.
pub async fn capture(analyzer: &dyn ScreenAnalyzer) -> DeskPilotResult<ScreenContext> {
    let raw = analyzer.capture().await?;
    Ok(ScreenContext::from_capture(raw))
}

/// Like [`capture`], but a failed capture means "no screen information this
/// cycle" rather than an error.
pub async fn capture_or_empty(analyzer: &dyn ScreenAnalyzer) -> ScreenContext {
    match capture(analyzer).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!(error = %e, "screen capture failed, using empty context");
            ScreenContext::empty()
        }
    }
}

/// Pairwise proximity; symmetric by construction.
fn compute_relations(elements: &mut [ScreenElement]) {
    let n = elements.len();
    for i in 0..n {
        for j in (i + 1)..n {
            if elements[i].bbox.top_left_distance(&elements[j].bbox) < RELATED_DISTANCE_PX {
                let (a, b) = (elements[i].id, elements[j].id);
                elements[i].related_ids.insert(b);
                elements[j].related_ids.insert(a);
            }
        }
    }
}

/// Smallest strictly-enclosing element per element. Ties go to the smaller
/// area, then the lower id. Identical boxes nest the higher id under the lower
/// one so the relation stays acyclic.
fn compute_parents(elements: &[ScreenElement]) -> Vec<Option<u32>> {
    elements
        .iter()
        .map(|child| {
            elements
                .iter()
                .filter(|cand| cand.id != child.id && can_parent(cand, child))
                .min_by_key(|cand| (cand.bbox.area(), cand.id))
                .map(|p| p.id)
        })
        .collect()
}

fn can_parent(outer: &ScreenElement, inner: &ScreenElement) -> bool {
    if !outer.bbox.contains(&inner.bbox) {
        return false;
    }
    if outer.bbox == inner.bbox {
        return outer.id < inner.id;
    }
    true
}

/// Header / main / footer bands over the union of all element boxes.
fn derive_regions(elements: &[ScreenElement]) -> Vec<Region> {
    if elements.is_empty() {
        return Vec::new();
    }
    let min_x = elements.iter().map(|e| e.bbox.x1).min().unwrap_or(0);
    let max_x = elements.iter().map(|e| e.bbox.x2).max().unwrap_or(0);
    let min_y = elements.iter().map(|e| e.bbox.y1).min().unwrap_or(0);
    let max_y = elements.iter().map(|e| e.bbox.y2).max().unwrap_or(0);

    let header_bottom = (min_y + BAND_HEIGHT).min(max_y);
    let footer_top = (max_y - BAND_HEIGHT).max(header_bottom);
    vec![
        Region {
            name: "header".into(),
            bbox: BoundingBox::new(min_x, min_y, max_x, header_bottom),
        },
        Region {
            name: "main".into(),
            bbox: BoundingBox::new(min_x, header_bottom, max_x, footer_top),
        },
        Region {
            name: "footer".into(),
            bbox: BoundingBox::new(min_x, footer_top, max_x, max_y),
        },
    ]
}
