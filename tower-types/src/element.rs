//! Whiteboard elements and the events that mutate them.
//!
//! Elements serialize as flat JSON objects with a `type` discriminator:
//!
//! ```json
//! {"id":"e1","x":100.0,"y":100.0,"color":"red","draggable":true,"type":"rect","width":40.0,"height":30.0}
//! ```
//!
//! Element events use an adjacently tagged layout, `{"action": "...", "payload": {...}}`.

use serde::{Deserialize, Serialize};

use crate::{ElementId, SyncError};

/// A 2D point used by line elements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

/// Discriminator of an element's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Axis-aligned rectangle.
    Rect,
    /// Circle.
    Circle,
    /// Polyline.
    Line,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Rect => "rect",
            Self::Circle => "circle",
            Self::Line => "line",
        };
        f.write_str(s)
    }
}

/// Shape-specific geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Shape {
    /// Rectangle of the given size, anchored at the element position.
    Rect {
        /// Width in canvas units.
        width: f64,
        /// Height in canvas units.
        height: f64,
    },
    /// Circle centred on the element position.
    Circle {
        /// Radius in canvas units.
        radius: f64,
    },
    /// Polyline through the given points.
    Line {
        /// Vertices of the line.
        points: Vec<Point>,
    },
}

impl Shape {
    /// The kind discriminator for this shape.
    pub fn kind(&self) -> ElementKind {
        match self {
            Self::Rect { .. } => ElementKind::Rect,
            Self::Circle { .. } => ElementKind::Circle,
            Self::Line { .. } => ElementKind::Line,
        }
    }
}

/// One drawable object on the whiteboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Stable, globally unique identifier.
    pub id: ElementId,
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Fill or stroke colour, as understood by the renderer.
    pub color: String,
    /// Whether the editor lets users drag this element.
    pub draggable: bool,
    /// Shape geometry.
    #[serde(flatten)]
    pub shape: Shape,
}

impl Element {
    /// Build a draggable rectangle.
    pub fn rect(id: impl Into<ElementId>, x: f64, y: f64, width: f64, height: f64, color: &str) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            color: color.to_owned(),
            draggable: true,
            shape: Shape::Rect { width, height },
        }
    }

    /// Build a draggable circle.
    pub fn circle(id: impl Into<ElementId>, x: f64, y: f64, radius: f64, color: &str) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            color: color.to_owned(),
            draggable: true,
            shape: Shape::Circle { radius },
        }
    }

    /// The kind discriminator for this element.
    pub fn kind(&self) -> ElementKind {
        self.shape.kind()
    }

    /// Merge the defined fields of `patch` into this element.
    ///
    /// Fields that are `None` leave the current value untouched; there is no
    /// way to clear a field. Geometry fields that do not belong to this shape
    /// are ignored. Fails if the patch addresses another element or a
    /// different shape kind.
    pub fn apply_patch(&mut self, patch: &ElementPatch) -> Result<(), SyncError> {
        if patch.id != self.id {
            return Err(SyncError::InvalidData(format!(
                "patch for {} applied to {}",
                patch.id, self.id
            )));
        }
        if patch.kind != self.kind() {
            return Err(SyncError::KindMismatch {
                id: self.id.to_string(),
                expected: self.kind(),
                got: patch.kind,
            });
        }

        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(color) = &patch.color {
            self.color.clone_from(color);
        }
        if let Some(draggable) = patch.draggable {
            self.draggable = draggable;
        }

        match &mut self.shape {
            Shape::Rect { width, height } => {
                if let Some(w) = patch.width {
                    *width = w;
                }
                if let Some(h) = patch.height {
                    *height = h;
                }
            }
            Shape::Circle { radius } => {
                if let Some(r) = patch.radius {
                    *radius = r;
                }
            }
            Shape::Line { points } => {
                if let Some(p) = &patch.points {
                    points.clone_from(p);
                }
            }
        }
        Ok(())
    }
}

/// A partial element: only the defined fields are merged on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementPatch {
    /// Element being updated.
    pub id: ElementId,
    /// Shape kind of the element being updated.
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// New horizontal position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// New vertical position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// New colour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// New draggable flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draggable: Option<bool>,
    /// New rectangle width.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    /// New rectangle height.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    /// New circle radius.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    /// New line vertices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Point>>,
}

impl ElementPatch {
    /// An empty patch for the given element.
    pub fn new(id: impl Into<ElementId>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            kind,
            x: None,
            y: None,
            color: None,
            draggable: None,
            width: None,
            height: None,
            radius: None,
            points: None,
        }
    }

    /// A patch that moves the element to `(x, y)`.
    pub fn moved(id: impl Into<ElementId>, kind: ElementKind, x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::new(id, kind)
        }
    }
}

/// Reference to an element by id, carried by deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRef {
    /// Element being deleted.
    pub id: ElementId,
}

/// A single mutation of the whiteboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "lowercase")]
pub enum ElementEvent {
    /// Insert (or replace) a full element.
    Create(Element),
    /// Merge the defined fields into an existing element.
    Update(ElementPatch),
    /// Remove an element.
    Delete(ElementRef),
}

impl ElementEvent {
    /// Delete the element with the given id.
    pub fn delete(id: impl Into<ElementId>) -> Self {
        Self::Delete(ElementRef { id: id.into() })
    }

    /// The element this event targets.
    pub fn element_id(&self) -> &ElementId {
        match self {
            Self::Create(e) => &e.id,
            Self::Update(p) => &p.id,
            Self::Delete(r) => &r.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_serializes_flat_with_type_tag() {
        let rect = Element::rect("e1", 100.0, 100.0, 40.0, 30.0, "red");
        let value = serde_json::to_value(&rect).unwrap();

        assert_eq!(value["type"], "rect");
        assert_eq!(value["width"], 40.0);
        assert_eq!(value["id"], "e1");
        assert!(value.get("shape").is_none());
    }

    #[test]
    fn unknown_shape_kind_is_rejected() {
        let json = r#"{"id":"e1","x":0,"y":0,"color":"red","draggable":true,"type":"hexagon"}"#;
        assert!(serde_json::from_str::<Element>(json).is_err());
    }

    #[test]
    fn event_uses_action_and_payload() {
        let event = ElementEvent::delete("e9");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "delete");
        assert_eq!(value["payload"]["id"], "e9");

        let update: ElementEvent = serde_json::from_str(
            r#"{"action":"update","payload":{"id":"e1","type":"rect","x":150}}"#,
        )
        .unwrap();
        match update {
            ElementEvent::Update(p) => {
                assert_eq!(p.x, Some(150.0));
                assert_eq!(p.y, None);
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn patch_omits_undefined_fields() {
        let patch = ElementPatch::moved("e1", ElementKind::Rect, 1.0, 2.0);
        let json = serde_json::to_string(&patch).unwrap();
        assert!(!json.contains("color"));
        assert!(!json.contains("width"));
    }

    #[test]
    fn patch_merges_only_defined_fields() {
        let mut rect = Element::rect("e1", 100.0, 100.0, 40.0, 30.0, "red");
        let mut patch = ElementPatch::moved("e1", ElementKind::Rect, 150.0, 120.0);
        patch.height = Some(10.0);
        rect.apply_patch(&patch).unwrap();

        assert_eq!((rect.x, rect.y), (150.0, 120.0));
        assert_eq!(rect.color, "red");
        assert_eq!(rect.shape, Shape::Rect { width: 40.0, height: 10.0 });
    }

    #[test]
    fn patch_with_wrong_kind_is_refused() {
        let mut circle = Element::circle("c1", 0.0, 0.0, 5.0, "blue");
        let patch = ElementPatch::moved("c1", ElementKind::Rect, 1.0, 1.0);
        let err = circle.apply_patch(&patch).unwrap_err();
        assert!(matches!(err, SyncError::KindMismatch { .. }));
        assert_eq!(circle.x, 0.0);
    }
}
