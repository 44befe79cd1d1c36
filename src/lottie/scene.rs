use kurbo::{Affine, BezPath, Ellipse, Point, Rect, RoundedRect, Shape as _};

use crate::{
    error::{StickerError, StickerResult},
    lottie::{
        model::{
            CompositionModel, LAYER_NULL, LAYER_SHAPE, LAYER_SOLID, LayerModel, PositionProperty,
            Property, ShapeModel, TransformModel,
        },
        value::{Animated, BezierShape, parse_bezier, parse_multi, parse_scalar},
    },
};

const PATH_TOLERANCE: f64 = 0.1;
const MAX_PARENT_DEPTH: usize = 32;

/// Straight-alpha color, components in `0.0..=1.0`.
pub type Rgba = [f64; 4];

#[derive(Clone, Debug)]
pub enum DrawOp {
    Fill {
        path: BezPath,
        color: Rgba,
    },
    Stroke {
        path: BezPath,
        color: Rgba,
        width: f64,
    },
}

impl DrawOp {
    fn transform(&mut self, affine: Affine, opacity: f64) {
        match self {
            Self::Fill { path, color } => {
                path.apply_affine(affine);
                color[3] *= opacity;
            }
            Self::Stroke { path, color, width } => {
                path.apply_affine(affine);
                color[3] *= opacity;
                *width *= affine.determinant().abs().sqrt();
            }
        }
    }
}

/// Evaluated layer, ops listed in paint order.
#[derive(Clone, Debug)]
pub struct DrawLayer {
    pub transform: Affine,
    pub opacity: f64,
    pub ops: Vec<DrawOp>,
}

#[derive(Clone, Debug)]
enum Position {
    Combined(Animated<Vec<f64>>),
    Split(Animated<f64>, Animated<f64>),
}

#[derive(Clone, Debug)]
struct LayerTransform {
    anchor: Animated<Vec<f64>>,
    position: Position,
    scale: Animated<Vec<f64>>,
    rotation: Animated<f64>,
    opacity: Animated<f64>,
}

fn vec2(v: &[f64], default: f64) -> (f64, f64) {
    (
        v.first().copied().unwrap_or(default),
        v.get(1).copied().unwrap_or(default),
    )
}

fn multi_or(prop: Option<&Property>, what: &str, default: Vec<f64>) -> StickerResult<Animated<Vec<f64>>> {
    match prop {
        Some(p) => parse_multi(&p.k, what),
        None => Ok(Animated::Static(default)),
    }
}

fn scalar_or(prop: Option<&Property>, what: &str, default: f64) -> StickerResult<Animated<f64>> {
    match prop {
        Some(p) => parse_scalar(&p.k, what),
        None => Ok(Animated::Static(default)),
    }
}

impl LayerTransform {
    fn from_model(m: &TransformModel) -> StickerResult<Self> {
        let position = match &m.p {
            Some(PositionProperty::Split { x, y }) => Position::Split(
                parse_scalar(&x.k, "position x")?,
                parse_scalar(&y.k, "position y")?,
            ),
            Some(PositionProperty::Combined(p)) => Position::Combined(parse_multi(&p.k, "position")?),
            None => Position::Combined(Animated::Static(vec![0.0, 0.0])),
        };
        Ok(Self {
            anchor: multi_or(m.a.as_ref(), "anchor", vec![0.0, 0.0])?,
            position,
            scale: multi_or(m.s.as_ref(), "scale", vec![100.0, 100.0])?,
            rotation: scalar_or(m.r.as_ref(), "rotation", 0.0)?,
            opacity: scalar_or(m.o.as_ref(), "opacity", 100.0)?,
        })
    }

    /// `translate(position) * rotate * scale * translate(-anchor)`.
    fn affine(&self, t: f64) -> Affine {
        let (ax, ay) = vec2(&self.anchor.sample(t), 0.0);
        let (px, py) = match &self.position {
            Position::Combined(p) => vec2(&p.sample(t), 0.0),
            Position::Split(x, y) => (x.sample(t), y.sample(t)),
        };
        let (sx, sy) = vec2(&self.scale.sample(t), 100.0);
        let rot = self.rotation.sample(t).to_radians();
        Affine::translate((px, py))
            * Affine::rotate(rot)
            * Affine::scale_non_uniform(sx / 100.0, sy / 100.0)
            * Affine::translate((-ax, -ay))
    }

    fn opacity(&self, t: f64) -> f64 {
        (self.opacity.sample(t) / 100.0).clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug)]
enum SceneShape {
    Group {
        items: Vec<SceneShape>,
        transform: Option<LayerTransform>,
    },
    Rect {
        position: Animated<Vec<f64>>,
        size: Animated<Vec<f64>>,
        roundness: Animated<f64>,
    },
    Ellipse {
        position: Animated<Vec<f64>>,
        size: Animated<Vec<f64>>,
    },
    Path(Animated<BezierShape>),
    Fill {
        color: Animated<Vec<f64>>,
        opacity: Animated<f64>,
    },
    Stroke {
        color: Animated<Vec<f64>>,
        opacity: Animated<f64>,
        width: Animated<f64>,
    },
}

fn prepare_shapes(items: &[ShapeModel]) -> StickerResult<(Vec<SceneShape>, Option<LayerTransform>)> {
    let mut out = Vec::with_capacity(items.len());
    let mut transform = None;
    for item in items {
        let shape = match item {
            ShapeModel::Group { hd: true, .. }
            | ShapeModel::Rect { hd: true, .. }
            | ShapeModel::Ellipse { hd: true, .. }
            | ShapeModel::Path { hd: true, .. }
            | ShapeModel::Fill { hd: true, .. }
            | ShapeModel::Stroke { hd: true, .. } => continue,
            ShapeModel::Group { it, .. } => {
                let (items, transform) = prepare_shapes(it)?;
                SceneShape::Group { items, transform }
            }
            ShapeModel::Rect { p, s, r, .. } => SceneShape::Rect {
                position: parse_multi(&p.k, "rect position")?,
                size: parse_multi(&s.k, "rect size")?,
                roundness: scalar_or(r.as_ref(), "rect roundness", 0.0)?,
            },
            ShapeModel::Ellipse { p, s, .. } => SceneShape::Ellipse {
                position: parse_multi(&p.k, "ellipse position")?,
                size: parse_multi(&s.k, "ellipse size")?,
            },
            ShapeModel::Path { ks, .. } => SceneShape::Path(parse_bezier(&ks.k, "path")?),
            ShapeModel::Fill { c, o, .. } => SceneShape::Fill {
                color: parse_multi(&c.k, "fill color")?,
                opacity: scalar_or(o.as_ref(), "fill opacity", 100.0)?,
            },
            ShapeModel::Stroke { c, o, w, .. } => SceneShape::Stroke {
                color: parse_multi(&c.k, "stroke color")?,
                opacity: scalar_or(o.as_ref(), "stroke opacity", 100.0)?,
                width: parse_scalar(&w.k, "stroke width")?,
            },
            ShapeModel::Transform(tr) => {
                transform = Some(LayerTransform::from_model(tr)?);
                continue;
            }
            ShapeModel::Unsupported => {
                tracing::debug!("skipping unsupported lottie shape item");
                continue;
            }
        };
        out.push(shape);
    }
    Ok((out, transform))
}

/// Colors are 0..1 in current exporters and 0..255 in very old ones.
fn rgba(c: &[f64], opacity: f64) -> Rgba {
    let scale = if c.iter().take(3).any(|&v| v > 1.0) {
        255.0
    } else {
        1.0
    };
    let ch = |i: usize, default: f64| (c.get(i).copied().unwrap_or(default) / scale).clamp(0.0, 1.0);
    let alpha = c.get(3).map(|a| (a / scale).clamp(0.0, 1.0)).unwrap_or(1.0);
    [ch(0, 0.0), ch(1, 0.0), ch(2, 0.0), alpha * opacity.clamp(0.0, 1.0)]
}

fn merged(geometry: &[BezPath]) -> BezPath {
    let mut out = BezPath::new();
    for path in geometry {
        for el in path.elements() {
            out.push(*el);
        }
    }
    out
}

/// Evaluate shape items at local time `t`.
///
/// Returns draw ops in stacking order (topmost first) and the geometry that styles in an
/// enclosing group apply to.
fn collect_ops(items: &[SceneShape], t: f64) -> (Vec<DrawOp>, Vec<BezPath>) {
    let mut ops = Vec::new();
    let mut geometry: Vec<BezPath> = Vec::new();
    for item in items {
        match item {
            SceneShape::Group { items, transform } => {
                let (mut sub_ops, sub_geometry) = collect_ops(items, t);
                let (affine, opacity) = transform
                    .as_ref()
                    .map(|tr| (tr.affine(t), tr.opacity(t)))
                    .unwrap_or((Affine::IDENTITY, 1.0));
                for op in &mut sub_ops {
                    op.transform(affine, opacity);
                }
                ops.extend(sub_ops);
                geometry.extend(sub_geometry.into_iter().map(|mut p| {
                    p.apply_affine(affine);
                    p
                }));
            }
            SceneShape::Rect {
                position,
                size,
                roundness,
            } => {
                let (cx, cy) = vec2(&position.sample(t), 0.0);
                let (w, h) = vec2(&size.sample(t), 0.0);
                let rect = Rect::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
                let radius = roundness.sample(t).clamp(0.0, w.min(h).abs() / 2.0);
                let path = if radius > 0.0 {
                    RoundedRect::from_rect(rect, radius).to_path(PATH_TOLERANCE)
                } else {
                    rect.to_path(PATH_TOLERANCE)
                };
                geometry.push(path);
            }
            SceneShape::Ellipse { position, size } => {
                let (cx, cy) = vec2(&position.sample(t), 0.0);
                let (w, h) = vec2(&size.sample(t), 0.0);
                let ellipse = Ellipse::new(Point::new(cx, cy), (w / 2.0, h / 2.0), 0.0);
                geometry.push(ellipse.to_path(PATH_TOLERANCE));
            }
            SceneShape::Path(shape) => geometry.push(shape.sample(t).to_path()),
            SceneShape::Fill { color, opacity } => {
                if !geometry.is_empty() {
                    ops.push(DrawOp::Fill {
                        path: merged(&geometry),
                        color: rgba(&color.sample(t), opacity.sample(t) / 100.0),
                    });
                }
            }
            SceneShape::Stroke {
                color,
                opacity,
                width,
            } => {
                let width = width.sample(t);
                if !geometry.is_empty() && width > 0.0 {
                    ops.push(DrawOp::Stroke {
                        path: merged(&geometry),
                        color: rgba(&color.sample(t), opacity.sample(t) / 100.0),
                        width,
                    });
                }
            }
        }
    }
    (ops, geometry)
}

#[derive(Clone, Debug)]
enum LayerContent {
    Null,
    Solid { color: Rgba, width: f64, height: f64 },
    Shapes(Vec<SceneShape>),
}

#[derive(Clone, Debug)]
struct SceneLayer {
    index: Option<i64>,
    parent: Option<i64>,
    in_point: f64,
    out_point: f64,
    start_time: f64,
    hidden: bool,
    transform: LayerTransform,
    content: LayerContent,
}

fn parse_hex_color(s: &str) -> StickerResult<Rgba> {
    let hex = s.trim().trim_start_matches('#');
    let bad = || StickerError::malformed(format!("invalid solid color '{s}'"));
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(bad());
    }
    let ch = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16)
            .map(|v| f64::from(v) / 255.0)
            .map_err(|_| bad())
    };
    Ok([ch(0)?, ch(2)?, ch(4)?, 1.0])
}

impl SceneLayer {
    fn from_model(m: &LayerModel, comp_out: f64) -> StickerResult<Self> {
        let content = match m.ty {
            LAYER_SHAPE => LayerContent::Shapes(prepare_shapes(&m.shapes)?.0),
            LAYER_SOLID => LayerContent::Solid {
                color: parse_hex_color(m.sc.as_deref().unwrap_or("#000000"))?,
                width: m.sw.unwrap_or(0.0),
                height: m.sh.unwrap_or(0.0),
            },
            LAYER_NULL => LayerContent::Null,
            other => {
                tracing::debug!(
                    layer = m.nm.as_deref().unwrap_or(""),
                    ty = other,
                    "lottie layer type is not rendered"
                );
                LayerContent::Null
            }
        };
        Ok(Self {
            index: m.ind,
            parent: m.parent,
            in_point: m.ip,
            out_point: m.op.unwrap_or(comp_out),
            start_time: m.st,
            hidden: m.hd,
            transform: LayerTransform::from_model(&m.ks)?,
            content,
        })
    }
}

/// Typed composition, ready to be evaluated at any frame.
#[derive(Clone, Debug)]
pub struct Scene {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub in_point: f64,
    pub out_point: f64,
    layers: Vec<SceneLayer>, // document order, topmost first
}

impl Scene {
    pub fn from_model(model: &CompositionModel) -> StickerResult<Self> {
        model.validate()?;
        let layers = model
            .layers
            .iter()
            .map(|l| SceneLayer::from_model(l, model.op))
            .collect::<StickerResult<Vec<_>>>()?;
        Ok(Self {
            width: model.w.round() as u32,
            height: model.h.round() as u32,
            frame_rate: model.fr,
            in_point: model.ip,
            out_point: model.op,
            layers,
        })
    }

    /// Duration in frames, `op - ip`.
    pub fn duration_frames(&self) -> u64 {
        (self.out_point - self.in_point).round().max(0.0) as u64
    }

    /// Composition time for a 0-based frame index.
    ///
    /// The out point is exclusive, so the final index repeats the last visible frame.
    pub fn frame_time(&self, index: u64) -> f64 {
        let t = self.in_point + index as f64;
        let last = (self.out_point - 1.0).max(self.in_point);
        t.min(last)
    }

    fn layer_by_index(&self, ind: i64) -> Option<&SceneLayer> {
        self.layers.iter().find(|l| l.index == Some(ind))
    }

    fn world_transform(&self, layer: &SceneLayer, t: f64) -> Affine {
        let mut affine = layer.transform.affine(t - layer.start_time);
        let mut parent = layer.parent;
        let mut depth = 0;
        while let Some(ind) = parent {
            if depth >= MAX_PARENT_DEPTH {
                tracing::warn!("lottie parent chain is too deep or cyclic");
                break;
            }
            let Some(p) = self.layer_by_index(ind) else {
                break;
            };
            affine = p.transform.affine(t - p.start_time) * affine;
            parent = p.parent;
            depth += 1;
        }
        affine
    }

    /// Evaluate every visible layer at composition time `t`, bottom layer first.
    pub fn draw_list(&self, t: f64) -> Vec<DrawLayer> {
        let mut out = Vec::new();
        for layer in self.layers.iter().rev() {
            if layer.hidden || t < layer.in_point || t >= layer.out_point {
                continue;
            }
            let local = t - layer.start_time;
            let opacity = layer.transform.opacity(local);
            if opacity <= 0.0 {
                continue;
            }
            let ops = match &layer.content {
                LayerContent::Null => continue,
                LayerContent::Solid {
                    color,
                    width,
                    height,
                } => vec![DrawOp::Fill {
                    path: Rect::new(0.0, 0.0, *width, *height).to_path(PATH_TOLERANCE),
                    color: *color,
                }],
                LayerContent::Shapes(items) => {
                    let (mut ops, _) = collect_ops(items, local);
                    ops.reverse();
                    ops
                }
            };
            out.push(DrawLayer {
                transform: self.world_transform(layer, t),
                opacity,
                ops,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lottie::model::parse_composition;

    fn scene(doc: &str) -> Scene {
        Scene::from_model(&parse_composition(doc.as_bytes()).unwrap()).unwrap()
    }

    const TWO_GROUPS: &str = r#"{
        "fr": 10, "ip": 0, "op": 10, "w": 20, "h": 20,
        "layers": [{
            "ty": 4, "ind": 1, "ip": 0, "op": 10, "st": 0,
            "ks": { "o": { "a": 0, "k": 50 } },
            "shapes": [
                { "ty": "gr", "it": [
                    { "ty": "rc", "p": { "a": 0, "k": [5, 5] }, "s": { "a": 0, "k": [4, 4] } },
                    { "ty": "fl", "c": { "a": 0, "k": [1, 0, 0, 1] }, "o": { "a": 0, "k": 100 } }
                ]},
                { "ty": "gr", "it": [
                    { "ty": "el", "p": { "a": 0, "k": [0, 0] }, "s": { "a": 0, "k": [4, 4] } },
                    { "ty": "fl", "c": { "a": 0, "k": [0, 0, 1, 1] }, "o": { "a": 0, "k": 100 } },
                    { "ty": "tr", "p": { "a": 0, "k": [10, 10] } }
                ]}
            ]
        }]
    }"#;

    #[test]
    fn earlier_items_are_painted_last() {
        let s = scene(TWO_GROUPS);
        let layers = s.draw_list(0.0);
        assert_eq!(layers.len(), 1);
        assert!((layers[0].opacity - 0.5).abs() < 1e-9);
        let colors: Vec<Rgba> = layers[0]
            .ops
            .iter()
            .map(|op| match op {
                DrawOp::Fill { color, .. } | DrawOp::Stroke { color, .. } => *color,
            })
            .collect();
        assert_eq!(colors, vec![[0.0, 0.0, 1.0, 1.0], [1.0, 0.0, 0.0, 1.0]]);
    }

    #[test]
    fn group_transform_moves_geometry() {
        let s = scene(TWO_GROUPS);
        let layers = s.draw_list(0.0);
        let DrawOp::Fill { path, .. } = &layers[0].ops[0] else {
            panic!("expected fill");
        };
        let bbox = kurbo::Shape::bounding_box(path);
        assert!((bbox.center().x - 10.0).abs() < 1e-6);
        assert!((bbox.center().y - 10.0).abs() < 1e-6);
    }

    #[test]
    fn layers_outside_their_range_are_skipped() {
        let s = scene(
            r##"{ "fr": 10, "ip": 0, "op": 10, "w": 8, "h": 8, "layers": [
                { "ty": 1, "ip": 5, "op": 10, "sc": "#ff0000", "sw": 8, "sh": 8 }
            ]}"##,
        );
        assert!(s.draw_list(4.0).is_empty());
        assert_eq!(s.draw_list(5.0).len(), 1);
    }

    #[test]
    fn final_index_reuses_last_visible_time() {
        let s = scene(r#"{ "fr": 10, "ip": 0, "op": 3, "w": 8, "h": 8, "layers": [] }"#);
        assert_eq!(s.duration_frames(), 3);
        assert_eq!(s.frame_time(0), 0.0);
        assert_eq!(s.frame_time(2), 2.0);
        assert_eq!(s.frame_time(3), 2.0);
    }

    #[test]
    fn parenting_composes_transforms() {
        let s = scene(
            r##"{ "fr": 10, "ip": 0, "op": 10, "w": 8, "h": 8, "layers": [
                { "ty": 1, "ind": 2, "parent": 1, "sc": "#00ff00", "sw": 2, "sh": 2,
                  "ks": { "p": { "a": 0, "k": [1, 1] } } },
                { "ty": 3, "ind": 1, "ks": { "p": { "a": 0, "k": [3, 0] } } }
            ]}"##,
        );
        let layers = s.draw_list(0.0);
        assert_eq!(layers.len(), 1);
        let origin = layers[0].transform * Point::ZERO;
        assert!((origin.x - 4.0).abs() < 1e-9);
        assert!((origin.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bad_solid_color_is_malformed() {
        let model = parse_composition(
            br#"{ "fr": 10, "ip": 0, "op": 1, "w": 8, "h": 8, "layers": [ { "ty": 1, "sc": "red" } ] }"#,
        )
        .unwrap();
        assert!(Scene::from_model(&model).is_err());
    }
}
