use serde_json::Value;

use crate::error::{StickerError, StickerResult};

pub trait Lerp: Sized {
    fn lerp(a: &Self, b: &Self, t: f64) -> Self;
}

impl Lerp for f64 {
    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        a + (b - a) * t
    }
}

impl Lerp for Vec<f64> {
    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        if a.len() != b.len() {
            return a.clone();
        }
        a.iter().zip(b).map(|(x, y)| x + (y - x) * t).collect()
    }
}

/// Cubic bezier vertex list as stored in Lottie `sh` shapes.
///
/// Tangents are relative to their vertex.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BezierShape {
    pub closed: bool,
    pub vertices: Vec<[f64; 2]>,
    pub in_tangents: Vec<[f64; 2]>,
    pub out_tangents: Vec<[f64; 2]>,
}

impl Lerp for BezierShape {
    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        if a.vertices.len() != b.vertices.len() {
            return a.clone();
        }
        let mix = |x: &[[f64; 2]], y: &[[f64; 2]]| -> Vec<[f64; 2]> {
            x.iter()
                .zip(y)
                .map(|(p, q)| [p[0] + (q[0] - p[0]) * t, p[1] + (q[1] - p[1]) * t])
                .collect()
        };
        Self {
            closed: a.closed,
            vertices: mix(&a.vertices, &b.vertices),
            in_tangents: mix(&a.in_tangents, &b.in_tangents),
            out_tangents: mix(&a.out_tangents, &b.out_tangents),
        }
    }
}

impl BezierShape {
    pub fn to_path(&self) -> kurbo::BezPath {
        let mut path = kurbo::BezPath::new();
        let n = self.vertices.len();
        if n == 0 {
            return path;
        }
        let pt = |p: [f64; 2]| kurbo::Point::new(p[0], p[1]);
        let tangent = |list: &[[f64; 2]], i: usize| list.get(i).copied().unwrap_or([0.0, 0.0]);
        let segment = |path: &mut kurbo::BezPath, from: usize, to: usize| {
            let a = self.vertices[from];
            let b = self.vertices[to];
            let o = tangent(&self.out_tangents, from);
            let i = tangent(&self.in_tangents, to);
            path.curve_to(
                pt([a[0] + o[0], a[1] + o[1]]),
                pt([b[0] + i[0], b[1] + i[1]]),
                pt(b),
            );
        };

        path.move_to(pt(self.vertices[0]));
        for i in 1..n {
            segment(&mut path, i - 1, i);
        }
        if self.closed {
            segment(&mut path, n - 1, 0);
            path.close_path();
        }
        path
    }
}

/// Cubic-bezier timing curve through (0,0), (x1,y1), (x2,y2), (1,1).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CubicEase {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl CubicEase {
    pub const LINEAR: Self = Self {
        x1: 0.0,
        y1: 0.0,
        x2: 1.0,
        y2: 1.0,
    };

    pub fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        if self == Self::LINEAR {
            return t;
        }
        let bez = |a: f64, b: f64, s: f64| {
            let inv = 1.0 - s;
            3.0 * inv * inv * s * a + 3.0 * inv * s * s * b + s * s * s
        };
        // Bisection on x(s) = t; x is monotonic for x1, x2 in [0, 1].
        let (x1, x2) = (self.x1.clamp(0.0, 1.0), self.x2.clamp(0.0, 1.0));
        let (mut lo, mut hi) = (0.0f64, 1.0f64);
        let mut s = t;
        for _ in 0..48 {
            let x = bez(x1, x2, s);
            if (x - t).abs() < 1e-7 {
                break;
            }
            if x < t {
                lo = s;
            } else {
                hi = s;
            }
            s = 0.5 * (lo + hi);
        }
        bez(self.y1, self.y2, s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Keyframe<T> {
    pub time: f64,
    pub value: T,
    pub hold: bool,
    pub ease: CubicEase, // toward the next key
}

#[derive(Clone, Debug, PartialEq)]
pub enum Animated<T> {
    Static(T),
    Keyframes(Vec<Keyframe<T>>), // sorted by time
}

impl<T> Animated<T>
where
    T: Lerp + Clone,
{
    pub fn sample(&self, frame: f64) -> T {
        let keys = match self {
            Self::Static(v) => return v.clone(),
            Self::Keyframes(keys) => keys,
        };

        let idx = keys.partition_point(|k| k.time <= frame);
        if idx == 0 {
            return keys[0].value.clone();
        }
        if idx >= keys.len() {
            return keys[keys.len() - 1].value.clone();
        }

        let a = &keys[idx - 1];
        let b = &keys[idx];
        let span = b.time - a.time;
        if a.hold || span <= 0.0 {
            return a.value.clone();
        }
        let t = a.ease.apply((frame - a.time) / span);
        T::lerp(&a.value, &b.value, t)
    }

    pub fn is_static(&self) -> bool {
        matches!(self, Self::Static(_))
    }
}

fn malformed(what: &str) -> StickerError {
    StickerError::malformed(format!("invalid {what} value"))
}

fn is_keyframe_list(k: &Value) -> bool {
    k.as_array()
        .and_then(|a| a.first())
        .is_some_and(|first| first.get("t").is_some())
}

fn number_list(v: &Value, what: &str) -> StickerResult<Vec<f64>> {
    match v {
        Value::Number(n) => Ok(vec![n.as_f64().ok_or_else(|| malformed(what))?]),
        Value::Array(items) => items
            .iter()
            .map(|x| x.as_f64().ok_or_else(|| malformed(what)))
            .collect(),
        _ => Err(malformed(what)),
    }
}

/// Easing handles are `{ "x": n | [n..], "y": n | [n..] }`; only the first dimension is used.
fn handle(v: Option<&Value>) -> Option<(f64, f64)> {
    let v = v?;
    let first = |c: &Value| match c {
        Value::Number(n) => n.as_f64(),
        Value::Array(a) => a.first().and_then(Value::as_f64),
        _ => None,
    };
    Some((first(v.get("x")?)?, first(v.get("y")?)?))
}

fn keyframes<T, F>(keys: &[Value], what: &str, parse: F) -> StickerResult<Animated<T>>
where
    T: Clone,
    F: Fn(&Value) -> StickerResult<T>,
{
    let mut out: Vec<Keyframe<T>> = Vec::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        let time = key
            .get("t")
            .and_then(Value::as_f64)
            .ok_or_else(|| malformed(what))?;
        // Older exporters put the end value in "e" and leave the final key without "s".
        let value = match key.get("s") {
            Some(s) => parse(s)?,
            None => match out.last() {
                Some(prev) if i > 0 => match keys[i - 1].get("e") {
                    Some(e) => parse(e)?,
                    None => prev.value.clone(),
                },
                _ => return Err(malformed(what)),
            },
        };
        let hold = key.get("h").and_then(Value::as_f64).unwrap_or(0.0) != 0.0;
        let ease = match (handle(key.get("o")), handle(key.get("i"))) {
            (Some((x1, y1)), Some((x2, y2))) => CubicEase { x1, y1, x2, y2 },
            _ => CubicEase::LINEAR,
        };
        out.push(Keyframe {
            time,
            value,
            hold,
            ease,
        });
    }
    if out.is_empty() {
        return Err(malformed(what));
    }
    if !out.windows(2).all(|w| w[0].time <= w[1].time) {
        return Err(StickerError::malformed(format!(
            "{what} keyframes must be sorted by time"
        )));
    }
    Ok(Animated::Keyframes(out))
}

/// Parse the `k` member of a scalar or vector property.
pub fn parse_multi(k: &Value, what: &str) -> StickerResult<Animated<Vec<f64>>> {
    if is_keyframe_list(k) {
        let keys = k.as_array().map(Vec::as_slice).unwrap_or_default();
        return keyframes(keys, what, |v| number_list(v, what));
    }
    Ok(Animated::Static(number_list(k, what)?))
}

/// Parse the `k` member of a scalar property, taking the first component.
pub fn parse_scalar(k: &Value, what: &str) -> StickerResult<Animated<f64>> {
    let first = |v: Vec<f64>| v.first().copied().ok_or_else(|| malformed(what));
    match parse_multi(k, what)? {
        Animated::Static(v) => Ok(Animated::Static(first(v)?)),
        Animated::Keyframes(keys) => Ok(Animated::Keyframes(
            keys.into_iter()
                .map(|k| {
                    Ok(Keyframe {
                        time: k.time,
                        value: first(k.value)?,
                        hold: k.hold,
                        ease: k.ease,
                    })
                })
                .collect::<StickerResult<_>>()?,
        )),
    }
}

fn point_list(v: Option<&Value>, what: &str) -> StickerResult<Vec<[f64; 2]>> {
    let Some(Value::Array(items)) = v else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .map(|p| {
            let xy = number_list(p, what)?;
            match xy.as_slice() {
                [x, y, ..] => Ok([*x, *y]),
                _ => Err(malformed(what)),
            }
        })
        .collect()
}

fn bezier(v: &Value, what: &str) -> StickerResult<BezierShape> {
    // Keyframed shapes wrap the bezier in a one-element array.
    let obj = match v {
        Value::Array(items) => items.first().ok_or_else(|| malformed(what))?,
        other => other,
    };
    if !obj.is_object() {
        return Err(malformed(what));
    }
    Ok(BezierShape {
        closed: obj.get("c").and_then(Value::as_bool).unwrap_or(false),
        vertices: point_list(obj.get("v"), what)?,
        in_tangents: point_list(obj.get("i"), what)?,
        out_tangents: point_list(obj.get("o"), what)?,
    })
}

/// Parse the `k` member of a path (`sh`) property.
pub fn parse_bezier(k: &Value, what: &str) -> StickerResult<Animated<BezierShape>> {
    if is_keyframe_list(k) {
        let keys = k.as_array().map(Vec::as_slice).unwrap_or_default();
        return keyframes(keys, what, |v| bezier(v, what));
    }
    Ok(Animated::Static(bezier(k, what)?))
}
