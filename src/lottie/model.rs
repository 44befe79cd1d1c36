//! Serde model of the Lottie JSON subset understood by the rasterizer.
//!
//! Property values (`k`) are kept as raw JSON here and typed in [`crate::lottie::scene`].

use serde::Deserialize;
use serde_json::Value;

use crate::error::{StickerError, StickerResult};

#[derive(Clone, Debug, Deserialize)]
pub struct Property {
    pub k: Value,
}

/// Layer positions are either one vector property or separate `x`/`y` scalars.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum PositionProperty {
    Split { x: Property, y: Property },
    Combined(Property),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TransformModel {
    #[serde(default)]
    pub a: Option<Property>,
    #[serde(default)]
    pub p: Option<PositionProperty>,
    #[serde(default)]
    pub s: Option<Property>,
    #[serde(default)]
    pub r: Option<Property>,
    #[serde(default)]
    pub o: Option<Property>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "ty")]
pub enum ShapeModel {
    #[serde(rename = "gr")]
    Group {
        #[serde(default)]
        it: Vec<ShapeModel>,
        #[serde(default)]
        hd: bool,
    },
    #[serde(rename = "rc")]
    Rect {
        p: Property,
        s: Property,
        #[serde(default)]
        r: Option<Property>,
        #[serde(default)]
        hd: bool,
    },
    #[serde(rename = "el")]
    Ellipse {
        p: Property,
        s: Property,
        #[serde(default)]
        hd: bool,
    },
    #[serde(rename = "sh")]
    Path {
        ks: Property,
        #[serde(default)]
        hd: bool,
    },
    #[serde(rename = "fl")]
    Fill {
        c: Property,
        #[serde(default)]
        o: Option<Property>,
        #[serde(default)]
        hd: bool,
    },
    #[serde(rename = "st")]
    Stroke {
        c: Property,
        #[serde(default)]
        o: Option<Property>,
        w: Property,
        #[serde(default)]
        hd: bool,
    },
    #[serde(rename = "tr")]
    Transform(TransformModel),
    #[serde(other)]
    Unsupported,
}

pub const LAYER_SOLID: u32 = 1;
pub const LAYER_NULL: u32 = 3;
pub const LAYER_SHAPE: u32 = 4;

#[derive(Clone, Debug, Deserialize)]
pub struct LayerModel {
    pub ty: u32,
    #[serde(default)]
    pub nm: Option<String>,
    #[serde(default)]
    pub ind: Option<i64>,
    #[serde(default)]
    pub parent: Option<i64>,
    #[serde(default)]
    pub ip: f64,
    #[serde(default)]
    pub op: Option<f64>,
    #[serde(default)]
    pub st: f64,
    #[serde(default)]
    pub hd: bool,
    #[serde(default)]
    pub ks: TransformModel,
    #[serde(default)]
    pub shapes: Vec<ShapeModel>,
    /// Solid layer color, `#rrggbb`.
    #[serde(default)]
    pub sc: Option<String>,
    #[serde(default)]
    pub sw: Option<f64>,
    #[serde(default)]
    pub sh: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CompositionModel {
    #[serde(default)]
    pub v: Option<String>,
    #[serde(default)]
    pub nm: Option<String>,
    pub fr: f64,
    pub ip: f64,
    pub op: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub layers: Vec<LayerModel>,
}

impl CompositionModel {
    pub fn validate(&self) -> StickerResult<()> {
        if !self.fr.is_finite() || self.fr <= 0.0 {
            return Err(StickerError::malformed(format!(
                "frame rate must be positive, got {}",
                self.fr
            )));
        }
        if self.w < 1.0 || self.h < 1.0 {
            return Err(StickerError::malformed(format!(
                "composition size must be at least 1x1, got {}x{}",
                self.w, self.h
            )));
        }
        if self.op < self.ip {
            return Err(StickerError::malformed(format!(
                "out point {} precedes in point {}",
                self.op, self.ip
            )));
        }
        Ok(())
    }
}

/// Parse and validate a Lottie document.
pub fn parse_composition(bytes: &[u8]) -> StickerResult<CompositionModel> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(StickerError::malformed("composition is empty"));
    }
    let model: CompositionModel =
        serde_json::from_slice(bytes).map_err(|e| StickerError::malformed(e.to_string()))?;
    model.validate()?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DecodeError, StickerError};

    fn is_malformed(err: &StickerError) -> bool {
        matches!(
            err,
            StickerError::Decode(DecodeError::MalformedComposition(_))
        )
    }

    #[test]
    fn minimal_document_parses() {
        let doc = br#"{"v":"5.5.2","fr":30,"ip":0,"op":60,"w":512,"h":512,"layers":[]}"#;
        let comp = parse_composition(doc).unwrap();
        assert_eq!(comp.fr, 30.0);
        assert_eq!(comp.op, 60.0);
        assert!(comp.layers.is_empty());
    }

    #[test]
    fn empty_and_invalid_documents_are_malformed() {
        assert!(is_malformed(&parse_composition(b"").unwrap_err()));
        assert!(is_malformed(&parse_composition(b"  \n").unwrap_err()));
        assert!(is_malformed(&parse_composition(b"{not json").unwrap_err()));
        assert!(is_malformed(
            &parse_composition(br#"{"fr":30,"ip":0,"op":10}"#).unwrap_err()
        ));
        assert!(is_malformed(
            &parse_composition(br#"{"fr":0,"ip":0,"op":10,"w":1,"h":1}"#).unwrap_err()
        ));
    }

    #[test]
    fn shapes_and_positions_deserialize() {
        let doc = br#"{
            "fr": 10, "ip": 0, "op": 3, "w": 100, "h": 100,
            "layers": [{
                "ty": 4, "ind": 1, "ip": 0, "op": 3, "st": 0,
                "ks": {
                    "p": { "s": true, "x": { "a": 0, "k": 5 }, "y": { "a": 0, "k": 6 } },
                    "o": { "a": 0, "k": 100 }
                },
                "shapes": [
                    { "ty": "gr", "it": [
                        { "ty": "rc", "p": { "a": 0, "k": [0, 0] }, "s": { "a": 0, "k": [10, 10] }, "r": { "a": 0, "k": 0 } },
                        { "ty": "fl", "c": { "a": 0, "k": [1, 0, 0, 1] }, "o": { "a": 0, "k": 100 } },
                        { "ty": "tr", "p": { "a": 0, "k": [50, 50] } }
                    ]},
                    { "ty": "mm", "mm": 1 }
                ]
            }]
        }"#;
        let comp = parse_composition(doc).unwrap();
        let layer = &comp.layers[0];
        assert!(matches!(
            layer.ks.p,
            Some(PositionProperty::Split { .. })
        ));
        let ShapeModel::Group { it, .. } = &layer.shapes[0] else {
            panic!("expected group");
        };
        assert!(matches!(it[0], ShapeModel::Rect { .. }));
        assert!(matches!(it[1], ShapeModel::Fill { .. }));
        assert!(matches!(it[2], ShapeModel::Transform(_)));
        assert!(matches!(layer.shapes[1], ShapeModel::Unsupported));
    }
}
