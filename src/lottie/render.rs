use crate::{
    core::{CHANNELS, PixelBuffer},
    error::{StickerError, StickerResult},
    lottie::scene::{DrawOp, Rgba, Scene},
};

/// CPU rasterizer for an evaluated [`Scene`].
pub struct LottieRasterizer {
    scene: Scene,
    width: u16,
    height: u16,
}

impl LottieRasterizer {
    pub fn new(scene: Scene) -> StickerResult<Self> {
        let width: u16 = scene.width.try_into().map_err(|_| {
            StickerError::malformed(format!("composition width {} exceeds u16", scene.width))
        })?;
        let height: u16 = scene.height.try_into().map_err(|_| {
            StickerError::malformed(format!("composition height {} exceeds u16", scene.height))
        })?;
        Ok(Self {
            scene,
            width,
            height,
        })
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Render the frame at 0-based `index` into straight-alpha RGBA.
    pub fn render(&self, index: u64) -> StickerResult<PixelBuffer> {
        let t = self.scene.frame_time(index);
        let mut ctx = vello_cpu::RenderContext::new(self.width, self.height);
        for layer in self.scene.draw_list(t) {
            ctx.set_transform(affine_to_cpu(layer.transform));
            let faded = layer.opacity < 1.0;
            if faded {
                ctx.push_opacity_layer(layer.opacity as f32);
            }
            for op in &layer.ops {
                match op {
                    DrawOp::Fill { path, color } => {
                        ctx.set_paint(color_to_cpu(*color));
                        ctx.fill_path(&bezpath_to_cpu(path));
                    }
                    DrawOp::Stroke { path, color, width } => {
                        ctx.set_paint(color_to_cpu(*color));
                        ctx.set_stroke(vello_cpu::kurbo::Stroke::new(*width));
                        ctx.stroke_path(&bezpath_to_cpu(path));
                    }
                }
            }
            if faded {
                ctx.pop_layer();
            }
        }
        ctx.flush();

        let mut pixmap = vello_cpu::Pixmap::new(self.width, self.height);
        ctx.render_to_pixmap(&mut pixmap);
        let mut data = pixmap.data_as_u8_slice().to_vec();
        unpremultiply_in_place(&mut data);
        PixelBuffer::from_rgba(u32::from(self.width), u32::from(self.height), data)
    }
}

fn color_to_cpu(c: Rgba) -> vello_cpu::peniko::Color {
    let to_u8 = |v: f64| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    vello_cpu::peniko::Color::from_rgba8(to_u8(c[0]), to_u8(c[1]), to_u8(c[2]), to_u8(c[3]))
}

fn affine_to_cpu(a: kurbo::Affine) -> vello_cpu::kurbo::Affine {
    vello_cpu::kurbo::Affine::new(a.as_coeffs())
}

fn point_to_cpu(p: kurbo::Point) -> vello_cpu::kurbo::Point {
    vello_cpu::kurbo::Point::new(p.x, p.y)
}

fn bezpath_to_cpu(path: &kurbo::BezPath) -> vello_cpu::kurbo::BezPath {
    use kurbo::PathEl;

    let mut out = vello_cpu::kurbo::BezPath::new();
    for &el in path.elements() {
        match el {
            PathEl::MoveTo(p) => out.move_to(point_to_cpu(p)),
            PathEl::LineTo(p) => out.line_to(point_to_cpu(p)),
            PathEl::QuadTo(p1, p2) => out.quad_to(point_to_cpu(p1), point_to_cpu(p2)),
            PathEl::CurveTo(p1, p2, p3) => {
                out.curve_to(point_to_cpu(p1), point_to_cpu(p2), point_to_cpu(p3));
            }
            PathEl::ClosePath => out.close_path(),
        }
    }
    out
}

fn unpremultiply_in_place(data: &mut [u8]) {
    for px in data.chunks_exact_mut(CHANNELS) {
        let a = u16::from(px[3]);
        if a == 0 {
            px[..3].fill(0);
        } else if a < 255 {
            for c in &mut px[..3] {
                *c = ((u16::from(*c) * 255 + a / 2) / a).min(255) as u8;
            }
        }
    }
}
