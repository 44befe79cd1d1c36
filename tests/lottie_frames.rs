use sticker_gif::{
    DecodeError, Encoder, Frame, FrameSource, FrameTiming, StickerError, StickerResult,
    encode_frames,
};

/// 4x4 red square sliding right by two pixels per frame on a 10x10 canvas.
const SLIDING_SQUARE: &str = r##"{
    "v": "5.7.0", "fr": 20, "ip": 0, "op": 3, "w": 10, "h": 10,
    "layers": [{
        "ty": 1, "ind": 1, "ip": 0, "op": 3, "st": 0,
        "sc": "#ff0000", "sw": 4, "sh": 4,
        "ks": {
            "p": { "a": 1, "k": [
                { "t": 0, "s": [0, 0] },
                { "t": 3, "s": [6, 0] }
            ]}
        }
    }]
}"##;

fn frames_of(doc: &str) -> StickerResult<Vec<Frame>> {
    let mut source = FrameSource::lottie(doc, "test");
    source.initialize()?;
    let mut frames = Vec::new();
    source.produce_frames(&mut |f: Frame| -> StickerResult<()> {
        frames.push(f);
        Ok(())
    })?;
    source.release();
    Ok(frames)
}

#[test]
fn metadata_reports_size_and_rate() {
    let mut source = FrameSource::lottie(SLIDING_SQUARE, "test");
    let meta = source.initialize().unwrap();
    assert_eq!((meta.width, meta.height), (10, 10));
    assert_eq!(meta.frame_count, 3);
    assert_eq!(meta.timing, FrameTiming::Rate { fps: 20.0 });
    assert_eq!(source.metadata(), Some(meta));
}

#[test]
fn every_frame_is_rendered_at_composition_size() {
    let frames = frames_of(SLIDING_SQUARE).unwrap();
    let indices: Vec<u64> = frames.iter().map(|f| f.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    for f in &frames {
        assert_eq!((f.buffer.width(), f.buffer.height()), (10, 10));
        assert_eq!(f.delay_ms, 50);
    }
}

#[test]
fn animation_moves_between_frames() {
    let frames = frames_of(SLIDING_SQUARE).unwrap();
    assert_eq!(frames[0].buffer.pixel(1, 1), [255, 0, 0, 255]);
    assert_eq!(frames[0].buffer.pixel(8, 8)[3], 0);

    // The final index clamps to the last visible time (frame 2, x = 4).
    let last = &frames[3].buffer;
    assert_eq!(last.pixel(5, 1), [255, 0, 0, 255]);
    assert_eq!(last.pixel(1, 1)[3], 0);
    assert_eq!(frames[2].buffer, frames[3].buffer);
}

#[test]
fn malformed_documents_fail_initialize() {
    for doc in ["", "{", r#"{"fr": 30, "ip": 0, "op": 10, "w": 0, "h": 10}"#] {
        let mut source = FrameSource::lottie(doc, "bad");
        let err = source.initialize().unwrap_err();
        assert!(
            matches!(err, StickerError::Decode(DecodeError::MalformedComposition(_))),
            "{doc:?} gave {err}"
        );
    }
}

#[test]
fn memory_encoder_collects_the_sequence() {
    let mut source = FrameSource::lottie(SLIDING_SQUARE, "test");
    source.initialize().unwrap();
    let mut encoder = Encoder::memory();
    let (path, count) = encode_frames(&mut source, &mut encoder).unwrap();
    assert_eq!(path, None);
    assert_eq!(count, 4);
    let Encoder::Memory(mem) = encoder else {
        panic!("expected memory encoder");
    };
    assert_eq!(mem.frames().len(), 4);
}
