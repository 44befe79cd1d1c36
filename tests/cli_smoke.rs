use std::process::Command;

const SQUARE: &str = r##"{"fr": 30, "ip": 0, "op": 10, "w": 16, "h": 16, "layers": [
    {"ty": 1, "ip": 0, "op": 10, "sc": "#3366ff", "sw": 16, "sh": 16}
]}"##;

fn exe() -> Command {
    Command::new(env!("CARGO_BIN_EXE_sticker-gif"))
}

#[test]
fn cli_frame_writes_png() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("square.json");
    let out = dir.path().join("frame.png");
    std::fs::write(&doc, SQUARE).unwrap();

    let status = exe()
        .args(["frame", "--in"])
        .arg(&doc)
        .args(["--frame", "3", "--out"])
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let img = image::open(&out).unwrap().to_rgba8();
    assert_eq!(img.dimensions(), (16, 16));
    assert_eq!(img.get_pixel(8, 8).0, [0x33, 0x66, 0xff, 255]);
}

#[test]
fn cli_probe_prints_metadata_json() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("square.json");
    std::fs::write(&doc, SQUARE).unwrap();

    let output = exe().args(["probe", "--in"]).arg(&doc).output().unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["kind"], "lottie");
    assert_eq!(report["width"], 16);
    assert_eq!(report["frame_count"], 10);
}

#[test]
fn cli_rejects_unknown_input() {
    let dir = tempfile::tempdir().unwrap();
    let doc = dir.path().join("not-a-sticker.bin");
    std::fs::write(&doc, b"GIF89a").unwrap();

    let output = exe()
        .args(["convert", "--in"])
        .arg(&doc)
        .args(["--out"])
        .arg(dir.path().join("x.gif"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("neither a Lottie"));
}
