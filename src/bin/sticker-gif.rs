use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use sticker_gif::{
    CancelToken, MediaBackend, StickerConfig, StickerJob, StickerKind,
    lottie::{LottieRasterizer, Scene, parse_composition},
};

#[derive(Parser, Debug)]
#[command(name = "sticker-gif", version)]
struct Cli {
    /// JSON config file; `STICKER_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a Lottie or WebM sticker to GIF through the frame pipeline.
    Convert(ConvertArgs),
    /// Transcode a WebM sticker to GIF in a single ffmpeg pass.
    Transcode(TranscodeArgs),
    /// Rasterize one Lottie frame to PNG.
    Frame(FrameArgs),
    /// Print sticker metadata as JSON.
    Probe(ProbeArgs),
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Input sticker (Lottie JSON or WebM).
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output GIF path.
    #[arg(long)]
    out: PathBuf,

    /// Output frame rate; defaults to the source rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Keep black video backgrounds opaque.
    #[arg(long)]
    opaque: bool,
}

#[derive(Parser, Debug)]
struct TranscodeArgs {
    /// Input WebM sticker.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output GIF path.
    #[arg(long)]
    out: PathBuf,

    /// Cap on either output side.
    #[arg(long)]
    max_dimension: Option<u32>,

    /// Also save the first frame as PNG here.
    #[arg(long)]
    preview_out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct FrameArgs {
    /// Input Lottie JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Frame index (0-based).
    #[arg(long)]
    frame: u64,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    /// Input sticker (Lottie JSON or WebM).
    #[arg(long = "in")]
    in_path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    match cli.cmd {
        Command::Convert(args) => cmd_convert(args, config),
        Command::Transcode(args) => cmd_transcode(args, config),
        Command::Frame(args) => cmd_frame(args),
        Command::Probe(args) => cmd_probe(args, config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StickerConfig> {
    let base = match path {
        Some(p) => StickerConfig::from_path(p)?,
        None => StickerConfig::default(),
    };
    let config = base.from_env();
    config.validate()?;
    Ok(config)
}

fn read_input(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read sticker '{}'", path.display()))
}

fn job_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sticker".to_owned())
}

fn backend(config: &StickerConfig) -> Arc<dyn MediaBackend> {
    Arc::new(config.media_backend())
}

fn cmd_convert(args: ConvertArgs, mut config: StickerConfig) -> anyhow::Result<()> {
    if let Some(fps) = args.fps {
        config.fps = Some(fps);
    }
    if args.opaque {
        config.transparentize = false;
    }
    let bytes = read_input(&args.in_path)?;
    let backend = backend(&config);
    let job = StickerJob::new(job_id(&args.in_path), bytes, &args.out, config)?;
    let out = sticker_gif::run_job(&job, backend, CancelToken::new())?;
    eprintln!(
        "wrote {} ({} frames, {}x{})",
        args.out.display(),
        out.frames,
        out.metadata.width,
        out.metadata.height
    );
    Ok(())
}

fn cmd_transcode(args: TranscodeArgs, mut config: StickerConfig) -> anyhow::Result<()> {
    if let Some(max) = args.max_dimension {
        config.max_dimension = max;
    }
    // Nothing to hand the preview to without an output path.
    config.preview &= args.preview_out.is_some();
    let bytes = read_input(&args.in_path)?;
    let job = StickerJob::new(job_id(&args.in_path), bytes, &args.out, config)?;
    let preview_out = args.preview_out.clone();
    sticker_gif::transcode_webm(&job, |preview| {
        if let Some(dst) = preview_out.as_deref() {
            std::fs::copy(preview, dst)?;
            eprintln!("wrote preview {}", dst.display());
        }
        Ok(())
    })?;
    eprintln!("wrote {}", args.out.display());
    Ok(())
}

fn cmd_frame(args: FrameArgs) -> anyhow::Result<()> {
    let bytes = read_input(&args.in_path)?;
    let model = parse_composition(&bytes)?;
    let raster = LottieRasterizer::new(Scene::from_model(&model)?)?;
    let img = raster.render(args.frame)?.into_rgba_image()?;
    img.save(&args.out)
        .with_context(|| format!("write png '{}'", args.out.display()))?;
    eprintln!("wrote {}", args.out.display());
    Ok(())
}

#[derive(serde::Serialize)]
struct ProbeReport {
    kind: StickerKind,
    #[serde(flatten)]
    metadata: sticker_gif::AnimationMetadata,
}

fn cmd_probe(args: ProbeArgs, config: StickerConfig) -> anyhow::Result<()> {
    let bytes = read_input(&args.in_path)?;
    let backend = backend(&config);
    let job = StickerJob::new(job_id(&args.in_path), bytes, "", config)?;
    let mut source = job.frame_source(backend);
    let metadata = source.initialize();
    source.release();
    let report = ProbeReport {
        kind: job.kind,
        metadata: metadata?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
