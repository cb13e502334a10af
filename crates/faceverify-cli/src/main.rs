use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceverify_core::image_io;
use faceverify_core::{FaceCrop, FaceVerifier, Rect};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(
    name = "faceverify",
    version,
    about = "Check whether two photos show the same person"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Haar cascade (OpenCV XML or JSON) used for face detection
    #[arg(long, global = true)]
    cascade: Option<PathBuf>,

    /// ONNX embedding network
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide whether two images show the same person
    Verify {
        image1: PathBuf,
        image2: PathBuf,
        /// Distance below which the faces match
        #[arg(short, long)]
        threshold: Option<f32>,
        /// Write the two normalized face crops into this directory
        #[arg(long)]
        save_crops: Option<PathBuf>,
    },
    /// Print the embedding distance between the faces of two images
    Distance { image1: PathBuf, image2: PathBuf },
    /// List every face the detector finds in an image
    Detect { image: PathBuf },
    /// Print the embedding of the single face in an image
    Embed { image: PathBuf },
}

#[derive(Serialize)]
struct VerifyReport {
    distance: f32,
    threshold: f32,
    is_match: bool,
    faces: [Rect; 2],
}

#[derive(Serialize)]
struct DistanceReport {
    distance: f32,
    faces: [Rect; 2],
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(cascade) = cli.cascade {
        config.cascade = Some(cascade);
    }
    if let Some(model) = cli.model {
        config.model = Some(model);
    }

    let mut verifier = FaceVerifier::new(
        config.cascade_path(),
        config.model_path(),
        config.verify_params(),
        config.embedder.clone(),
    )?;
    tracing::debug!(
        cascade = %config.cascade_path().display(),
        model = %config.model_path().display(),
        "faceverify configured"
    );

    match cli.command {
        Commands::Verify { image1, image2, threshold, save_crops } => {
            let threshold = threshold.unwrap_or(config.verify.threshold);
            let result = verifier.verify_with_threshold(&image1, &image2, threshold)?;
            let comparison = &result.comparison;

            if let Some(dir) = save_crops {
                save_crop_pair(&dir, &comparison.first, &comparison.second)?;
            }

            if cli.json {
                print_json(&VerifyReport {
                    distance: comparison.distance,
                    threshold: result.threshold,
                    is_match: result.is_match,
                    faces: [comparison.first.region, comparison.second.region],
                })?;
            } else {
                let verdict = if result.is_match { "same person" } else { "different people" };
                println!(
                    "{verdict} (distance {:.4}, threshold {:.4})",
                    comparison.distance, result.threshold
                );
            }

            Ok(if result.is_match { ExitCode::SUCCESS } else { ExitCode::from(1) })
        }
        Commands::Distance { image1, image2 } => {
            let comparison = verifier.get_distance(&image1, &image2)?;
            if cli.json {
                print_json(&DistanceReport {
                    distance: comparison.distance,
                    faces: [comparison.first.region, comparison.second.region],
                })?;
            } else {
                println!("{:.6}", comparison.distance);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Detect { image } => {
            let decoded = image_io::load_image(&image)?;
            let faces = verifier.detect_faces(&decoded)?;
            if cli.json {
                print_json(&faces)?;
            } else if faces.is_empty() {
                println!("no faces detected");
            } else {
                for (i, face) in faces.iter().enumerate() {
                    println!(
                        "face {}: x={} y={} {}x{} neighbors={}",
                        i + 1,
                        face.x,
                        face.y,
                        face.width,
                        face.height,
                        face.confidence
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Embed { image } => {
            let (_, embedding) = verifier.embed_image(&image)?;
            if cli.json {
                print_json(&embedding)?;
            } else {
                let values: Vec<String> = embedding.values.iter().map(|v| format!("{v:.6}")).collect();
                println!("{}", values.join(" "));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn save_crop_pair(dir: &Path, first: &FaceCrop, second: &FaceCrop) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    for (name, crop) in [("face1.png", first), ("face2.png", second)] {
        let path = dir.join(name);
        crop.image
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "face crop saved");
    }
    Ok(())
}
