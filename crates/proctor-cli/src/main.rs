use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use image::DynamicImage;
use proctor_core::codec::decode_bytes;
use proctor_core::{
    ComparatorKind, Fingerprint, InMemorySessionStore, MonitorConfig, MovementMonitor,
    MovementReport,
};

// D-Bus proxy for the daemon; `#[zbus::proxy]` generates `ProctorProxy`.
#[zbus::proxy(
    interface = "org.proctor.Proctor1",
    default_service = "org.proctor.Proctor1",
    default_path = "/org/proctor/Proctor1"
)]
trait Proctor {
    fn register(&self, user_id: &str, name: &str, image: &str) -> zbus::Result<String>;
    fn verify(&self, image: &str, user_id: &str) -> zbus::Result<String>;
    fn monitor_identity(&self, user_id: &str, image: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn remove_face(&self, user_id: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "proctor", about = "Proctor face verification and monitoring CLI")]
struct Cli {
    /// Talk to a daemon on the session bus (development mode)
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fingerprint of an image
    Fingerprint { image: PathBuf },
    /// Score the similarity of two images
    Compare {
        a: PathBuf,
        b: PathBuf,
        /// Comparison strategy: "region" or "ssim"
        #[arg(short, long, default_value = "region")]
        comparator: ComparatorKind,
    },
    /// Replay a sequence of frames through the movement monitor
    Replay {
        frames: Vec<PathBuf>,
        /// Simulated time between frames
        #[arg(short, long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(short, long, default_value = "region")]
        comparator: ComparatorKind,
    },
    /// Register a reference face with the daemon
    Register {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        name: String,
        image: PathBuf,
    },
    /// Identify a face, optionally claiming a user
    Verify {
        image: PathBuf,
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Check that an image still shows a registered user
    Monitor {
        #[arg(short, long)]
        user: String,
        image: PathBuf,
    },
    /// Show daemon status
    Status,
    /// Remove a registered face
    Remove { user: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fingerprint { image } => {
            println!("{}", Fingerprint::of(&load_image(&image)?));
        }
        Commands::Compare { a, b, comparator } => {
            let engine = comparator.build();
            let score = engine.compare(&load_image(&a)?, &load_image(&b)?);
            println!("{}: {score:.4}", engine.name());
        }
        Commands::Replay {
            frames,
            interval_ms,
            comparator,
        } => {
            let images = frames
                .iter()
                .map(|p| load_image(p))
                .collect::<Result<Vec<_>>>()?;
            let reports = replay(
                comparator,
                &images,
                Duration::milliseconds(interval_ms as i64),
                Utc::now(),
            );
            for (path, report) in frames.iter().zip(&reports) {
                println!(
                    "{}  movement={:.4} raw={:.4} detected={} consecutive={:.1}{}",
                    path.display(),
                    report.movement,
                    report.raw_movement,
                    report.movement_detected,
                    report.consecutive_movements,
                    report
                        .warning
                        .map(|w| format!("  warning={w}"))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Register { user, name, image } => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.register(&user, &name, &encode_file(&image)?).await?);
        }
        Commands::Verify { image, user } => {
            let proxy = connect(cli.session_bus).await?;
            let user = user.unwrap_or_default();
            print_json(&proxy.verify(&encode_file(&image)?, &user).await?);
        }
        Commands::Monitor { user, image } => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.monitor_identity(&user, &encode_file(&image)?).await?);
        }
        Commands::Status => {
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.status().await?);
        }
        Commands::Remove { user } => {
            let proxy = connect(cli.session_bus).await?;
            if proxy.remove_face(&user).await? {
                println!("removed {user}");
            } else {
                println!("no face registered for {user}");
            }
        }
    }

    Ok(())
}

async fn connect(session_bus: bool) -> Result<ProctorProxy<'static>> {
    tracing::debug!(session_bus, "connecting to proctord");
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    Ok(ProctorProxy::new(&conn).await?)
}

fn load_image(path: &Path) -> Result<DynamicImage> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let image =
        decode_bytes(&bytes).with_context(|| format!("failed to decode {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        "image loaded"
    );
    Ok(image)
}

fn encode_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn print_json(body: &str) {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => println!("{value:#}"),
        Err(_) => println!("{body}"),
    }
}

/// Feed frames through a fresh monitor session, `interval` apart.
fn replay(
    comparator: ComparatorKind,
    frames: &[DynamicImage],
    interval: Duration,
    start: DateTime<Utc>,
) -> Vec<MovementReport> {
    let sessions = Arc::new(InMemorySessionStore::default());
    let monitor = MovementMonitor::new(comparator.build(), sessions, MonitorConfig::default());
    frames
        .iter()
        .enumerate()
        .map(|(i, frame)| monitor.observe("replay", frame, start + interval * i as i32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use image::{GrayImage, Luma};
    use proctor_core::Warning;

    fn flat(value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 64, Luma([value])))
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_compare_with_comparator() {
        let cli = Cli::try_parse_from(["proctor", "compare", "a.png", "b.png", "-c", "ssim"]).unwrap();
        match cli.command {
            Commands::Compare { comparator, .. } => assert_eq!(comparator, ComparatorKind::SsimBlend),
            _ => panic!("expected compare"),
        }
        assert!(Cli::try_parse_from(["proctor", "compare", "a.png", "b.png", "-c", "cnn"]).is_err());
    }

    #[test]
    fn test_replay_still_frames() {
        let frames = vec![flat(120); 5];
        let reports = replay(
            ComparatorKind::default(),
            &frames,
            Duration::milliseconds(1000),
            Utc::now(),
        );
        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| r.success && !r.movement_detected));
        assert!(reports.iter().all(|r| r.warning.is_none()));
        assert_eq!(reports[4].history_size, 4);
    }

    #[test]
    fn test_load_image_and_encode_file() {
        let path = std::env::temp_dir().join(format!("proctor-cli-{}.png", std::process::id()));
        let png = proctor_core::codec::encode_png(&flat(90)).unwrap();
        std::fs::write(&path, &png).unwrap();

        let image = load_image(&path).unwrap();
        assert_eq!((image.width(), image.height()), (64, 64));
        let encoded = encode_file(&path).unwrap();
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(encoded).unwrap(),
            png
        );
        std::fs::remove_file(&path).unwrap();

        let err = load_image(&path).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_replay_tiny_frame_is_face_missing() {
        let tiny = DynamicImage::ImageLuma8(GrayImage::new(4, 4));
        let reports = replay(
            ComparatorKind::default(),
            &[flat(10), tiny],
            Duration::milliseconds(1000),
            Utc::now(),
        );
        assert_eq!(reports[1].warning, Some(Warning::FaceMissing));
    }
}
