use std::env;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use biogate::config::{self, Config};
use biogate::devices::simulated::{card_code, face_pattern, fingerprint_pattern};
use biogate::devices::{DeviceDriver, SimulatedDriver};
use biogate::storage::{FileRepository, MemoryRepository, TemplateRepository};
use biogate::{DeviceConfig, DeviceKind, Engine, Frame, IdentityId, Modality, Payload};
use clap::{Parser, Subcommand};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "biogate")]
#[command(
    version,
    about = "Biometric identity and capture device orchestration"
)]
struct Cli {
    /// Config file (defaults to the installed location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run simulated devices against synthetic enrolled subjects
    Simulate {
        /// Number of cameras
        #[arg(long, default_value_t = 2)]
        cameras: usize,
        /// Number of fingerprint readers
        #[arg(long, default_value_t = 1)]
        readers: usize,
        /// Number of card readers
        #[arg(long, default_value_t = 1)]
        doors: usize,
        /// Subjects to enroll before capture starts
        #[arg(long, default_value_t = 3)]
        subjects: u64,
        /// How long to capture
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Execute JSON commands, one per line
    Dispatch {
        /// Command file (defaults to stdin)
        file: Option<PathBuf>,
    },
    /// Remove all templates for an identity
    Purge {
        /// Identity to purge
        #[arg(short, long)]
        identity: String,
    },
    /// Open config file in editor
    Config {
        /// Print the effective configuration instead
        #[arg(long)]
        print: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            cameras,
            readers,
            doors,
            subjects,
            seconds,
        } => simulate(cfg, [cameras, readers, doors], subjects, seconds).await,
        Commands::Dispatch { file } => dispatch(cfg, file).await,
        Commands::Purge { identity } => purge(&cfg, &identity),
        Commands::Config { print } => {
            if print {
                print!("{}", toml::to_string_pretty(&cfg)?);
                Ok(())
            } else {
                open_config(cli.config)
            }
        }
    }
}

fn enroll_subject(engine: &Engine, subject: u64) -> Result<()> {
    let identity = IdentityId::new(format!("subject-{subject:03}"))?;
    let face = Frame::new("enrollment", 0.95, face_pattern(subject, 0.55)).with_brightness(0.55);
    let finger = Frame::new(
        "enrollment",
        0.95,
        Payload::Minutiae {
            points: fingerprint_pattern(subject, 40),
        },
    );
    let card = Frame::new(
        "enrollment",
        1.0,
        Payload::Card {
            code: card_code(subject),
        },
    );
    engine.enroll(&identity, Modality::Face, &face)?;
    engine.enroll(&identity, Modality::Fingerprint, &finger)?;
    engine.enroll(&identity, Modality::Card, &card)?;
    Ok(())
}

async fn simulate(cfg: Config, counts: [usize; 3], subjects: u64, seconds: u64) -> Result<()> {
    let driver = Arc::new(SimulatedDriver::new());
    let engine = Engine::builder(cfg)
        .driver(driver.clone())
        .repository(Arc::new(MemoryRepository::new()))
        .build()
        .context("Failed to start engine")?;

    info!("Enrolling {} simulated subjects", subjects);
    for subject in 1..=subjects {
        enroll_subject(&engine, subject)?;
    }

    // half of the traffic comes from strangers
    let population: Vec<u64> = (1..=subjects).chain(1000..1000 + subjects.max(1)).collect();
    let kinds = [
        ("cam", DeviceKind::Camera),
        ("fp", DeviceKind::FingerprintReader),
        ("door", DeviceKind::CardReader),
    ];
    let mut ids = Vec::new();
    for ((prefix, kind), count) in kinds.into_iter().zip(counts) {
        for n in 1..=count {
            let id = format!("{prefix}-{n}");
            engine.register_device(DeviceConfig::new(&id, kind).at("simulation"))?;
            driver.set_subjects(&id, population.clone());
            engine.connect_device(&id).await?;
            engine.start_capture(&id).await?;
            ids.push(id);
        }
    }

    info!("Capturing on {} devices for {}s...", ids.len(), seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    for id in &ids {
        if let Err(e) = engine.stop_capture(id).await {
            warn!("{}: {}", id, e);
        }
    }
    // let the recognition queue drain
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("{}", serde_json::to_string_pretty(&engine.recognition_stats())?);
    println!("{}", serde_json::to_string_pretty(&engine.device_stats().await)?);
    println!("{}", serde_json::to_string_pretty(&engine.health_all().await)?);
    println!("{}", serde_json::to_string_pretty(&engine.anomalies(None, None))?);

    engine.shutdown().await;
    info!("✓ Simulation finished");
    Ok(())
}

fn default_driver() -> Arc<dyn DeviceDriver> {
    #[cfg(feature = "v4l")]
    {
        Arc::new(biogate::devices::V4lDriver::new())
    }
    #[cfg(not(feature = "v4l"))]
    {
        Arc::new(SimulatedDriver::new())
    }
}

async fn dispatch(cfg: Config, file: Option<PathBuf>) -> Result<()> {
    let input = match &file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let engine = Engine::builder(cfg)
        .driver(default_driver())
        .build()
        .context("Failed to start engine")?;

    for line in input
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
    {
        let response = engine.dispatch_json(line).await;
        println!("{}", serde_json::to_string(&response)?);
    }

    engine.shutdown().await;
    Ok(())
}

fn purge(cfg: &Config, identity: &str) -> Result<()> {
    let identity = IdentityId::new(identity)?;
    let repository = FileRepository::new(cfg.storage.template_dir());
    info!("Purging templates for {} in {}", identity, repository.root().display());

    repository
        .purge(&identity)
        .context("Failed to purge templates")?;

    info!("✓ All templates purged for {}", identity);
    Ok(())
}

fn open_config(path: Option<PathBuf>) -> Result<()> {
    let config_path = path.unwrap_or_else(|| config::CONFIG_PATH.to_path_buf());
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(&config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
