//! Command-line front end.

use std::{fs, future, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::broadcast::error::RecvError;

use crate::{
    aggregate::{summarize_history, TrendDirection},
    capture::{CameraSource, LocalCamera, NetworkCamera, ResolutionTier, SyntheticCamera},
    config::AppConfig,
    health::HealthMonitor,
    records::{HttpRecordStore, RecordStore},
    report::{HeartRateStatus, Thresholds},
    session::{SessionController, SessionEvent, SessionOptions},
    settings::{default_settings_path, CameraKind, MonitorSettings, SettingsStore},
    telemetry::WsConnector,
    vitals::LiveVitals,
};

#[derive(Parser, Debug)]
#[command(name = "pulsecam")]
#[command(about = "Camera-based heart-rate monitoring client")]
#[command(version)]
pub struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream the camera to the vitals service and print live readings
    Monitor {
        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Write the session report as JSON to this path instead of stdout
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Save the session to the record store when done
        #[arg(long)]
        save: bool,

        /// Access token for --save (falls back to PULSECAM_TOKEN)
        #[arg(long)]
        token: Option<String>,

        /// Override the stored resolution (1080p, 720p or 480p)
        #[arg(long)]
        resolution: Option<ResolutionTier>,

        /// Use a generated test pattern instead of a camera
        #[arg(long)]
        synthetic: bool,
    },

    /// List saved sessions with summary statistics
    History {
        /// Access token (falls back to PULSECAM_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },

    /// Sign in and print an access token
    Login {
        #[arg(short, long)]
        username: String,

        #[arg(short, long)]
        password: String,
    },

    /// Show or update the normal heart-rate range
    Thresholds {
        #[arg(long)]
        min: Option<u32>,

        #[arg(long)]
        max: Option<u32>,
    },
}

pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
    let settings = SettingsStore::new(cli.settings.unwrap_or_else(default_settings_path));

    match cli.command {
        Command::Monitor {
            duration,
            report,
            save,
            token,
            resolution,
            synthetic,
        } => {
            let options = MonitorOptions {
                duration: duration.map(Duration::from_secs),
                report,
                save,
                token: resolve_token(token),
                resolution,
                synthetic,
            };
            monitor(&config, &settings, options).await
        }
        Command::History { token } => history(&config, resolve_token(token)).await,
        Command::Login { username, password } => {
            let token = HttpRecordStore::login(&config.api_url, &username, &password).await?;
            println!("{token}");
            Ok(())
        }
        Command::Thresholds { min, max } => thresholds(&settings, min, max),
    }
}

fn resolve_token(token: Option<String>) -> Option<String> {
    token.or_else(|| {
        std::env::var("PULSECAM_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty())
    })
}

struct MonitorOptions {
    duration: Option<Duration>,
    report: Option<PathBuf>,
    save: bool,
    token: Option<String>,
    resolution: Option<ResolutionTier>,
    synthetic: bool,
}

pub fn camera_source(settings: &MonitorSettings, synthetic: bool) -> CameraSource {
    if synthetic {
        return CameraSource::Synthetic(SyntheticCamera::new());
    }
    match settings.camera {
        CameraKind::Local => CameraSource::Local(LocalCamera::new(settings.device.clone())),
        CameraKind::Network => CameraSource::Network(NetworkCamera::new(settings.stream_url.clone())),
    }
}

fn format_reading(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(value) => format!("{value:.1}{unit}"),
        None => "--".into(),
    }
}

fn vitals_line(vitals: &LiveVitals, thresholds: &Thresholds) -> String {
    let status = match vitals.bpm.map(|bpm| thresholds.classify(bpm)) {
        Some(HeartRateStatus::Normal) => "normal",
        Some(HeartRateStatus::Below) => "LOW",
        Some(HeartRateStatus::Above) => "HIGH",
        None => "waiting",
    };
    format!(
        "HR {} ({status})  SpO2 {}  RR {}  SNR {}  light {}  quality {}",
        format_reading(vitals.bpm, " bpm"),
        format_reading(vitals.spo2, "%"),
        format_reading(vitals.resp_rate, "/min"),
        format_reading(vitals.snr, " dB"),
        format_reading(vitals.lighting, ""),
        vitals.signal_quality.as_deref().unwrap_or("--"),
    )
}

async fn monitor(config: &AppConfig, store: &SettingsStore, options: MonitorOptions) -> Result<()> {
    if options.save && options.token.is_none() {
        bail!("--save needs an access token; run `pulsecam login` first");
    }

    let settings = store.settings();
    let thresholds = settings.thresholds;
    let controller = SessionController::new(
        camera_source(&settings, options.synthetic),
        WsConnector::new(config.telemetry_url.clone()),
        SessionOptions {
            tier: options.resolution.unwrap_or(settings.resolution),
            encoder: config.encoder,
        },
    );

    let mut health = HealthMonitor::new(
        format!("{}/", config.backend_url),
        config.health_interval,
        config.health_timeout,
    );
    health.start()?;

    let mut events = controller.subscribe();
    let mut vitals = controller.vitals();
    let session_id = controller
        .start()
        .await
        .context("Failed to start monitoring")?;
    println!("Monitoring session {session_id}; press Ctrl-C to stop");

    let deadline = async {
        match options.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut ctrl_c => break,
            changed = vitals.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = vitals.borrow_and_update().clone();
                println!("{}", vitals_line(&snapshot, &thresholds));
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Failed { message }) => {
                    eprintln!("Session ended: {message}");
                    break;
                }
                Ok(SessionEvent::StateChanged { .. }) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    controller.stop().await;
    health.stop().await?;

    let report = controller.generate_report(thresholds).await?;
    let json = serde_json::to_string_pretty(&report)?;
    match &options.report {
        Some(path) => {
            fs::write(path, &json)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }

    if let (true, Some(token)) = (options.save, options.token) {
        let records = HttpRecordStore::new(config.api_url.clone(), token);
        match controller.save_session(&records).await {
            Ok(record) => println!("Saved as record {}", record.id),
            Err(err) if err.is_authorization_expired() => {
                bail!("{err}; run `pulsecam login` and try again")
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn history(config: &AppConfig, token: Option<String>) -> Result<()> {
    let token = token.context("history needs an access token; run `pulsecam login` first")?;
    let records = HttpRecordStore::new(config.api_url.clone(), token)
        .list_records()
        .await?;

    for record in &records {
        println!(
            "{}  {}-{}  {:>6.1} bpm  {}",
            record.date, record.start_time, record.end_time, record.avg_bpm, record.signal_quality
        );
    }

    let summary = summarize_history(&records);
    println!(
        "sessions {}  average {}  max {}  min {}",
        records.len(),
        format_reading(summary.overall_avg, " bpm"),
        format_reading(summary.max_avg, " bpm"),
        format_reading(summary.min_avg, " bpm"),
    );
    if let Some(trend) = summary.trend {
        let arrow = match trend.direction {
            TrendDirection::Up => "up",
            TrendDirection::Down => "down",
        };
        println!("trend {arrow} {:.1}% against the previous session", trend.percent);
    }
    Ok(())
}

fn thresholds(store: &SettingsStore, min: Option<u32>, max: Option<u32>) -> Result<()> {
    if min.is_some() || max.is_some() {
        let current = store.thresholds();
        let updated = Thresholds::new(
            min.unwrap_or(current.min_hr()),
            max.unwrap_or(current.max_hr()),
        )?;
        store.update_thresholds(updated)?;
        info!("Thresholds saved to {}", store.path().display());
    }
    let thresholds = store.thresholds();
    println!(
        "normal heart rate: above {} and below {} bpm",
        thresholds.min_hr(),
        thresholds.max_hr()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_monitor_flags() {
        let cli = Cli::try_parse_from([
            "pulsecam",
            "monitor",
            "--duration",
            "30",
            "--save",
            "--token",
            "abc",
            "--resolution",
            "720p",
        ])
        .unwrap();
        match cli.command {
            Command::Monitor {
                duration,
                save,
                token,
                resolution,
                synthetic,
                ..
            } => {
                assert_eq!(duration, Some(30));
                assert!(save);
                assert_eq!(token.as_deref(), Some("abc"));
                assert_eq!(resolution, Some(ResolutionTier::Medium));
                assert!(!synthetic);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_resolution_is_rejected() {
        assert!(Cli::try_parse_from(["pulsecam", "monitor", "--resolution", "4k"]).is_err());
    }

    #[test]
    fn login_takes_short_flags() {
        let cli = Cli::try_parse_from(["pulsecam", "login", "-u", "ada", "-p", "secret"]).unwrap();
        match cli.command {
            Command::Login { username, password } => {
                assert_eq!(username, "ada");
                assert_eq!(password, "secret");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn camera_follows_settings() {
        let mut settings = MonitorSettings::default();
        assert!(matches!(camera_source(&settings, false), CameraSource::Local(_)));
        settings.camera = CameraKind::Network;
        assert!(matches!(camera_source(&settings, false), CameraSource::Network(_)));
        assert!(matches!(camera_source(&settings, true), CameraSource::Synthetic(_)));
    }

    #[test]
    fn vitals_line_shows_missing_values() {
        let thresholds = Thresholds::default();
        let line = vitals_line(&LiveVitals::default(), &thresholds);
        assert!(line.starts_with("HR -- (waiting)"));

        let vitals = LiveVitals {
            bpm: Some(230.0),
            ..LiveVitals::default()
        };
        assert!(vitals_line(&vitals, &thresholds).contains("(HIGH)"));
    }

    #[test]
    fn thresholds_command_updates_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));
        thresholds(&store, Some(50), None).unwrap();
        assert_eq!(store.thresholds().min_hr(), 50);
        assert_eq!(store.thresholds().max_hr(), 220);
        assert!(thresholds(&store, Some(300), None).is_err());
        assert_eq!(store.thresholds().min_hr(), 50);
    }
}
