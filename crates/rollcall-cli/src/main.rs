use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use rollcall_capture::{decode_image, DirectorySource, Frame};
use rollcall_core::stability::{ProbeHandler, StabilityDetector};
use rollcall_core::{
    AttendanceEvent, AttendanceOutcome, CommandOracle, DescriptorOracle, Fault, Identity, Kiosk,
    KioskConfig, MatchVerdict, NewIdentity, RecordStore, SqliteStore,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// `#[zbus::proxy]` generates `RollCallProxy`; only the calls the CLI needs are declared.
#[zbus::proxy(
    interface = "org.freedesktop.RollCall1",
    default_service = "org.freedesktop.RollCall1",
    default_path = "/org/freedesktop/RollCall1"
)]
trait RollCall {
    async fn pause(&self) -> zbus::Result<bool>;
    async fn resume(&self) -> zbus::Result<bool>;
    async fn reload(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "RollCall attendance kiosk CLI")]
struct Cli {
    /// Record store path (defaults to the configured database)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity from a reference image
    Enroll {
        /// Identifier from the upstream user directory
        #[arg(long)]
        user_id: String,
        /// Name shown on the kiosk
        #[arg(long)]
        name: String,
        /// Reference image (PNG, JPEG, ...)
        #[arg(long)]
        image: PathBuf,
        /// Scheduled shift start, HH:MM
        #[arg(long, value_parser = parse_hhmm)]
        shift_start: Option<NaiveTime>,
        /// Scheduled shift end, HH:MM
        #[arg(long, value_parser = parse_hhmm)]
        shift_end: Option<NaiveTime>,
        /// Minutes after shift start still counted as on time
        #[arg(long, default_value_t = 0)]
        grace: u32,
    },
    /// List enrolled identities
    List,
    /// Remove an enrolled identity (attendance history is kept)
    Remove {
        /// External user id to remove
        user_id: String,
    },
    /// Replace the shift schedule of an identity
    Shift {
        user_id: String,
        #[arg(long, value_parser = parse_hhmm)]
        start: Option<NaiveTime>,
        #[arg(long, value_parser = parse_hhmm)]
        end: Option<NaiveTime>,
        #[arg(long, default_value_t = 0)]
        grace: u32,
    },
    /// Show attendance events for a day
    History {
        /// Date, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Only events for this user
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Match one image and record the outcome
    CheckIn {
        #[arg(long)]
        image: PathBuf,
        /// Match only; record nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the stability detector over a directory of captured frames
    Replay {
        #[arg(long)]
        frames: PathBuf,
        /// Match only; record nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show daemon status
    Status,
    /// Pause live sampling in the daemon
    Pause,
    /// Resume live sampling in the daemon
    Resume,
    /// Ask the daemon to rebuild its candidate index
    Reload,
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("expected HH:MM: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = KioskConfig::load()?;
    if let Some(db) = &cli.db {
        config.store.db_path = db.clone();
    }

    match cli.command {
        Commands::Enroll {
            user_id,
            name,
            image,
            shift_start,
            shift_end,
            grace,
        } => {
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("reading {}", image.display()))?;
            decode_image(&bytes).with_context(|| format!("decoding {}", image.display()))?;

            let store = open_store(&config).await?;
            let identity = store
                .enroll(
                    NewIdentity::new(user_id, name).with_shift(shift_start, shift_end, grace),
                    bytes,
                )
                .await?;
            println!("Enrolled {} ({})", identity.external_user_id, identity.id);
            notify_daemon(cli.system_bus).await;
        }
        Commands::List => {
            let store = open_store(&config).await?;
            let identities = store.list_identities().await?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in &identities {
                println!("{}", describe_identity(identity));
            }
        }
        Commands::Remove { user_id } => {
            let store = open_store(&config).await?;
            let removed = store.remove_identity(&user_id).await?;
            println!("Removed {} ({})", removed.external_user_id, removed.id);
            notify_daemon(cli.system_bus).await;
        }
        Commands::Shift {
            user_id,
            start,
            end,
            grace,
        } => {
            let store = open_store(&config).await?;
            let identity = store.update_shift(&user_id, start, end, grace).await?;
            println!("{}", describe_identity(&identity));
            notify_daemon(cli.system_bus).await;
        }
        Commands::History { date, user_id } => {
            let store = open_store(&config).await?;
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let names: HashMap<_, _> = store
                .list_identities()
                .await?
                .into_iter()
                .map(|i| (i.id, i.external_user_id))
                .collect();

            let filter = match &user_id {
                Some(user) => Some(
                    store
                        .find_identity_by_user_id(user)
                        .await?
                        .with_context(|| format!("unknown user {user}"))?
                        .id,
                ),
                None => None,
            };

            let events = store.list_events_on_date(date).await?;
            let mut shown = 0;
            for event in events
                .iter()
                .filter(|e| filter.is_none() || e.identity_id == filter)
            {
                println!("{}", describe_event(event, &names));
                shown += 1;
            }
            if shown == 0 {
                println!("No events on {date}");
            }
        }
        Commands::CheckIn { image, dry_run } => {
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("reading {}", image.display()))?;
            let probe = decode_image(&bytes).with_context(|| format!("decoding {}", image.display()))?;

            let kiosk = open_kiosk(&config).await?;
            let verdict = kiosk.match_probe(&probe).await?;
            if dry_run {
                println!("{}", serde_json::to_string_pretty(&verdict)?);
            } else {
                let outcome = kiosk
                    .record_attendance(&verdict, Local::now().naive_local())
                    .await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
        }
        Commands::Replay { frames, dry_run } => {
            replay(&config, &frames, dry_run).await?;
        }
        Commands::Status => {
            let proxy = daemon(cli.system_bus).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Pause => {
            let proxy = daemon(cli.system_bus).await?;
            if proxy.pause().await? {
                println!("Sampling paused");
            } else {
                println!("Sampling was already paused");
            }
        }
        Commands::Resume => {
            let proxy = daemon(cli.system_bus).await?;
            if proxy.resume().await? {
                println!("Sampling resumed");
            } else {
                println!("Sampling was not paused");
            }
        }
        Commands::Reload => {
            let proxy = daemon(cli.system_bus).await?;
            println!("{} identities indexed", proxy.reload().await?);
        }
    }

    Ok(())
}

async fn open_store(config: &KioskConfig) -> Result<Arc<SqliteStore>> {
    let path = &config.store.db_path;
    let store = SqliteStore::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn open_kiosk(config: &KioskConfig) -> Result<Kiosk> {
    let Some(oracle) = CommandOracle::from_config(&config.oracle) else {
        bail!("no descriptor oracle configured (set ROLLCALL_ORACLE_COMMAND)");
    };
    let store = open_store(config).await?;
    Ok(Kiosk::new(
        store as Arc<dyn RecordStore>,
        Arc::new(oracle) as Arc<dyn DescriptorOracle>,
        config,
    ))
}

async fn daemon(system_bus: bool) -> Result<RollCallProxy<'static>> {
    let connection = if system_bus {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    Ok(RollCallProxy::new(&connection).await?)
}

/// Ask a running daemon to pick up enrollment changes. A missing daemon is fine.
async fn notify_daemon(system_bus: bool) {
    let result = async { daemon(system_bus).await?.reload().await.map_err(anyhow::Error::from) }.await;
    match result {
        Ok(count) => println!("Daemon reloaded ({count} identities)"),
        Err(e) => tracing::debug!(error = %e, "daemon not reloaded"),
    }
}

/// Matches triggered frames without recording anything.
struct DryRun<'a> {
    kiosk: &'a Kiosk,
}

#[async_trait]
impl ProbeHandler for DryRun<'_> {
    async fn handle_probe(
        &self,
        frame: Frame,
        _cancel: &CancellationToken,
    ) -> Result<Option<AttendanceOutcome>, Fault> {
        let verdict = self.kiosk.match_probe(&frame.image).await?;
        println!("frame {:>5}: {}", frame.sequence, describe_verdict(&verdict));
        Ok(None)
    }
}

/// Records triggered frames and prints each outcome as it happens.
struct Recording<'a> {
    kiosk: &'a Kiosk,
}

#[async_trait]
impl ProbeHandler for Recording<'_> {
    async fn handle_probe(
        &self,
        frame: Frame,
        cancel: &CancellationToken,
    ) -> Result<Option<AttendanceOutcome>, Fault> {
        let sequence = frame.sequence;
        let outcome = self.kiosk.handle_probe(frame, cancel).await?;
        if let Some(outcome) = &outcome {
            println!("frame {sequence:>5}: {}", serde_json::to_string(outcome).unwrap_or_default());
        }
        Ok(outcome)
    }
}

async fn replay(config: &KioskConfig, frames: &Path, dry_run: bool) -> Result<()> {
    let kiosk = open_kiosk(config).await?;
    let mut source = DirectorySource::replay(frames)
        .await?
        .with_dark_threshold(config.stability.dark_threshold);
    let mut detector =
        StabilityDetector::new(config.stability.clone()).with_signature_side(config.index.signature_side);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let summary = if dry_run {
        detector.run(&mut source, &DryRun { kiosk: &kiosk }, &cancel).await?
    } else {
        detector.run(&mut source, &Recording { kiosk: &kiosk }, &cancel).await?
    };
    ctrl_c.abort();

    println!(
        "{} frames, {} probes, {} recorded, {} faults",
        summary.frames,
        summary.triggers,
        summary.outcomes,
        summary.faults
    );
    Ok(())
}

fn describe_identity(identity: &Identity) -> String {
    let shift = match (identity.shift_start, identity.shift_end) {
        (None, None) => "no shift".to_string(),
        (start, end) => format!(
            "shift {}-{} grace {}m",
            start.map_or("--:--".to_string(), |t| t.format("%H:%M").to_string()),
            end.map_or("--:--".to_string(), |t| t.format("%H:%M").to_string()),
            identity.grace_minutes
        ),
    };
    format!(
        "{:<16} {:<24} {} [{}]",
        identity.external_user_id, identity.display_name, shift, identity.id
    )
}

fn describe_event(event: &AttendanceEvent, names: &HashMap<rollcall_core::IdentityId, String>) -> String {
    let who = match event.identity_id {
        Some(id) => names.get(&id).cloned().unwrap_or_else(|| format!("(removed {id})")),
        None => "-".to_string(),
    };
    let mut line = format!(
        "{} {:<14} {:<16}",
        event.event_time.format("%H:%M:%S"),
        event.result,
        who
    );
    if let (Some(check_type), Some(status)) = (event.check_type, event.status) {
        line.push_str(&format!(" {check_type:<3} {status}"));
        if let Some(late) = event.late_minutes.filter(|m| *m > 0) {
            line.push_str(&format!(" +{late}m"));
        }
    }
    if let Some(similarity) = event.similarity {
        line.push_str(&format!(" ({similarity:.3})"));
    }
    line
}

fn describe_verdict(verdict: &MatchVerdict) -> String {
    match verdict {
        MatchVerdict::Match { identity, similarity } => {
            format!("MATCH {} ({similarity:.3})", identity.external_user_id)
        }
        MatchVerdict::NoMatch { similarity } => format!("NO_MATCH ({similarity:.3})"),
        MatchVerdict::NoFace => "NO_FACE".to_string(),
        MatchVerdict::MultipleFaces { count } => format!("MULTIPLE_FACES ({count})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{AttendanceStatus, CheckType, EventResult};

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("09:05"), Ok(NaiveTime::from_hms_opt(9, 5, 0).unwrap()));
        assert!(parse_hhmm("9am").is_err());
        assert!(parse_hhmm("25:00").is_err());
    }

    #[test]
    fn test_cli_parses_enroll() {
        let cli = Cli::try_parse_from([
            "rollcall",
            "enroll",
            "--user-id",
            "E7",
            "--name",
            "Ada",
            "--image",
            "ada.png",
            "--shift-start",
            "09:00",
            "--grace",
            "10",
        ])
        .unwrap();
        match cli.command {
            Commands::Enroll {
                user_id,
                shift_start,
                shift_end,
                grace,
                ..
            } => {
                assert_eq!(user_id, "E7");
                assert_eq!(shift_start, NaiveTime::from_hms_opt(9, 0, 0));
                assert_eq!(shift_end, None);
                assert_eq!(grace, 10);
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_describe_event() {
        let id = rollcall_core::IdentityId::nil();
        let names = HashMap::from([(id, "E7".to_string())]);
        let event = AttendanceEvent {
            identity_id: Some(id),
            result: EventResult::Success,
            similarity: Some(0.91),
            check_type: Some(CheckType::In),
            status: Some(AttendanceStatus::Late),
            late_minutes: Some(4),
            scheduled_start: None,
            scheduled_end: None,
            event_time: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(9, 14, 0)
                .unwrap(),
        };
        let line = describe_event(&event, &names);
        assert!(line.starts_with("09:14:00 SUCCESS"));
        assert!(line.contains("E7"));
        assert!(line.contains("IN  LATE +4m"));
        assert!(line.ends_with("(0.910)"));
    }

    #[test]
    fn test_describe_verdict() {
        assert_eq!(describe_verdict(&MatchVerdict::NoFace), "NO_FACE");
        assert_eq!(
            describe_verdict(&MatchVerdict::NoMatch { similarity: 0.25 }),
            "NO_MATCH (0.250)"
        );
    }
}
