use clap::{Arg, ArgAction, ArgMatches, Command};
use pumpdl::config::{self, DownloadConfig};
use pumpdl::core::engine::{Engine, ListFilter, SubmitOptions, Submitted};
use pumpdl::core::events::EngineEvent;
use pumpdl::core::speed::fmt_bytes;
use pumpdl::driver::http::HttpDriver;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use sanitize_filename::sanitize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;

fn build_cli() -> Command {
    let download = Command::new("download")
        .about("Download one or more URLs, resuming earlier partial downloads")
        .arg(
            Arg::new("urls")
                .help("URLs to download")
                .action(ArgAction::Append)
                .num_args(1..)
                .required(true),
        )
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Output directory")
                .default_value("./downloads")
                .num_args(1),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .help("Segments per download")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("max_running")
                .long("max-running")
                .help("Downloads running at the same time")
                .value_parser(clap::value_parser!(usize))
                .num_args(1),
        )
        .arg(
            Arg::new("retries")
                .long("retries")
                .help("Retries after a network failure")
                .value_parser(clap::value_parser!(u32))
                .num_args(1),
        )
        .arg(
            Arg::new("retry_delay_ms")
                .long("retry-delay-ms")
                .help("Delay between retries")
                .value_parser(clap::value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("force")
                .long("force")
                .help("Download again even if the file was already downloaded")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no_resume")
                .long("no-resume")
                .help("Never reuse partial data")
                .action(ArgAction::SetTrue),
        )
        .arg(Arg::new("tag").long("tag").help("Group label stored with the record").num_args(1));

    let list = Command::new("list")
        .about("Show stored downloads")
        .arg(
            Arg::new("downloading")
                .long("downloading")
                .help("Only unfinished downloads")
                .action(ArgAction::SetTrue)
                .conflicts_with("downloaded"),
        )
        .arg(
            Arg::new("downloaded")
                .long("downloaded")
                .help("Only finished downloads")
                .action(ArgAction::SetTrue),
        );

    let restart = Command::new("restart")
        .about("Re-submit a stored download and wait for it")
        .arg(Arg::new("id").required(true));

    let delete = Command::new("delete")
        .about("Delete a download with its file, parts and cache data")
        .arg(Arg::new("id").required(true));

    Command::new("pumpdl")
        .about("Resumable multi-segment HTTP downloader")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .help("TOML configuration file")
                .global(true)
                .num_args(1),
        )
        .arg(
            Arg::new("data_dir")
                .long("data-dir")
                .help("Directory holding the download database")
                .global(true)
                .num_args(1),
        )
        .subcommand(download)
        .subcommand(list)
        .subcommand(restart)
        .subcommand(delete)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let matches = build_cli().get_matches();

    let mut cfg = config::load(global_arg(&matches, "config").map(Path::new))?;
    if let Some(dir) = global_arg(&matches, "data_dir") {
        cfg.data_dir = PathBuf::from(dir);
    }

    match matches.subcommand() {
        Some(("download", m)) => run_download(cfg, m).await,
        Some(("list", m)) => run_list(cfg, m).await,
        Some(("restart", m)) => {
            let engine = open_engine(cfg).await?;
            let id = m.get_one::<String>("id").unwrap();
            let submitted = engine.restart(id).await?;
            follow(&engine, vec![submitted.id().to_string()]).await
        }
        Some(("delete", m)) => {
            let engine = open_engine(cfg).await?;
            let id = m.get_one::<String>("id").unwrap();
            engine.delete(id).await?;
            println!("Deleted {id}");
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Global flags may be given before or after the subcommand.
fn global_arg<'a>(matches: &'a ArgMatches, name: &str) -> Option<&'a String> {
    matches
        .get_one::<String>(name)
        .or_else(|| matches.subcommand().and_then(|(_, m)| m.get_one::<String>(name)))
}

async fn open_engine(cfg: DownloadConfig) -> anyhow::Result<Engine> {
    let driver = Arc::new(HttpDriver::new(&cfg)?);
    Engine::new(cfg, driver).await
}

async fn run_download(mut cfg: DownloadConfig, m: &ArgMatches) -> anyhow::Result<()> {
    let out_dir: PathBuf = m.get_one::<String>("out_dir").unwrap().into();
    if let Some(n) = m.get_one::<usize>("threads") {
        cfg.thread_num = *n;
    }
    if let Some(n) = m.get_one::<usize>("max_running") {
        cfg.max_running_tasks = *n;
    }
    if let Some(n) = m.get_one::<u32>("retries") {
        cfg.retry_count = *n;
    }
    if let Some(ms) = m.get_one::<u64>("retry_delay_ms") {
        cfg.retry_delay_ms = *ms;
    }
    cfg.force_redownload |= m.get_flag("force");
    cfg.disable_breakpoint |= m.get_flag("no_resume");

    tokio::fs::create_dir_all(&out_dir).await?;
    // record ids hash the path, so it must not depend on the working dir
    let out_dir = tokio::fs::canonicalize(&out_dir).await?;
    let engine = open_engine(cfg).await?;
    let tag = m.get_one::<String>("tag").cloned();

    let mut ids = vec![];
    for url in m.get_many::<String>("urls").unwrap() {
        let path = out_dir.join(output_name(url)?);
        let opts = SubmitOptions { tag: tag.clone(), ..Default::default() };
        match engine.submit(url, &path, opts).await? {
            Submitted::AlreadyExists(rec) => {
                println!("Already downloaded: {} ({})", rec.file_path.display(), rec.id);
            }
            submitted => ids.push(submitted.id().to_string()),
        }
    }
    follow(&engine, ids).await
}

/// Renders progress until every id settles or Ctrl-C pauses everything.
async fn follow(engine: &Engine, ids: Vec<String>) -> anyhow::Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mp = MultiProgress::new();
    let ui = tokio::spawn(render_events(engine.subscribe(), mp.clone(), styles()?));

    let waiting = async {
        for id in &ids {
            engine.wait(id).await;
        }
    };
    tokio::select! {
        _ = waiting => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, pausing downloads");
        }
    }
    engine.shutdown().await;
    ui.abort();

    println!();
    println!("Summary:");
    for id in &ids {
        if let Some(rec) = engine.get(id) {
            let total = (rec.content_length >= 0)
                .then(|| fmt_bytes(rec.content_length as u64))
                .unwrap_or_else(|| "?".to_string());
            let error = rec.error_code.map(|c| format!(" error={c}")).unwrap_or_default();
            println!(
                "- {} status={:?} {} / {} path={}{}",
                rec.id,
                rec.status,
                fmt_bytes(rec.completed_size),
                total,
                rec.file_path.display(),
                error,
            );
        }
    }
    Ok(())
}

struct Styles {
    spinner: ProgressStyle,
    bar: ProgressStyle,
}

fn styles() -> anyhow::Result<Styles> {
    Ok(Styles {
        spinner: ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")?.tick_chars("|/-\\ "),
        bar: ProgressStyle::with_template("{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} {wide_msg}")?,
    })
}

async fn render_events(mut rx: broadcast::Receiver<EngineEvent>, mp: MultiProgress, sty: Styles) {
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();
    let mut bar_for = |id: &str, name: Option<&str>| -> ProgressBar {
        bars.entry(id.to_string())
            .or_insert_with(|| {
                let pb = mp.add(ProgressBar::new_spinner());
                pb.set_style(sty.spinner.clone());
                pb.set_prefix(format!("[{}]", name.unwrap_or(&id[..id.len().min(8)])));
                pb.enable_steady_tick(std::time::Duration::from_millis(120));
                pb
            })
            .clone()
    };

    loop {
        let evt = match rx.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match evt {
            EngineEvent::Progress { id, name, completed, total, progress, speed } => {
                let pb = bar_for(&id, Some(&name));
                pb.set_prefix(format!("[{name}]"));
                match total {
                    Some(t) => {
                        if pb.length() != Some(t) {
                            pb.set_style(sty.bar.clone());
                            pb.set_length(t);
                        }
                        pb.set_position(completed.min(t));
                        pb.set_message(format!("{progress}% {speed}"));
                    }
                    None => pb.set_message(format!("{} {speed}", fmt_bytes(completed))),
                }
            }
            EngineEvent::StatusChanged { id, status } => {
                let pb = bar_for(&id, None);
                match status {
                    s if s.is_terminal() => {
                        pb.abandon_with_message(format!("{status:?}").to_lowercase());
                    }
                    s => pb.set_message(format!("{s:?}").to_lowercase()),
                }
            }
            EngineEvent::Finished { id, name, size } => {
                let pb = bar_for(&id, Some(&name));
                pb.set_style(sty.bar.clone());
                pb.set_length(size);
                pb.set_position(size);
                pb.finish_with_message("done");
            }
            EngineEvent::Failed { id, name, code } => {
                let pb = bar_for(&id, Some(&name));
                pb.abandon_with_message(format!("failed: {code}"));
            }
        }
    }
}

async fn run_list(cfg: DownloadConfig, m: &ArgMatches) -> anyhow::Result<()> {
    let filter = if m.get_flag("downloading") {
        ListFilter::Downloading
    } else if m.get_flag("downloaded") {
        ListFilter::Downloaded
    } else {
        ListFilter::All
    };
    let engine = open_engine(cfg).await?;
    let records = engine.list(filter);
    if records.is_empty() {
        println!("No downloads.");
        return Ok(());
    }

    println!("{:<32}  {:<9} {:>4}  {:>10}  {:<8} {}", "ID", "STATUS", "%", "SIZE", "TAG", "PATH");
    for rec in records {
        let size = (rec.content_length >= 0)
            .then(|| fmt_bytes(rec.content_length as u64))
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:<32}  {:<9} {:>4}  {:>10}  {:<8} {}",
            rec.id,
            format!("{:?}", rec.status).to_lowercase(),
            rec.progress,
            size,
            rec.tag,
            rec.file_path.display(),
        );
    }
    Ok(())
}

/// Output file name: the sanitized last path segment of the URL.
fn output_name(raw: &str) -> anyhow::Result<String> {
    let url = Url::parse(raw)?;
    Ok(url
        .path_segments()
        .and_then(|s| s.last())
        .filter(|s| !s.is_empty())
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "download.bin".to_string()))
}
