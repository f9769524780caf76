use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;

use lineage_explorer::ai::{ExplanationClient, DEFAULT_PROMPT};
use lineage_explorer::config::{AiConfig, AppConfig, LogConfig};
use lineage_explorer::LineageResult;

const ACTIVE_LOG: &str = "lineage_explorer.log";

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    // Check if running in CLI mode
    if take_flag(&mut args, &["--cli"]) {
        // Standalone analysis with simple stdout output
        run_cli_mode(args).await;
        Ok(())
    } else {
        // Run as HTTP server (with file logging)
        run_server_mode().await
    }
}

async fn run_server_mode() -> std::io::Result<()> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = AppConfig::from_file(&config_path).map_err(std::io::Error::other)?;

    let log_state = init_logging(&config.logging).map_err(std::io::Error::other)?;
    start_log_maintenance(log_state);

    tracing::info!("Loaded configuration from {}", config_path);

    // Credential resolved once at startup; absence degrades explanations
    // instead of failing the service.
    let api_key = config
        .ai
        .api_key
        .clone()
        .or_else(|| env::var("GEMINI_API_KEY").ok());
    if api_key.is_none() {
        tracing::warn!("No AI API key configured; explanations will return a degraded message");
    }
    let client = ExplanationClient::new(api_key, &config.ai).map_err(std::io::Error::other)?;

    lineage_explorer::server::start_server(
        &config.server.host,
        config.server.port,
        config.server.worker_threads,
        client,
    )
    .await
}

fn init_logging(config: &LogConfig) -> anyhow::Result<Arc<Mutex<LogState>>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let state = Arc::new(Mutex::new(LogState::open(
        &config.log_dir,
        config.max_log_files,
    )?));
    prune_archived_logs(Path::new(&config.log_dir), config.max_log_files)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(RollingWriter {
        state: state.clone(),
    });

    let log_level = config
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    // Keep the appender guard alive for the whole process lifetime
    std::mem::forget(guard);

    Ok(state)
}

struct RollingWriter {
    state: Arc<Mutex<LogState>>,
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer poisoned"))?;
        state.roll_if_stale().map_err(io::Error::other)?;
        state.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log writer poisoned"))?;
        state.file.flush()
    }
}

struct LogState {
    dir: PathBuf,
    active: PathBuf,
    file: File,
    date: chrono::NaiveDate,
    max_files: usize,
}

impl LogState {
    fn open(dir: &str, max_files: usize) -> anyhow::Result<Self> {
        let dir = PathBuf::from(dir);
        fs::create_dir_all(&dir)?;
        let active = dir.join(ACTIVE_LOG);
        let file = OpenOptions::new().create(true).append(true).open(&active)?;

        // Date-stamp a pre-existing non-empty log by its mtime so a restart
        // after midnight still archives yesterday's output.
        let mut date = chrono::Local::now().date_naive();
        if let Ok(meta) = fs::metadata(&active) {
            if meta.len() > 0 {
                if let Ok(modified) = meta.modified() {
                    date = chrono::DateTime::<chrono::Local>::from(modified).date_naive();
                }
            }
        }

        let mut state = Self {
            dir,
            active,
            file,
            date,
            max_files,
        };
        state.roll_if_stale()?;
        Ok(state)
    }

    fn roll_if_stale(&mut self) -> anyhow::Result<()> {
        let today = chrono::Local::now().date_naive();
        if today == self.date {
            return Ok(());
        }

        self.file.flush()?;
        let archive = self
            .dir
            .join(format!("{}.{}", ACTIVE_LOG, self.date.format("%Y-%m-%d")));
        if self.active.exists() {
            fs::rename(&self.active, &archive)?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active)?;
        self.date = today;

        if archive.exists() {
            compress_log_file(&archive)?;
        }
        prune_archived_logs(&self.dir, self.max_files)?;
        Ok(())
    }
}

fn compress_log_file(path: &Path) -> anyhow::Result<()> {
    let mut input = File::open(path)?;
    let gz_path = {
        let mut os = path.as_os_str().to_owned();
        os.push(".gz");
        PathBuf::from(os)
    };
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

fn prune_archived_logs(dir: &Path, max_files: usize) -> anyhow::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let prefix = format!("{}.", ACTIVE_LOG);
    let today_name = format!("{}{}", prefix, chrono::Local::now().format("%Y-%m-%d"));

    // gzip archives older than today that are still uncompressed
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name != today_name && !name.ends_with(".gz") {
            if let Err(e) = compress_log_file(&path) {
                eprintln!("Failed to compress log file {:?}: {}", path, e);
            }
        }
    }

    // drop the oldest archives beyond the retention limit
    let mut archives: Vec<(PathBuf, SystemTime)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.path(), modified))
        })
        .collect();
    archives.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in archives.iter().skip(max_files) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to remove old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

fn start_log_maintenance(state: Arc<Mutex<LogState>>) {
    use tokio::time::{sleep, Duration};

    actix_web::rt::spawn(async move {
        loop {
            sleep(Duration::from_secs(60)).await;
            let mut state = match state.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::warn!("Log writer state poisoned");
                    continue;
                }
            };
            if let Err(e) = state.roll_if_stale() {
                tracing::warn!("Failed to rotate active log file: {}", e);
            }
        }
    });
}

fn take_flag(args: &mut Vec<String>, names: &[&str]) -> bool {
    if let Some(pos) = args.iter().position(|a| names.contains(&a.as_str())) {
        args.remove(pos);
        true
    } else {
        false
    }
}

async fn run_cli_mode(mut args: Vec<String>) {
    let json_mode = take_flag(&mut args, &["--json", "-j"]);
    let pretty = take_flag(&mut args, &["--pretty", "-p"]);
    let no_ai = take_flag(&mut args, &["--no-ai"]);

    let api_key = if no_ai {
        None
    } else {
        let key = env::var("GEMINI_API_KEY").ok();
        if key.is_none() {
            eprintln!("Warning: GEMINI_API_KEY not set; explanations will be unavailable");
        }
        key
    };
    let client = match ExplanationClient::new(api_key, &AiConfig::default()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to initialize explanation client: {}", e);
            std::process::exit(2);
        }
    };

    if args.is_empty() || (args.len() == 1 && args[0] == "-") {
        // Read from stdin; no report file for piped input
        let mut buf = String::new();
        if let Err(e) = io::stdin().read_to_string(&mut buf) {
            eprintln!("Failed to read stdin: {}", e);
            std::process::exit(2);
        }
        if let Err(e) = run_once(&client, &buf, json_mode, pretty).await {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    } else {
        for path in &args {
            let contents = match fs::read_to_string(path) {
                Ok(contents) => contents,
                Err(e) => {
                    eprintln!("Failed to read {}: {}", path, e);
                    std::process::exit(2);
                }
            };
            let report = match run_once(&client, &contents, json_mode, pretty).await {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("Error in {}: {}", path, e);
                    std::process::exit(1);
                }
            };
            let out_path = report_path(path);
            match fs::write(&out_path, &report) {
                Ok(()) => println!("Report saved to {}", out_path),
                Err(e) => eprintln!("Failed to save report {}: {}", out_path, e),
            }
        }
    }
}

async fn run_once(
    client: &ExplanationClient,
    sql: &str,
    json_mode: bool,
    pretty: bool,
) -> anyhow::Result<String> {
    let lineage = lineage_explorer::analyze(sql);
    let explanation = client.explain(sql, DEFAULT_PROMPT).await;
    let report = render_report(&lineage, &explanation);

    if json_mode {
        let payload = serde_json::json!({ "lineage": lineage, "explanation": explanation });
        if pretty {
            println!("{}", serde_json::to_string_pretty(&payload)?);
        } else {
            println!("{}", serde_json::to_string(&payload)?);
        }
    } else {
        print!("{}", report);
    }
    Ok(report)
}

fn render_report(lineage: &LineageResult, explanation: &str) -> String {
    let mut out = String::new();
    out.push_str("--- SQL Lineage ---\n");
    out.push_str(&format!("Source tables: {}\n", format_list(&lineage.sources)));
    out.push_str(&format!("Target tables: {}\n", format_list(&lineage.targets)));
    out.push_str(&format!(
        "Intermediate tables: {}\n",
        format_list(&lineage.intermediates)
    ));
    out.push_str("\n--- AI Explanation ---\n");
    out.push_str(explanation);
    out.push('\n');
    out
}

fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.iter().join(", ")
    }
}

fn report_path(path: &str) -> String {
    match path.strip_suffix(".sql") {
        Some(stem) => format!("{}_analysis.txt", stem),
        None => format!("{}_analysis.txt", path),
    }
}
