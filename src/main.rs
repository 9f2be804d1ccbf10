use clap::Parser;
use gatewayd::config::{self, Config};
use gatewayd::constants;
use gatewayd::shutdown::wait_for_signal;
use gatewayd::Gateway;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "gatewayd")]
#[command(about = "Peer-to-peer gateway daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    listen_addr: Option<String>,

    /// Overrides storage.data_dir
    #[arg(long)]
    data_dir: Option<String>,

    /// Do not seed from the bootstrap list (private networks, testing)
    #[arg(long)]
    no_bootstrap: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(listen) = args.listen_addr {
        config.network.listen_address = listen;
    }
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    if args.no_bootstrap {
        config.network.no_bootstrap = true;
    }

    let data_dir = config.data_dir();
    let _log_guard = setup_logging(&config.logging, &data_dir, args.verbose);

    let settings = match config.network.to_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("❌ Invalid network configuration: {}", e);
            std::process::exit(1);
        }
    };

    let listen = config.network.full_listen_address();
    println!(
        "\n🚀 {} v{} ({})",
        config.node.name,
        env!("CARGO_PKG_VERSION"),
        constants::protocol::PROTOCOL_VERSION
    );
    println!("  └─ Data Dir: {}", data_dir.display());

    let gateway = match Gateway::new(&listen, &data_dir, settings).await {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!("❌ Failed to start gateway: {}", e);
            eprintln!("❌ Failed to start gateway: {}", e);
            std::process::exit(1);
        }
    };
    println!("  └─ Listening on: {}", gateway.address());

    wait_for_signal().await;
    tracing::info!("🛑 Shutdown signal received");

    if let Err(e) = gateway.close().await {
        tracing::error!("Gateway did not close cleanly: {}", e);
        std::process::exit(1);
    }
}

/// Returns the file writer's guard, which must live until exit so buffered
/// lines get flushed.
fn setup_logging(
    config: &config::LoggingConfig,
    data_dir: &std::path::Path,
    verbose: bool,
) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // journald already adds timestamp and hostname
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    if config.output == "file" {
        if let Err(e) = std::fs::create_dir_all(data_dir) {
            eprintln!("❌ Cannot create log directory {}: {}", data_dir.display(), e);
            std::process::exit(1);
        }
        let appender = tracing_appender::rolling::daily(data_dir, constants::storage::LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let builder = fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false);
        if config.format == "json" {
            builder.json().init();
        } else {
            builder
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
        return Some(guard);
    }

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ if is_systemd => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .without_time()
                .compact()
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
    }
    None
}

// UTC time plus short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
