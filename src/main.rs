mod admin;
mod ai;
mod config;
mod core;
mod email;
mod logbuf;
mod notify;
mod prompt;
mod push;
mod scheduler;
mod session;
mod sms;
mod store;
mod types;

#[cfg(test)]
mod integration_tests;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::logbuf::LogBuffer;

fn main() -> anyhow::Result<()> {
    // Load environment file.
    // - Default: .env discovered from current working directory and parents.
    // - Override: AMPARO_ENV_FILE=/absolute/path/to/envfile
    if let Ok(path) = std::env::var("AMPARO_ENV_FILE") {
        if !path.trim().is_empty() {
            if let Err(e) = dotenvy::from_path(&path) {
                eprintln!("Warning: failed to load AMPARO_ENV_FILE '{}': {}", path, e);
            }
        } else {
            let _ = dotenvy::dotenv();
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    // Tracing: stdout plus an in-memory tail that backs GET /logs.
    let log_buffer = LogBuffer::new(100);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(log_buffer.clone()),
        )
        .init();

    // Handle CLI arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("amparo {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("amparo {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: amparo");
                println!("\nConfiguration is read from the environment:");
                println!("  DATABASE_URL             store location (required)");
                println!("  GOOGLE_API_KEY           realtime AI provider key (required)");
                println!("  FCM_CREDENTIALS_PATH     push provider credentials file");
                println!("  PORT                     listen port (default 8080)");
                println!("\nOptions:");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: '{}'. Try --help.", other);
                std::process::exit(2);
            }
        }
    }

    let config = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    // Run async
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(crate::core::run(config, log_buffer))
}
