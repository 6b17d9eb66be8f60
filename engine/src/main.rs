//! OpsPro Engine - Entry Point
//!
//! Serves the OpsPro dashboard's remote operations: middleware onboarding
//! checks, static site and agent deployments, and live log streaming.

use std::collections::HashMap;
use std::env;

use opspro_engine::app::options::AppOptions;
use opspro_engine::app::run::run;
use opspro_engine::errors::EngineError;
use opspro_engine::filesys::file::File;
use opspro_engine::logs::{init_logging, LogLevel, LogOptions};
use opspro_engine::storage::layout::StorageLayout;
use opspro_engine::storage::settings::Settings;
use opspro_engine::utils::version_info;
use opspro_engine::vault::{CredentialVault, SshSecret};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{error, info};
use zeroize::Zeroizing;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Print a fresh vault master secret and exit
    if cli_args.contains_key("gen-key") {
        println!("{}", CredentialVault::generate_master_secret());
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {}", e);
            std::process::exit(1);
        }
    };

    // Seal a credential read from stdin and exit
    if let Some(kind) = seal_request(&cli_args) {
        if let Err(e) = seal(kind, &settings).await {
            eprintln!("Failed to seal credential: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // Initialize logging
    let log_level = match cli_args.get("log-level") {
        Some(level) => match level.parse::<LogLevel>() {
            Ok(level) => level,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => settings.log_level.clone(),
    };
    let logs_dir = layout.logs_dir();
    let log_dir = match logs_dir.create().await {
        Ok(()) => Some(logs_dir.path().to_path_buf()),
        Err(e) => {
            eprintln!("Logging to stdout only, cannot create {}: {}", logs_dir.path().display(), e);
            None
        }
    };
    let _log_guard = match init_logging(LogOptions {
        log_level,
        log_dir,
        ..Default::default()
    }) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the server
    let mut options = AppOptions::from_settings(&settings, layout);
    if let Some(host) = cli_args.get("host") {
        options.server.host = host.clone();
    }
    if let Some(port) = cli_args.get("port") {
        match port.parse() {
            Ok(port) => options.server.port = port,
            Err(_) => {
                error!("Invalid port '{}'", port);
                std::process::exit(1);
            }
        }
    }

    info!("Running OpsPro engine with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the engine: {e}");
        std::process::exit(1);
    }
}

#[derive(Debug, Clone, Copy)]
enum SealKind {
    /// SSH login password
    Password,
    /// SSH private key PEM
    PrivateKey,
    /// Middleware password
    Text,
}

fn seal_request(cli_args: &HashMap<String, String>) -> Option<SealKind> {
    if cli_args.contains_key("seal") {
        Some(SealKind::Password)
    } else if cli_args.contains_key("seal-key") {
        Some(SealKind::PrivateKey)
    } else if cli_args.contains_key("seal-text") {
        Some(SealKind::Text)
    } else {
        None
    }
}

/// The value to seal, with the trailing newline removed (and surrounding
/// whitespace for key PEMs)
async fn read_secret<R: AsyncRead + Unpin>(kind: SealKind, mut reader: R) -> Result<String, EngineError> {
    let mut input = Zeroizing::new(String::new());
    reader.read_to_string(&mut input).await?;
    let value = match kind {
        SealKind::PrivateKey => input.trim().to_string(),
        _ => input.trim_end_matches(['\r', '\n']).to_string(),
    };
    if value.is_empty() {
        return Err(EngineError::ValidationError("nothing to seal on stdin".to_string()));
    }
    Ok(value)
}

async fn seal(kind: SealKind, settings: &Settings) -> Result<(), EngineError> {
    let vault = CredentialVault::from_env(&settings.vault.key_env)?;

    let value = read_secret(kind, tokio::io::stdin()).await?;
    let handle = match kind {
        SealKind::Password => vault.store(&SshSecret::password(value))?,
        SealKind::PrivateKey => vault.store(&SshSecret::private_key(value, None))?,
        SealKind::Text => vault.seal_text(&Zeroizing::new(value))?,
    };
    println!("{}", handle.as_str());
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
