//! Mapping server with a shared map for multiple tracking clients.

use std::io::Read;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use vslam_mapper::config::Settings;
use vslam_mapper::mapper::server::{MapperServer, MapperServerConfig};
use vslam_mapper::net::MapperService;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let (vocab_path, settings_path) = match (args.next(), args.next(), args.next()) {
        (Some(vocab), Some(settings), None) => (vocab, settings),
        _ => bail!("Usage: server <vocabulary_file> <settings_file>"),
    };

    // The vocabulary itself is consumed tracker-side; the server only checks
    // the deployment is complete.
    if !Path::new(&vocab_path).is_file() {
        bail!("vocabulary file not found: {}", vocab_path);
    }

    let settings = Settings::load(&settings_path)
        .with_context(|| format!("invalid settings file {}", settings_path))?;

    println!();
    println!("Mapping server with shared map for multiple tracking clients.");
    println!("Server.Address={}", settings.server_address);
    println!("Publisher.Address={}", settings.publisher_address);
    println!("Press X to exit.");
    println!();

    let mapper = Arc::new(MapperServer::new(MapperServerConfig::default()));
    let mut service = MapperService::bind(
        Arc::clone(&mapper),
        settings.server_bind_addr(),
        settings.publisher_bind_addr(),
    )
    .context("failed to bind server sockets")?;

    wait_for_exit_key();

    info!("shutting down server");
    service.shutdown();
    drop(service);
    if let Ok(mut mapper) = Arc::try_unwrap(mapper) {
        mapper.shutdown();
    }
    Ok(())
}

/// Block until `X`/`x`/`Esc` is typed on the controlling terminal (or stdin
/// closes).
fn wait_for_exit_key() {
    const ESC: u8 = 27;
    for byte in std::io::stdin().lock().bytes() {
        match byte {
            Ok(b'x') | Ok(b'X') | Ok(ESC) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}
