use std::fs;
use std::io;
use std::path::Path;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use tracing::{debug, error};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use isogrouper::{IsoGrouper, IsoGrouperError};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn configure_log(log_file: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .compact()
        .with_timer(fmt::time::ChronoLocal::rfc_3339())
        .with_writer(io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        );

    if let Some(log_file) = log_file {
        let handle = fs::File::create(log_file)?;
        let (writer, guard) = tracing_appender::non_blocking(handle);
        let file_layer = fmt::layer()
            .compact()
            .with_ansi(false)
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
            .with_writer(writer)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(tracing::Level::DEBUG.into())
                    .from_env_lossy(),
            );
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry().with(stderr_layer).init();
        Ok(None)
    }
}

fn main() -> Result<(), IsoGrouperError> {
    let args = IsoGrouper::parse();

    let mut config = Figment::new().merge(Serialized::defaults(&args));
    config = match args.config_file.as_deref() {
        Some(path) => config.merge(Toml::file_exact(path)),
        None => config.merge(Toml::file("isogrouper.toml")),
    };
    config = config.merge(Env::prefixed("ISOGROUPER_"));

    let args: IsoGrouper = config.extract()?;
    let _guard = configure_log(args.log_file.as_deref())?;

    if let Ok(text) = toml::to_string_pretty(&args) {
        debug!("Configuration:\n{text}");
    }

    if let Err(e) = args.main() {
        error!("{e}");
        return Err(e);
    }
    Ok(())
}
