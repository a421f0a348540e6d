//! pg_dump_sample - dump a referentially consistent sample of a database
//!
//! Reads a YAML manifest listing tables (and optional subset queries), orders
//! them so every table follows the tables it references through foreign
//! keys, and writes a single replayable SQL script of COPY blocks.
//!
//! Pipeline:
//! - Manifest: tables, subset queries and post actions
//! - Resolver: foreign-key-safe order, pulling in unlisted dependencies
//! - Emitter: preamble, COPY blocks, post actions, commit

mod config;
mod dump;
mod error;
mod introspection;
mod manifest;
mod resolver;
mod session;
mod template;

use crate::config::Settings;
use crate::dump::DumpEmitter;
use crate::manifest::Manifest;
use crate::session::{ConnectionParams, Session};
use anyhow::Context;
use tokio::io::{AsyncWrite, BufWriter};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    let manifest = Manifest::load(&settings.manifest_file).await?;
    info!(
        "📋 Manifest loaded from {} ({} tables)",
        settings.manifest_file.display(),
        manifest.tables.len()
    );

    let output: Box<dyn AsyncWrite + Unpin> = match &settings.output_file {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("cannot create output file {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let params = ConnectionParams::from(&settings);
    let session = Session::connect_with_prompt(&params, settings.no_password).await?;

    let mut sink = BufWriter::new(output);
    let summary = DumpEmitter::new(&session)
        .write_script(&manifest, &mut sink)
        .await?;

    info!(
        "✅ Wrote {} tables, {} bytes of row data",
        summary.tables, summary.row_bytes
    );
    Ok(())
}

/// Initialize tracing with structured logging on stderr
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}
