use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tollgate::server::config_routes;
use tollgate::util::{cors_config_from_env, env_bind_addr, init_tracing, AppState};
use tollgate::Catalog;

#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(about = "Metered OpenAI-compatible chat gateway")]
struct Args {
    /// Address to listen on (defaults to BIND_ADDR or 0.0.0.0:8088)
    #[arg(long)]
    bind: Option<String>,

    /// Provider catalog (JSON or YAML); the built-in catalog is used when absent
    #[arg(long, env = "TOLLGATE_CATALOG_PATH")]
    catalog: Option<PathBuf>,

    /// Number of HTTP worker threads
    #[arg(long, env = "TOLLGATE_WORKERS")]
    workers: Option<usize>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let catalog = match &args.catalog {
        Some(path) => Catalog::load_from_file(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?,
        None => Catalog::builtin().context("built-in catalog is invalid")?,
    };
    let state = web::Data::new(AppState::with_catalog(catalog).await?);

    let addr = args.bind.unwrap_or_else(env_bind_addr);
    tracing::info!("tollgate {} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    });
    if let Some(n) = args.workers {
        server = server.workers(n.max(1));
    }
    server
        .bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .run()
        .await?;
    Ok(())
}
