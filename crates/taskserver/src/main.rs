mod api;
mod config;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use api::AppState;
use config::ServerConfig;
use std::sync::Arc;
use taskruntime::{ManagementConfig, RuntimeConfig, SessionRegistry, TaskRuntime};
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ServerConfig::from_env();
    info!("🚀 Starting human task server (data dir {})", config.data_dir.display());

    let sessions = Arc::new(SessionRegistry::new());
    let access = Arc::new(config.permission_table()?);
    let runtime = TaskRuntime::open(
        RuntimeConfig::new(&config.data_dir),
        sessions.clone(),
        access.clone(),
    )
    .await?;

    if let Some(last) = runtime.directory().max_work_item_id().await {
        sessions.reserve_ids_through(last);
    }
    let scripts = ManagementConfig::open(ManagementConfig::config_path(&config.data_dir));
    info!("✅ Runtime initialized with {} registered scripts", scripts.list().len());

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
        sessions,
        access,
        scripts: RwLock::new(scripts),
    });

    info!("🌐 Server starting on http://{}", config.bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(&config.bind_address)?
    .run()
    .await?;

    Ok(())
}
