use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use matinee_server::auth::token::TokenVerifier;
use matinee_server::broker::Broker;
use matinee_server::config::ServerConfig;
use matinee_server::db::PgDirectory;
use matinee_server::db::pool::{create_pool, run_migrations};
use matinee_server::directory::Directory;
use matinee_server::engine::notifications::Notifier;
use matinee_server::engine::presence::PresenceManager;
use matinee_server::web::app_state::AppState;
use matinee_server::web::router::build_router;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let pool = create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");

    run_migrations(&pool)
        .await
        .expect("failed to run database migrations");

    // Without a broker the server still answers HTTP and handshakes, but
    // every realtime publish fails with "broker unavailable".
    let broker = match &config.redis_url {
        Some(url) => Broker::connect(url)
            .await
            .expect("failed to connect to broker"),
        None => Broker::disabled(),
    };

    let directory: Arc<dyn Directory> = Arc::new(PgDirectory::new(pool));
    let presence = Arc::new(PresenceManager::new(directory.clone(), broker.clone()));
    let notifier = Notifier::new(broker.clone());

    let state = Arc::new(AppState {
        directory,
        broker,
        presence,
        notifier,
        verifier: TokenVerifier::new(&config.jwt_secret),
    });

    let addr = config.listen_addr();
    let app = build_router(state);

    info!("matinee server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listener");

    axum::serve(listener, app).await.expect("server error");
}
