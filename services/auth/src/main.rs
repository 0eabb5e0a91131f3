use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use auth::{
    AppState,
    config::{RealtimeConfig, ServerConfig},
    invalidation::InvalidationListener,
    jwt::{JwtConfig, TokenService},
    password::Argon2Hasher,
    presence::RedisPresenceStore,
    registry::ConnectionRegistry,
    repositories::PgUserRepository,
    routes,
    service::AuthService,
    session::{RedisSessionStore, SessionStore},
};
use common::{cache, database};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting authentication service");

    // Database
    let db_config = database::DatabaseConfig::from_env()?;
    let pool = database::init_pool(&db_config).await?;
    if database::health_check(&pool).await? {
        info!("Database connection successful");
    } else {
        anyhow::bail!("Failed to connect to database");
    }

    // Session ledger and presence share one Redis connection
    let redis_config = cache::RedisConfig::from_env()?;
    let redis_pool = cache::RedisPool::new(&redis_config).await?;
    let sessions: Arc<dyn SessionStore> = Arc::new(RedisSessionStore::new(redis_pool.clone()));

    let tokens = TokenService::new(JwtConfig::from_env()?);
    let auth = AuthService::new(
        tokens,
        Arc::clone(&sessions),
        Arc::new(PgUserRepository::new(pool)),
        Arc::new(Argon2Hasher::new()),
    );

    let realtime_config = RealtimeConfig::from_env()?;
    let registry = ConnectionRegistry::new(realtime_config.user_online_update_interval);

    InvalidationListener::new(sessions, registry.clone())
        .start()
        .await?;

    let app_state = AppState {
        auth,
        registry,
        presence: Arc::new(RedisPresenceStore::new(redis_pool)),
    };

    let app = routes::create_router(app_state);

    let server_config = ServerConfig::from_env()?;
    let listener = tokio::net::TcpListener::bind(server_config.bind_address).await?;
    info!("Authentication service listening on {}", server_config.bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
