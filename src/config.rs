use tracing::warn;

/// Top-level server configuration, loaded from the environment.
pub struct ServerConfig {
    /// Listen port for the HTTP/WebSocket server.
    pub port: u16,
    /// Postgres connection string for the directory backend.
    pub database_url: String,
    /// HS256 secret for verifying bearer tokens.
    pub jwt_secret: String,
    /// Redis URL for the event broker. Optional: without it the server
    /// boots in degraded mode and all real-time publishes fail.
    pub redis_url: Option<String>,
}

impl ServerConfig {
    /// Load configuration from the environment. A missing JWT secret or
    /// database URL is fatal; a missing broker URL only degrades the
    /// real-time layer.
    pub fn from_env() -> Result<Self, String> {
        let jwt_secret = std::env::var("JWT_SECRET_KEY")
            .map_err(|_| "JWT_SECRET_KEY must be set".to_string())?;
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL must be set".to_string())?;

        let redis_url = std::env::var("REDIS_URL").ok();
        if redis_url.is_none() {
            warn!("REDIS_URL not set — real-time event delivery disabled");
        }

        let port = match std::env::var("PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|_| format!("invalid PORT value: {v}"))?,
            Err(_) => 8080,
        };

        Ok(Self {
            port,
            database_url,
            jwt_secret,
            redis_url,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}
