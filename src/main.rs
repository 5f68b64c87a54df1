//! grok relay server
//!
//! Public-facing reverse-tunnel relay: accepts client control connections,
//! proxies inbound HTTP/HTTPS/TCP traffic back through them, fans webhooks
//! out to multiple tunnels, and serves the admin API and dashboard.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use grok_config::Config;
use grok_control::{ControlListener, ControlListenerConfig, ServiceSettings, TunnelService};
use grok_db::entities::{auth_token, user};
use grok_events::{EventBus, SseBroker};
use grok_proxy::{HttpFrontend, ProxySettings, TcpFrontend};
use grok_webhook::{WebhookRouter, WebhookSettings};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Deadline for one proxied exchange up to the response head.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// grok - self-hosted reverse-tunnel relay
#[derive(Parser, Debug)]
#[command(name = "grok")]
#[command(about = "Run the grok reverse-tunnel relay server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the TOML configuration file
    #[arg(long, env = "GROK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mint a client auth token for an existing user
    GenerateToken {
        /// Email of the owning user
        #[arg(long)]
        email: String,

        /// Token name shown in the dashboard
        #[arg(long, default_value = "cli")]
        name: String,

        /// Validity in hours (omit for a non-expiring token)
        #[arg(long)]
        hours: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let _log_guard = init_logging(&config)?;

    if let Some(command) = cli.command {
        return match command {
            Commands::GenerateToken { email, name, hours } => {
                generate_token(&config, &email, &name, hours).await
            }
        };
    }

    run_server(config).await
}

async fn run_server(config: Config) -> Result<()> {
    info!("Starting grok relay");
    info!("Public domain: {}", config.server.domain);
    info!("Tunnel hosts will be: {{subdomain}}.{}", config.server.domain);

    // Database
    let db = grok_db::connect(&config.database.url())
        .await
        .context("Failed to connect to database")?;
    grok_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;
    bootstrap_admin(&db, &config).await?;

    // Startup recovery: demote stale rows, rebuild port reservations
    let pool = Arc::new(
        grok_control::recover_pool(
            &db,
            config.server.tcp_port_start,
            config.server.tcp_port_end,
        )
        .await
        .context("Failed to rehydrate port pool")?,
    );

    // Eventing
    let (events, bus_rx) = EventBus::new();
    let broker = SseBroker::spawn(bus_rx);

    // Async log writer
    let writer = grok_db::LogWriter::spawn(db.clone(), config.webhooks.max_events);
    let log_handle = writer.handle();

    // Registry and registration service
    let registry = Arc::new(grok_registry::TunnelRegistry::new());
    let service = Arc::new(TunnelService::new(
        db.clone(),
        registry.clone(),
        pool.clone(),
        events.clone(),
        ServiceSettings {
            domain: config.server.domain.clone(),
            max_per_user: config.tunnels.max_per_user,
        },
    ));

    // Control listener for client channels
    let control_addr: SocketAddr = ([0, 0, 0, 0], config.server.grpc_port).into();
    let control = ControlListener::new(
        ControlListenerConfig {
            bind_addr: control_addr,
            idle_timeout: config.tunnels.idle_timeout()?,
            heartbeat_interval: config.tunnels.heartbeat_interval()?,
        },
        service.clone(),
    );
    let control_handle = tokio::spawn(async move {
        if let Err(e) = control.start().await {
            error!("Control listener failed: {}", e);
        }
    });
    info!("Control channel on {}", control_addr);

    // Webhook fan-out router plugs into the HTTP front-end
    let webhook_router = Arc::new(WebhookRouter::new(
        db.clone(),
        registry.clone(),
        log_handle.clone(),
        events.clone(),
        WebhookSettings {
            per_route_timeout: REQUEST_TIMEOUT,
            max_capture_bytes: 64 * 1024,
        },
    ));

    let frontend = Arc::new(
        HttpFrontend::new(
            registry.clone(),
            db.clone(),
            ProxySettings {
                domain: config.server.domain.clone(),
                request_timeout: REQUEST_TIMEOUT,
            },
            log_handle.clone(),
            events.clone(),
        )
        .with_webhook_handler(webhook_router),
    );

    let http_addr: SocketAddr = ([0, 0, 0, 0], config.server.http_port).into();
    let http_frontend = frontend.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_frontend.serve(http_addr).await {
            error!("HTTP proxy failed: {}", e);
        }
    });

    // HTTPS terminator, when static certificates are configured
    let https_handle = if !config.tls.cert_file.is_empty() && !config.tls.key_file.is_empty() {
        let acceptor = grok_proxy::tls::acceptor_from_pem(
            std::path::Path::new(&config.tls.cert_file),
            std::path::Path::new(&config.tls.key_file),
        )
        .context("Failed to load TLS certificates")?;
        let https_addr: SocketAddr = ([0, 0, 0, 0], config.server.https_port).into();
        let https_frontend = frontend.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = https_frontend.serve_tls(https_addr, acceptor).await {
                error!("HTTPS proxy failed: {}", e);
            }
        }))
    } else {
        if config.tls.auto_cert {
            warn!("tls.auto_cert is set but no certificate manager is wired; provide tls.cert_file/key_file");
        }
        info!("HTTPS proxy disabled (no certificates configured)");
        None
    };

    // TCP front-end reconciles accept loops against the registry
    let tcp_frontend = TcpFrontend::new(registry.clone(), [0, 0, 0, 0].into());
    let tcp_handle = tokio::spawn(tcp_frontend.clone().run());
    info!(
        "TCP tunnel ports: {}-{}",
        config.server.tcp_port_start, config.server.tcp_port_end
    );

    // Admin API
    let api_state = Arc::new(grok_api::AppState {
        db: db.clone(),
        service: service.clone(),
        broker: broker.clone(),
        events: events.clone(),
        log: log_handle.clone(),
        jwt: grok_api::middleware::JwtState::new(config.auth.jwt_secret.as_bytes()),
        csrf: grok_api::middleware::CsrfStore::new(),
        limiter: grok_api::middleware::RateLimiter::new(),
        domain: config.server.domain.clone(),
        cors_origins: config.server.allowed_origins.clone(),
        is_https: https_handle.is_some(),
        started_at: std::time::Instant::now(),
    });
    let api_addr: SocketAddr = ([0, 0, 0, 0], config.server.api_port).into();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = grok_api::serve(api_state, api_addr).await {
            error!("Admin API failed: {}", e);
        }
    });

    info!("grok relay is running, press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    // Stop intake first, then drain the stateful pieces deterministically
    control_handle.abort();
    http_handle.abort();
    if let Some(handle) = https_handle {
        handle.abort();
    }
    api_handle.abort();
    tcp_handle.abort();
    tcp_frontend.shutdown();
    broker.shutdown().await;
    writer.shutdown().await;

    info!("grok relay stopped");
    Ok(())
}

/// Create the initial super admin when the users table is empty.
async fn bootstrap_admin(db: &DatabaseConnection, config: &Config) -> Result<()> {
    let count = user::Entity::find().count(db).await?;
    if count > 0 {
        return Ok(());
    }
    if config.auth.admin_password.is_empty() {
        warn!("No users exist and auth.admin_password is empty; admin login unavailable");
        return Ok(());
    }

    let password_hash = grok_auth::hash_password(&config.auth.admin_password)
        .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {e}"))?;

    let admin = user::ActiveModel {
        id: Set(Uuid::new_v4()),
        email: Set(config.auth.admin_username.to_ascii_lowercase()),
        password_hash: Set(password_hash),
        name: Set("Administrator".to_string()),
        role: Set("super_admin".to_string()),
        organization_id: Set(None),
        two_factor_enabled: Set(false),
        two_factor_secret: Set(None),
        is_active: Set(true),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(db)
    .await?;

    info!(user_id = %admin.id, email = %admin.email, "Bootstrapped super admin");
    Ok(())
}

async fn generate_token(
    config: &Config,
    email: &str,
    name: &str,
    hours: Option<i64>,
) -> Result<()> {
    let db = grok_db::connect(&config.database.url()).await?;
    grok_db::migrate(&db).await?;

    let owner = user::Entity::find()
        .filter(user::Column::Email.eq(email.to_ascii_lowercase()))
        .one(&db)
        .await?
        .context("No user with that email")?;

    let raw = grok_auth::generate_client_token();
    let expires_at = hours.map(|h| Utc::now() + chrono::Duration::hours(h));
    let row = auth_token::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(owner.id),
        token_hash: Set(grok_auth::hash_token(&raw)),
        name: Set(name.to_string()),
        scopes: Set(String::new()),
        expires_at: Set(expires_at),
        is_active: Set(true),
        last_used_at: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(&db)
    .await?;

    println!("Token created for {} (id {})", owner.email, row.id);
    match expires_at {
        Some(at) => println!("Expires: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Expires: never"),
    }
    println!();
    println!("Store this token now; it cannot be shown again:");
    println!();
    println!("  {raw}");
    println!();
    Ok(())
}

fn init_logging(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.filter_directives()))?;

    let registry = tracing_subscriber::registry().with(filter);

    let guard = match config.logging.output.as_str() {
        "file" => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.logging.file)
                .with_context(|| format!("Failed to open log file {}", config.logging.file))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            if config.logging.format == "json" {
                registry
                    .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(writer),
                    )
                    .init();
            }
            Some(guard)
        }
        _ => {
            if config.logging.format == "json" {
                registry.with(tracing_subscriber::fmt::layer().json()).init();
            } else {
                registry.with(tracing_subscriber::fmt::layer()).init();
            }
            None
        }
    };

    Ok(guard)
}
