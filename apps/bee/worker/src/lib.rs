//! Bee Worker Service
//!
//! Runs the broker engine over Redis Streams with the demo handler set.
//!
//! ## Architecture
//!
//! ```text
//! send (CLI / Broker::send)
//!   ↓ XADD, or ZADD <queue>:delayed for delayed messages
//! Redis Stream (<queue>)
//!   ↓ (Consumer Group: <queue>_workers)
//! Broker worker loops (BROKER_CONCURRENCY)
//!   ↓ Recover → Logging → handler registry
//! print | sleep | counter | error | delay
//! ```

pub mod handlers;
pub mod health;

use axum::Router;
use broker::{
    metrics, Broker, BrokerConfig, DelayScheduler, Logging, Message, RedisStreamTransport,
    RedisTransportConfig, Transport,
};
use core_config::{env_parse, ConfigError, Environment, FromEnv};
use eyre::{Result, WrapErr};
use handlers::DemoState;
use health::{health_router, HealthState};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

/// Everything the worker needs from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub redis: RedisTransportConfig,
    pub health_port: u16,
}

impl FromEnv for AppConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            broker: BrokerConfig::from_env()?,
            redis: RedisTransportConfig::from_env()?,
            health_port: env_parse("HEALTH_PORT", 8083u16)?,
        })
    }
}

impl AppConfig {
    fn transport(&self) -> RedisStreamTransport {
        RedisStreamTransport::new(self.redis.clone(), &self.broker)
    }
}

/// Set up error reports, tracing and metrics for a CLI invocation.
pub fn init() -> Environment {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    metrics::init_metrics();
    environment
}

/// Start the health and metrics HTTP server
async fn start_health_server(state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Build a broker with the demo handlers and logging middleware.
pub fn build_broker(
    transport: impl Transport,
    config: BrokerConfig,
) -> Result<(Broker, Arc<DemoState>)> {
    let broker = Broker::new(transport, config);
    let state = DemoState::new();

    handlers::register_all(&broker, state.clone()).wrap_err("Failed to register handlers")?;
    broker
        .middleware(Logging)
        .wrap_err("Failed to install logging middleware")?;

    Ok((broker, state))
}

/// Run the broker until SIGINT/SIGTERM, then close it gracefully.
pub async fn work(config: AppConfig) -> Result<()> {
    info!(
        queue = %config.broker.queue,
        consumer_group = %config.broker.consumer_group,
        consumer_id = %config.broker.consumer_id,
        concurrency = config.broker.concurrency,
        max_reconsume = config.broker.max_reconsume,
        delayed_delivery = config.broker.delayed_delivery,
        ordering = %config.broker.ordering,
        delivery = %config.broker.delivery,
        "Broker configuration loaded"
    );

    let (broker, _state) = build_broker(config.transport(), config.broker.clone())?;

    info!("Connecting to Redis...");
    broker.worker().await.wrap_err("Failed to start broker")?;

    let health_state = HealthState::new(
        broker.clone(),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    shutdown_signal().await?;

    broker.close().await.wrap_err("Failed to close broker")?;
    info!("Bee worker stopped");
    Ok(())
}

/// Publish one message without starting any worker loops.
///
/// `payload` is sent as a JSON value when it parses as one, otherwise as a JSON string.
pub async fn send(config: AppConfig, name: &str, payload: &str, delay: Duration) -> Result<()> {
    let transport = config.transport();
    transport
        .connect()
        .await
        .wrap_err("Failed to connect to Redis")?;

    let message = build_message(name, payload)?;
    let id = message.id.clone();

    let scheduled = DelayScheduler::for_transport(&transport)
        .schedule(&transport, message, delay)
        .await
        .wrap_err_with(|| format!("Failed to send '{}'", name));

    transport.close().await.wrap_err("Failed to close transport")?;

    match scheduled? {
        Some(descriptor) => info!(
            message_id = %id,
            name,
            target_time = %descriptor.target_time,
            "Delayed message sent"
        ),
        None => info!(message_id = %id, name, "Message sent"),
    }
    Ok(())
}

fn build_message(name: &str, payload: &str) -> Result<Message> {
    let message = match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => Message::json(name, &value),
        Err(_) => Message::json(name, payload),
    };
    message.wrap_err("Failed to encode payload")
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        sigterm.recv().await;
        Ok::<_, eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_message_keeps_json_payloads() {
        let msg = build_message("sleep", "250").unwrap();
        assert_eq!(msg.decode::<u64>().unwrap(), 250);
    }

    #[test]
    fn test_build_message_wraps_plain_text() {
        let msg = build_message("print", "hello").unwrap();
        assert_eq!(msg.decode::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_app_config_from_env() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://127.0.0.1:6379")),
                ("BROKER_QUEUE", Some("bee")),
                ("HEALTH_PORT", Some("9100")),
            ],
            || {
                let config = AppConfig::from_env().unwrap();
                assert_eq!(config.broker.queue, "bee");
                assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
                assert_eq!(config.health_port, 9100);
            },
        );
    }

    #[test]
    fn test_app_config_requires_redis_url() {
        temp_env::with_var_unset("REDIS_URL", || {
            assert!(AppConfig::from_env().is_err());
        });
    }
}
