mod auth;
mod collector;
mod config;
mod connection;
mod eligibility;
mod error;
mod exposition;
mod metrics;
mod model;
mod normalize;
mod pool;
mod protocol;
mod query;
mod server;
mod stream;
mod tenant;
mod tls;

#[cfg(test)]
mod testutil;

use tracing_subscriber::EnvFilter;

const BANNER: &str = r#"
  ╔══════════════════════════════════════════════════╗
  ║           T E N A N T   S Q L   E X P O R T E R  ║
  ║    SQL across PostgreSQL tenants → Prometheus    ║
  ╚══════════════════════════════════════════════════╝
"#;

#[tokio::main]
async fn main() {
    let config = match config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    eprintln!("{BANNER}");

    if let Err(e) = server::run(config).await {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}
