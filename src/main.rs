use std::sync::Arc;

use dotenv::dotenv;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wiki_pageviews::config::Config;
use wiki_pageviews::fetcher::PageviewFetcher;
use wiki_pageviews::state::State;
use wiki_pageviews::transport::HttpTransport;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let is_production = std::env::var("PRODUCTION").is_ok();
    match is_production {
        // local env
        false => {
            dotenv().ok();

            tracing::subscriber::set_global_default(
                tracing_subscriber::fmt()
                    .pretty()
                    .with_env_filter(EnvFilter::from_default_env())
                    .finish(),
            )?;
        }
        // production env
        true => {
            tracing::subscriber::set_global_default(
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(EnvFilter::from_default_env())
                    .with_target(false)
                    .finish(),
            )?;
        }
    }

    let config = Config::from_env()?;

    // single fetcher shared by every request, so the rate limit is global
    let transport = HttpTransport::new(&config.user_agent, config.upstream_timeout)?;
    let fetcher = PageviewFetcher::new(transport, &config.fetcher)?;

    let shutdown = CancellationToken::new();
    let state = Arc::new(State::new(fetcher, shutdown.clone()));

    let app = wiki_pageviews::router(state);
    let addr = config.listen_addr();

    let server = axum::Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown));

    tracing::info!("server running on {}", addr);

    if let Err(err) = server.await {
        tracing::error!("server encountered an error: {}", err);
    }

    tracing::info!("server stopped, cleanup complete");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install ctrl+c handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install terminate signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    // in-flight fetches stop waiting on the limiter and backoff
    shutdown.cancel();
}
