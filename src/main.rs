use std::sync::Arc;
use tracing::{error, info};

mod bus;
mod chat;
mod config;
mod conversation_list;
mod entity;
mod error;
mod interface;
mod session;
mod store;
mod subscription;
mod suggestion;
#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // stdout belongs to the chat, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config::Config::from_env()?;
    info!("Relay starting for {}", config.user);

    info!("Initializing store at {}", config.db_path.display());
    let store = store::Store::new(&config.db_path)
        .await?
        .with_poll_interval(config.poll_interval);
    store.init().await?;
    store.save_user(&config.user).await?;
    let store = Arc::new(store);

    let suggestions = match &config.suggest_url {
        Some(url) => {
            let service = Arc::new(suggestion::HttpSuggestionService::new(url.clone())?);
            Some(suggestion::SuggestionPipeline::new(
                service,
                config.suggestion.clone(),
            ))
        }
        None => {
            info!("RELAY_SUGGEST_URL not set, emoji suggestions disabled.");
            None
        }
    };

    let session = session::ConversationSession::new(store.clone(), config.user.clone());
    let terminal = interface::terminal::TerminalInterface::new(
        store,
        session,
        suggestions,
        config.poll_interval,
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = terminal.run() => {
            if let Err(e) = res {
                error!("Terminal interface stopped with error: {:#}", e);
                return Err(e);
            }
        }
    }

    Ok(())
}
