use chat_relay::adapters::WsTransport;
use chat_relay::settings::RelayConfig;
use chat_relay::storage::SqliteStore;
use chat_relay::transport::MemoryBus;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(feature = "tracing")]
    {
        tracing_subscriber::fmt()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
            .init();
    }
    let config = RelayConfig::load()?;
    let store = Arc::new(SqliteStore::new(&config.database_url, config.max_db_connections).await?);
    let bus = Arc::new(MemoryBus::new(config.channel_capacity));
    let transport = WsTransport::new(store.clone(), bus, config.chat(), config.ws());

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    transport
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    store.close().await;
    Ok(())
}
