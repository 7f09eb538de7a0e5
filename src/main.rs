use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use quiz_lottery::api::ChatApi;
use quiz_lottery::config::{self, Config};
use quiz_lottery::database::SqlitePersistence;
use quiz_lottery::engine::Registry;
use quiz_lottery::rpc_handler::{RpcHandler, stdio};
use quiz_lottery::services::{Backend, Services};
use quiz_lottery::store::{MemoryStore, RedisStore};
use quiz_lottery::use_cases::QuizUseCase;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Quiz lottery engine starting.");

    let persistence = SqlitePersistence::open(&config.database_url)?;
    let gateway = ChatApi::new(&config.chat_api_url, &config.chat_bot_token);

    match config.redis_url.as_deref() {
        Some(url) => {
            let backend = Services {
                gateway,
                persistence,
                participations: RedisStore::new(url)?,
                cache: RedisStore::new(url)?,
            };
            serve(Arc::new(backend), config).await
        }
        None => {
            tracing::warn!("REDIS_URL not set, votes and winners are kept in memory");
            let backend = Services {
                gateway,
                persistence,
                participations: MemoryStore::new(),
                cache: MemoryStore::new(),
            };
            serve(Arc::new(backend), config).await
        }
    }
}

async fn serve<B: Backend>(backend: Arc<B>, config: Config) -> Result<()> {
    let registry = Registry::new(backend, config.engine);
    registry.start().await?;
    tracing::info!(
        "recovered {} lotteries with {} games",
        registry.lottery_count(),
        registry.game_count()
    );

    let handler = RpcHandler::new(Arc::new(QuizUseCase::new(Arc::clone(&registry))));
    let (reader, writer) = stdio();

    let served = tokio::select! {
        result = handler.serve(reader, writer) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            Ok(())
        }
    };

    registry.shutdown();
    served.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })
}
