use std::sync::Arc;

use channel_referrals::{
    config::Config, db::DBClient, handler::dispatch, service::engine::ReferralEngine,
};
use dotenv::dotenv;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() {
    dotenv().ok();

    let config = match Config::init() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("🔥 Invalid configuration: {}", err);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_writer(std::io::stderr)
        .init();

    let db_client = match DBClient::connect(&config).await {
        Ok(db_client) => {
            tracing::info!("✅Connection to the database is successful!");
            db_client
        }
        Err(err) => {
            tracing::error!("🔥 Failed to connect to the database: {:?}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = db_client.migrate().await {
        tracing::error!("🔥 Failed to run database migrations: {:?}", err);
        std::process::exit(1);
    }

    let engine = ReferralEngine::new(Arc::new(db_client), &config);
    tracing::info!(
        "🚀 Referral engine ready (target {}), reading commands from stdin",
        engine.referral_target()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::error!("Failed to read command: {}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let mut reply = dispatch(&engine, &config, &line).await;
        reply.push('\n');
        if let Err(err) = stdout.write_all(reply.as_bytes()).await {
            tracing::error!("Failed to write reply: {}", err);
            break;
        }
        if let Err(err) = stdout.flush().await {
            tracing::error!("Failed to flush reply: {}", err);
            break;
        }
    }

    tracing::info!("Input closed, shutting down");
}
