use clap::Parser;
use inkauth::{
    config::{Command, Config},
    server::run_server,
};
use migration::MigratorTrait;
use sea_orm::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let config = Config::parse();

    // Initialize logger based on command
    let log_level = match &config.command {
        Command::Serve(serve_config) => serve_config.log_level.as_str(),
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match config.command {
        Command::Serve(serve_config) => {
            run_server(serve_config).await?;
        }
        Command::Migrate { database_url } => {
            run_migrations(&database_url).await?;
        }
    }

    Ok(())
}

async fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    log::info!("Connecting to database: {}", database_url);
    let db = Database::connect(database_url).await?;

    log::info!("Running database migrations...");
    migration::Migrator::up(&db, None).await?;

    println!("✅ Database migrations completed successfully!");

    Ok(())
}
