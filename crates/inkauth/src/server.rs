use crate::{
    app_state::{AppState, CookieSettings, OAuthConfig},
    config::ServeConfig,
    handlers,
    providers::ProviderRegistry,
    refresher::{Refresher, RefreshSettings},
};
use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use inkauth_core::sealer::Sealer;
use migration::MigratorTrait;
use sea_orm::Database;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn run_server(config: ServeConfig) -> anyhow::Result<()> {
    log::info!("Starting inkauth...");

    // 1. Sealer first: a bad key should fail startup, not the first login.
    let sealer = Sealer::new(&config.token_enc_key)?;

    // 2. Connect to database and run migrations
    log::info!("Connecting to database: {}", config.database_url);
    let db = Database::connect(&config.database_url).await?;

    log::info!("Running database migrations...");
    migration::Migrator::up(&db, None).await?;
    log::info!("Database migrations completed");

    // 3. Shared state
    let oauth = OAuthConfig {
        google_client_id: config.google_client_id.clone(),
        google_client_secret: config.google_client_secret.clone(),
        github_client_id: config.github_client_id.clone(),
        github_client_secret: config.github_client_secret.clone(),
        redirect_base: config.base_url.clone(),
    };
    let registry = Arc::new(ProviderRegistry::builtin(&oauth, &config.pds_base));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let app_state = web::Data::new(AppState {
        db: db.clone(),
        sealer,
        http,
        pds_base: config.pds_base.clone(),
        session_ttl: chrono::Duration::days(config.session_ttl_days),
        cookie: CookieSettings {
            domain: config.cookie_domain.clone(),
            secure: config.cookie_secure,
        },
        oauth,
        oauth_success_redirect: config.oauth_success_redirect.clone(),
        admin_token: config.admin_token.clone(),
    });

    // 4. Background refresh scheduler
    let shutdown = CancellationToken::new();
    let refresher = Arc::new(Refresher::new(
        app_state.clone().into_inner(),
        registry,
        RefreshSettings::from_config(&config),
    ));
    let refresher_handle = refresher.spawn(shutdown.clone());

    // 5. HTTP server
    let bind_address = config.bind_address.clone();
    let cors_origins = config.cors_origin_list();
    log::info!("Listening on {}", bind_address);

    HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![
                actix_web::http::header::AUTHORIZATION,
                actix_web::http::header::ACCEPT,
                actix_web::http::header::CONTENT_TYPE,
            ])
            .supports_credentials()
            .max_age(3600);
        for origin in &cors_origins {
            cors = cors.allowed_origin(origin);
        }

        let auth_routes = web::scope("/api/auth")
            .route("/login", web::post().to(handlers::auth::bsky_login))
            .route("/logout", web::post().to(handlers::auth::logout))
            .route("/me", web::get().to(handlers::auth::me))
            .route(
                "/oauth/{provider}/start",
                web::get().to(handlers::auth::oauth_start),
            )
            .route(
                "/oauth/{provider}/callback",
                web::get().to(handlers::auth::oauth_callback),
            )
            .route("/accounts", web::get().to(handlers::accounts::list))
            .route("/unlink", web::post().to(handlers::accounts::unlink));

        let admin_routes = web::scope("/api/admin")
            .route("/needs-reauth", web::get().to(handlers::admin::needs_reauth));

        App::new()
            .app_data(app_state.clone())
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .service(auth_routes)
            .service(admin_routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    // 6. Stop the scheduler before exiting
    shutdown.cancel();
    if let Err(err) = refresher_handle.await {
        log::warn!("refresher task did not exit cleanly: {err}");
    }

    Ok(())
}
