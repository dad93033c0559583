use std::sync::Arc;
use std::time::Duration;

use hyper::Method;
use tako::gateway::config::Config;
use tako::gateway::dispatcher::Dispatcher;
use tako::gateway::routes;
use tako::gateway::token::TokenIssuer;
use tako::gateway::users::InMemoryUserStore;
use tako::router::Router;
use tako::state::set_state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();

    let jwt_secret = config.jwt_secret.clone();
    set_state::<TokenIssuer>(TokenIssuer::new(&jwt_secret));

    // Every-account quota policy is someone else's call; the in-memory
    // store here is the external-collaborator placeholder.
    let users = Arc::new(InMemoryUserStore::new());
    let dispatcher = Dispatcher::new(config, users);
    set_state::<Arc<Dispatcher>>(dispatcher);

    let mut router = Router::new();
    router.route(Method::GET, "/", routes::index);
    router.route(Method::GET, "/api/server/stats", routes::server_stats);
    router.route(Method::GET, "/api/login", routes::login);
    router.route(Method::GET, "/api/yd/decryptl", routes::decrypt);
    router.route(Method::GET, "/api/query/persondata", routes::query_persondata);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    tako::server::serve_with_shutdown(listener, router, shutdown, Duration::from_secs(3)).await?;
    Ok(())
}
