use polyhttp::{Response, Router, Server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut router = Router::new();
    router
        .get("/hello", |_| async { Response::text("Hello, world!") })
        .unwrap();
    router
        .get("/users/{id:int}", |req| async move {
            let id = req.param("id").unwrap_or("?").to_string();
            Response::json(&serde_json::json!({ "user": id }))
        })
        .unwrap();

    let server = Server::builder().router(router).build().unwrap();
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.trigger();
    });

    if let Err(error) = server.run().await {
        eprintln!("fatal: {error}");
        std::process::exit(error.exit_code());
    }
}
