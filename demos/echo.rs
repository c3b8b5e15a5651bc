use polyhttp::{Response, Router, Server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let mut router = Router::new();
    router
        .post("/echo", |req| async move {
            // Echo the raw body back; JSON bodies come back as JSON.
            let content_type = req
                .headers()
                .get_str("content-type")
                .unwrap_or("application/octet-stream")
                .to_string();
            Response::new(200)
                .with_header("content-type", content_type)
                .with_body(req.body().to_vec())
        })
        .unwrap();
    router
        .get("/inspect", |req| async move {
            Response::json(&serde_json::json!({
                "path": req.path(),
                "query": req.query(),
                "protocol": req.version().as_str(),
            }))
        })
        .unwrap();

    Server::builder()
        .router(router)
        .middleware(|req, next| async move {
            let started = std::time::Instant::now();
            let method = req.method().clone();
            let path = req.path().to_string();
            let response = next.run(req).await;
            tracing::info!(
                %method,
                path,
                status = response.status(),
                elapsed = ?started.elapsed(),
                "request"
            );
            response
        })
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();
}
