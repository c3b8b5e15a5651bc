use polyhttp::{Message, Response, Router, Server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let mut router = Router::new();
    router
        .get("/", |_| async {
            Response::html(
                "<h1>chat</h1><script>\
                 const ws = new WebSocket(`ws://${location.host}/ws/lobby`);\
                 ws.onmessage = e => console.log(e.data);\
                 ws.onopen = () => ws.send('hello');\
                 </script>",
            )
        })
        .unwrap();
    router
        .websocket("/ws/{room}", |conn| async move {
            let room = conn.param("room").unwrap_or("lobby").to_string();
            tracing::info!(room, "websocket session started");

            while let Ok(Some(message)) = conn.recv().await {
                let reply = match &message {
                    Message::Text(text) => Message::Text(format!("[{room}] {text}")),
                    binary => binary.clone(),
                };
                if conn.send(&reply).await.is_err() {
                    break;
                }
            }
            tracing::info!(room, "websocket session ended");
        })
        .unwrap();

    Server::builder().router(router).build().unwrap().run().await.unwrap();
}
