use std::error::Error;

use serde_json::json;
use spark_stream::stream::client::StreamClient;
use spark_stream::stream::config::{Endpoint, StreamConfig};
use spark_stream::stream::message::Message;

fn main() -> Result<(), Box<dyn Error>> {
    let origin = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let endpoint = Endpoint::from_http_origin(&origin, "/ws")?;
        let config = StreamConfig::default().with_max_backoff_ms(10_000);
        let client = StreamClient::with_config(endpoint, config);

        client.on_text(|text: &str| println!("event text={text}"));

        client.connect().await;
        println!("state={:?} endpoint={}", client.state(), client.endpoint());

        client.send_json(&json!({"type": "hello"})).await?;

        while let Some(message) = client.next().await? {
            match message {
                Message::Text(text) if text == "bye" => break,
                Message::Text(text) => println!("pulled text={text}"),
                Message::Binary(data) => println!("pulled binary len={}", data.len()),
            }
        }

        client.close();
        Ok::<(), Box<dyn Error>>(())
    })
}
