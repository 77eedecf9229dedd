use std::env;
use std::time::Duration;

use conduit_llm::config::{GatewayConfig, build_default_client};
use conduit_llm::{ChatMessage, ChatRequest, SessionObserver, SessionState, UsageStats};
use dotenvy::dotenv;
use tokio::sync::mpsc::{self, UnboundedSender};

fn load_env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

struct Collector(UnboundedSender<String>);

impl SessionObserver for Collector {
    fn on_content(&mut self, text: &str) {
        let _ = self.0.send(text.to_string());
    }

    fn on_complete(&mut self, usage: Option<&UsageStats>) {
        eprintln!("stream completed: {usage:?}");
    }

    fn on_error(&mut self, message: &str) {
        eprintln!("stream error: {message}");
    }
}

#[tokio::test]
#[ignore = "requires a running gateway"]
async fn gateway_live_rest_and_stream() {
    let _ = dotenv();

    if load_env_var("CONDUIT_BASE_URL").is_none() {
        eprintln!("skip live test: CONDUIT_BASE_URL missing");
        return;
    }
    let Some(provider) = load_env_var("CONDUIT_LIVE_PROVIDER") else {
        eprintln!("skip live test: CONDUIT_LIVE_PROVIDER missing");
        return;
    };
    let Some(model) = load_env_var("CONDUIT_LIVE_MODEL") else {
        eprintln!("skip live test: CONDUIT_LIVE_MODEL missing");
        return;
    };

    let config = GatewayConfig::from_env().expect("config from env");
    let client = build_default_client(&config).expect("client");

    let health = client.health().await.expect("health should succeed");
    assert_eq!(health.status, "ok");
    let providers = client.providers().await.expect("providers should succeed");
    assert!(providers.contains(&provider), "gateway should serve {provider}");

    let request = ChatRequest::builder(provider, model)
        .message(ChatMessage::user("Please introduce Rust language in one sentence."))
        .max_tokens(100)
        .build()
        .expect("request");

    let response = client
        .chat(request.clone())
        .await
        .expect("chat request should succeed");
    assert!(!response.content.is_empty(), "chat should return content");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client
        .stream_chat(request, Collector(tx))
        .expect("stream should open");
    handle.close_after(Duration::from_secs(60));

    assert_eq!(handle.join().await, SessionState::Completed);
    let mut saw_chunk = false;
    while rx.recv().await.is_some() {
        saw_chunk = true;
    }
    assert!(saw_chunk, "stream should yield at least one content fragment");
    assert_eq!(client.ledger().summarize().total_calls, 2);
}
