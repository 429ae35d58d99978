//! Minimal end-to-end usage: register a model with an RPM + concurrency
//! chain, submit a handful of requests, print the responses.

use reqwise::{LimiterConfig, LimiterKind, ModelConfig, ProcessorOutcome, Registry, Request};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let registry: Registry<String, String> = Registry::new();

    let config = ModelConfig::new(
        "gpt-4o-mini",
        vec![
            LimiterConfig::new(LimiterKind::Rpm, 5),
            LimiterConfig::new(LimiterKind::Concurrent, 2),
        ],
    );

    registry
        .register(config, |request: Request<String>| async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(ProcessorOutcome::with_tokens(
                format!("echo: {}", request.params),
                request.estimated_input_tokens.unwrap_or(0),
                8,
            ))
        })
        .expect("registration should succeed on a fresh registry");

    for i in 0..5 {
        let request = Request::new("gpt-4o-mini", format!("hello #{i}"))
            .estimated_tokens(Some(10), Some(8));
        let response = registry.submit(request).await.expect("model is registered");
        println!(
            "request {} -> status={:?} result={:?}",
            response.request_id, response.status, response.result
        );
    }

    let info = registry.queue_info("gpt-4o-mini").await.unwrap();
    println!("queue_info: {info:?}");

    registry.shutdown_all().await;
}
