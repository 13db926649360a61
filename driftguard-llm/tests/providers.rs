mod common;

use driftguard_common::DriftError;
use driftguard_llm::ollama::OllamaClient;
use driftguard_llm::openai::OpenAiClient;
use driftguard_llm::traits::{LlmClient, OutputSchema};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn selector_schema() -> OutputSchema {
    OutputSchema::new(
        "selector_repair",
        json!({
            "type": "object",
            "properties": { "selector": { "type": "string" } },
            "required": ["selector"],
            "additionalProperties": false
        }),
    )
}

#[tokio::test]
async fn openai_structured_request_uses_json_schema_format() {
    common::init_test_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": "selector_repair", "strict": true }
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "gpt-4o-mini",
            "choices": [{ "message": { "content": "{\"selector\":\"#email\"}" } }],
            "usage": { "total_tokens": 42 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiClient::new(&server.uri(), "sk-test".into(), "gpt-4o-mini".into()).unwrap();
    let value = client
        .generate_structured("find the email box", Some("you repair selectors"), &selector_schema())
        .await
        .unwrap();

    assert_eq!(value["selector"], "#email");
}

#[tokio::test]
async fn openai_rate_limit_maps_to_repair_unavailable() {
    common::init_test_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let client = OpenAiClient::new(&server.uri(), "sk-test".into(), "gpt-4o-mini".into()).unwrap();
    let err = client
        .generate_structured("prompt", None, &selector_schema())
        .await
        .unwrap_err();

    match err {
        DriftError::ExternalRepairUnavailable(msg) => assert!(msg.contains("Rate limit")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn openai_non_json_content_is_an_error() {
    common::init_test_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "I cannot help with that" } }]
        })))
        .mount(&server)
        .await;

    let client = OpenAiClient::new(&server.uri(), "sk-test".into(), "gpt-4o-mini".into()).unwrap();
    assert!(client
        .generate_structured("prompt", None, &selector_schema())
        .await
        .is_err());
}

#[tokio::test]
async fn ollama_structured_request_sends_schema_as_format() {
    common::init_test_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{ "name": "llama3.2:3b" }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "llama3.2:3b",
            "stream": false,
            "format": { "required": ["selector"] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "{\"selector\": \"input[name=email]\"}",
            "eval_count": 12
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::new(server.uri(), "llama3.2:3b".into())
        .await
        .unwrap();
    let value = client
        .generate_structured("prompt", None, &selector_schema())
        .await
        .unwrap();

    assert_eq!(value["selector"], "input[name=email]");
    assert!(client.health_check().await.unwrap());
}

#[tokio::test]
async fn ollama_unreachable_server_fails_fast() {
    common::init_test_tracing();
    let err = OllamaClient::new("http://127.0.0.1:9".into(), "llama3.2:3b".into())
        .await
        .err()
        .expect("no server listening");
    assert!(matches!(err, DriftError::ExternalRepairUnavailable(_)));
}
