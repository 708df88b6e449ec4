use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use essay_bench::gateway::openai_compat::ChatProvider;
use essay_bench::gateway::{
    Attribution, ChatModel, ChatRequest, EndpointConfig, FinishReason, Message, NoopUsageSink,
    OpenAiCompatAdapter, ProviderError, ProviderGateway, RetryPolicy,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenAiCompatAdapter {
    OpenAiCompatAdapter::new(
        EndpointConfig::new("sk-test", server.uri()).timeout(Duration::from_secs(5)),
    )
    .unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::huggingface("deepseek-ai/DeepSeek-R1-Distill-Qwen-7B"),
        vec![Message::system("评分"), Message::user("题目：春天")],
        Attribution::new("test").with_item(3),
    )
    .temperature(0.1)
    .max_tokens(1000)
}

fn ok_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 34 }
    })
}

#[tokio::test]
async fn parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "deepseek-ai/DeepSeek-R1-Distill-Qwen-7B",
            "max_tokens": 1000,
            "messages": [
                { "role": "system", "content": "评分" },
                { "role": "user", "content": "题目：春天" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("  分数：8  ")))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request()).await.unwrap();
    assert_eq!(resp.content, "分数：8");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 34);
}

#[tokio::test]
async fn extra_headers_are_sent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("x-title", "essay-bench"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("ok")))
        .mount(&server)
        .await;

    let adapter = OpenAiCompatAdapter::new(
        EndpointConfig::new("sk-test", format!("{}/", server.uri())).header("X-Title", "essay-bench"),
    )
    .unwrap();
    let resp = adapter.chat(&request()).await.unwrap();
    assert_eq!(resp.content, "ok");
}

#[tokio::test]
async fn http_429_is_remote_rate_limit_with_retry_after_hint() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "req-42")
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), "rate_limited");
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("req-42"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn http_429_without_hint_leaves_reset_unknown() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert_eq!(err.reset_hint(), None);
}

#[tokio::test]
async fn server_errors_are_retryable_and_client_errors_are_not() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": { "message": "overloaded", "code": 503 }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.context().and_then(|c| c.provider_code.as_deref()), Some("503"));

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model" }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("bad model"));
}

#[tokio::test]
async fn empty_choices_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.to_string().contains("No choices"));
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    failures: usize,
    failure: ResponseTemplate,
    success: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            self.failure.clone()
        } else {
            self.success.clone()
        }
    }
}

async fn flaky_server(failures: usize, failure: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            failures,
            failure,
            success: ResponseTemplate::new(200).set_body_json(ok_body("ok")),
        })
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn gateway_retries_until_success() {
    let server = flaky_server(
        2,
        ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "transient error", "code": "internal" }
        })),
    )
    .await;

    let gateway = ProviderGateway::new(Arc::new(adapter(&server)), Arc::new(NoopUsageSink))
        .with_retry(RetryPolicy::immediate(5));

    let resp = gateway.chat(request()).await.unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn gateway_retries_non_retryable_errors_too() {
    let server = flaky_server(1, ResponseTemplate::new(400)).await;

    let gateway = ProviderGateway::new(Arc::new(adapter(&server)), Arc::new(NoopUsageSink))
        .with_retry(RetryPolicy::immediate(3));

    let resp = gateway.chat(request()).await.unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn gateway_surfaces_last_error_when_attempts_run_out() {
    let server = flaky_server(10, ResponseTemplate::new(502)).await;

    let gateway = ProviderGateway::new(Arc::new(adapter(&server)), Arc::new(NoopUsageSink))
        .with_retry(RetryPolicy::immediate(3));

    let err = gateway.chat(request()).await.unwrap_err();
    assert!(err.to_string().contains("HTTP 502"));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn chat_once_makes_exactly_one_attempt() {
    let server = flaky_server(1, ResponseTemplate::new(500)).await;

    let gateway = ProviderGateway::new(Arc::new(adapter(&server)), Arc::new(NoopUsageSink))
        .with_retry(RetryPolicy::immediate(5));

    assert!(gateway.chat_once(request()).await.is_err());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
