mod common;

use chat_stream_relay::config::InvocationConfig;
use chat_stream_relay::dispatcher::StreamDispatcher;
use chat_stream_relay::metrics::StreamMetrics;
use chat_stream_relay::models::{StreamFrame, ToolEvent, Usage};
use chat_stream_relay::tool_events::tool_event_channel;
use common::{ScriptedAgent, Step, content_texts, text};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;

fn config() -> InvocationConfig {
    InvocationConfig::new("support-bot", "claude-test")
}

async fn run(agent: ScriptedAgent) -> Vec<StreamFrame> {
    let (_sink, queue) = tool_event_channel();
    StreamDispatcher::new(config(), queue)
        .stream(Arc::new(agent), "question")
        .collect()
        .await
}

async fn run_with_tools(
    build: impl FnOnce(chat_stream_relay::tool_events::ToolEventSink) -> ScriptedAgent,
) -> Vec<StreamFrame> {
    let (sink, queue) = tool_event_channel();
    let agent = build(sink);
    StreamDispatcher::new(config(), queue)
        .stream(Arc::new(agent), "question")
        .collect()
        .await
}

fn assert_single_terminal_last(frames: &[StreamFrame]) {
    let terminals = frames.iter().filter(|f| f.is_terminal()).count();
    assert_eq!(terminals, 1, "frames: {:?}", frames);
    assert!(frames.last().unwrap().is_terminal());
}

#[tokio::test]
async fn test_tool_event_then_deduplicated_content() {
    let frames = run_with_tools(|sink| {
        ScriptedAgent::new(vec![text("Hi"), text("Hi")])
            .with_tools(sink)
            .with_tool_on_open(ToolEvent::new("calc", "started"))
    })
    .await;

    assert_eq!(frames.len(), 3);
    assert_eq!(
        frames[0],
        StreamFrame::ToolUse {
            tool_name: "calc".to_string(),
            status: "started".to_string(),
            payload: serde_json::Value::Null,
        }
    );
    assert_eq!(frames[1].content_text(), Some("Hi"));
    assert!(matches!(frames[2], StreamFrame::Completion { .. }));
}

#[tokio::test]
async fn test_consecutive_duplicates_suppressed() {
    let frames = run(ScriptedAgent::new(vec![
        text("Hi"),
        text("Hi"),
        text("there"),
        text("there"),
        text("Hi"),
    ]))
    .await;

    assert_eq!(content_texts(&frames), vec!["Hi", "there", "Hi"]);
    assert_single_terminal_last(&frames);
}

#[tokio::test]
async fn test_empty_and_textless_events_skipped() {
    let frames = run(ScriptedAgent::new(vec![
        text(""),
        Step::Emit(json!({"event": {"contentBlockStop": {}}}).into()),
        Step::Emit(json!({"data": "mapped"}).into()),
        text(""),
    ]))
    .await;

    assert_eq!(content_texts(&frames), vec!["mapped"]);
    assert_single_terminal_last(&frames);
}

#[tokio::test]
async fn test_content_frames_carry_invocation_identity() {
    let frames = run(ScriptedAgent::new(vec![text("x")])).await;

    match &frames[0] {
        StreamFrame::Content {
            agent_name,
            model_id,
            ..
        } => {
            assert_eq!(agent_name, "support-bot");
            assert_eq!(model_id, "claude-test");
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_stale_tool_events_cleared_at_start() {
    let (sink, queue) = tool_event_channel();
    sink.push(ToolEvent::new("leftover", "completed"));

    let frames: Vec<StreamFrame> = StreamDispatcher::new(config(), queue)
        .stream(Arc::new(ScriptedAgent::new(vec![text("fresh")])), "q")
        .collect()
        .await;

    assert!(frames.iter().all(|f| f.frame_type() != "tool_use"));
    assert_eq!(content_texts(&frames), vec!["fresh"]);
}

#[tokio::test]
async fn test_tool_events_interleaved_in_arrival_order() {
    let frames = run_with_tools(|sink| {
        ScriptedAgent::new(vec![
            text("Let me check."),
            Step::Tool(ToolEvent::new("search", "started")),
            Step::Tool(ToolEvent::new("search", "completed").with_payload(json!({"hits": 2}))),
            text("Found it."),
        ])
        .with_tools(sink)
    })
    .await;

    let kinds: Vec<&str> = frames.iter().map(|f| f.frame_type()).collect();
    assert_eq!(
        kinds,
        vec!["content", "tool_use", "tool_use", "content", "completion"]
    );
    match &frames[2] {
        StreamFrame::ToolUse {
            status, payload, ..
        } => {
            assert_eq!(status, "completed");
            assert_eq!(payload["hits"], 2);
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_trailing_tool_events_not_dropped() {
    let frames = run_with_tools(|sink| {
        ScriptedAgent::new(vec![
            text("done"),
            Step::Tool(ToolEvent::new("notify", "completed")),
        ])
        .with_tools(sink)
    })
    .await;

    let kinds: Vec<&str> = frames.iter().map(|f| f.frame_type()).collect();
    assert_eq!(kinds, vec!["content", "tool_use", "completion"]);
}

#[tokio::test]
async fn test_last_usage_wins() {
    let frames = run(ScriptedAgent::new(vec![
        Step::Emit(json!({"metadata": {"usage": {"inputTokens": 1, "outputTokens": 1}}}).into()),
        text("answer"),
        Step::Emit(
            json!({"event": {"metadata": {"usage": {"inputTokens": 10, "outputTokens": 20, "totalTokens": 30}}}})
                .into(),
        ),
    ]))
    .await;

    match frames.last().unwrap() {
        StreamFrame::Completion { usage, .. } => assert_eq!(
            usage.as_ref(),
            Some(&Usage {
                input_tokens: 10,
                output_tokens: 20,
                total_tokens: 30,
                stop_reason: None,
            })
        ),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_completion_without_usage() {
    let frames = run(ScriptedAgent::new(vec![text("a")])).await;
    assert!(matches!(
        frames.last(),
        Some(StreamFrame::Completion { usage: None, .. })
    ));
}

#[tokio::test]
async fn test_streaming_unsupported_falls_back() {
    let metrics = Arc::new(StreamMetrics::new());
    let (_sink, queue) = tool_event_channel();
    let frames: Vec<StreamFrame> = StreamDispatcher::new(config(), queue)
        .with_metrics(metrics.clone())
        .stream(
            Arc::new(ScriptedAgent::non_streaming("The whole answer.")),
            "q",
        )
        .collect()
        .await;

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].content_text(), Some("The whole answer."));
    assert!(matches!(frames[1], StreamFrame::Completion { .. }));
    assert_eq!(metrics.snapshot().streaming_fallbacks, 1);
    assert_eq!(metrics.snapshot().stream_errors, 0);
}

#[tokio::test]
async fn test_fallback_invoke_failure_is_error_frame() {
    let frames = run(ScriptedAgent::non_streaming("unused").with_invoke_error("throttled")).await;

    assert_eq!(frames.len(), 1);
    match &frames[0] {
        StreamFrame::Error { message, .. } => assert!(message.contains("throttled")),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_mid_stream_failure_terminates_with_error() {
    let frames = run(ScriptedAgent::new(vec![
        text("partial"),
        Step::Fail("connection reset".to_string()),
        text("never seen"),
    ]))
    .await;

    assert_eq!(content_texts(&frames), vec!["partial"]);
    assert_single_terminal_last(&frames);
    match frames.last().unwrap() {
        StreamFrame::Error {
            message,
            agent_name,
            model_id,
        } => {
            assert!(message.contains("connection reset"));
            assert_eq!(agent_name, "support-bot");
            assert_eq!(model_id, "claude-test");
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_agent_panic_becomes_error_frame() {
    let frames = run(ScriptedAgent::new(vec![
        text("before"),
        Step::Panic("provider exploded".to_string()),
    ]))
    .await;

    assert_single_terminal_last(&frames);
    match frames.last().unwrap() {
        StreamFrame::Error { message, .. } => assert!(message.contains("provider exploded")),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn test_exactly_one_terminal_frame_for_all_outcomes() {
    let scripts = vec![
        ScriptedAgent::new(vec![]),
        ScriptedAgent::new(vec![text("a"), text("b")]),
        ScriptedAgent::new(vec![Step::Fail("x".to_string())]),
        ScriptedAgent::non_streaming("whole"),
        ScriptedAgent::non_streaming("").with_invoke_error("nope"),
    ];

    for agent in scripts {
        let frames = run(agent).await;
        assert_single_terminal_last(&frames);
    }
}

#[tokio::test]
async fn test_oversized_usage_still_completes() {
    let frames = run(ScriptedAgent::new(vec![
        text("big"),
        Step::Emit(json!({"metadata": {"usage": {"inputTokens": u64::MAX, "outputTokens": 1}}}).into()),
    ]))
    .await;

    assert_single_terminal_last(&frames);
    match frames.last().unwrap() {
        StreamFrame::Completion { usage, .. } => {
            assert_eq!(usage.as_ref().map(|u| u.total_tokens), Some(u64::MAX))
        }
        other => panic!("unexpected frame {:?}", other),
    }
}
