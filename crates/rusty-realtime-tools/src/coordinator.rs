//! Tool call coordination.
//!
//! The model may request a tool call at any point of the conversation. Calls
//! are handed from the session loop to the dispatcher through a single-slot
//! mailbox: a bounded channel of capacity one. Submitting while a call is
//! still sitting in the slot fails with [`RealtimeError::Conflict`] instead of
//! overwriting it. The channel's `try_send` performs the "is a call pending"
//! check and the write as one atomic step, so concurrent submitters cannot
//! both win.
//!
//! [`ToolResults`] is the dispatcher. It drains the mailbox, resolves and
//! validates each call, runs valid ones as concurrent tasks, and yields one
//! event per call in completion order.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{FutureExt, Stream};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use rusty_realtime_core::error::{RealtimeError, Result};
use rusty_realtime_core::protocol::Event;
use rusty_realtime_core::types::PendingToolCall;

use crate::{Tool, ToolRegistry};

/// Accepts tool calls from the model and owns the dispatch side.
pub struct ToolCallCoordinator {
    mailbox: mpsc::Sender<PendingToolCall>,
    results: Mutex<Option<ToolResults>>,
}

impl ToolCallCoordinator {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        let (mailbox, inbox) = mpsc::channel(1);
        Self {
            mailbox,
            results: Mutex::new(Some(ToolResults {
                tools,
                inbox,
                inbox_closed: false,
                in_flight: JoinSet::new(),
            })),
        }
    }

    /// Place a call in the mailbox.
    ///
    /// Fails with `Conflict` if the previous call has not been picked up by
    /// the dispatcher yet; the pending call is kept. Fails with `Cancelled`
    /// once the dispatcher is gone.
    pub fn submit(&self, call: PendingToolCall) -> Result<()> {
        match self.mailbox.try_send(call) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(rejected)) => {
                warn!(call_id = %rejected.call_id, tool = %rejected.name, "Tool call rejected, another call is pending");
                Err(RealtimeError::Conflict {
                    call_id: rejected.call_id,
                })
            }
            Err(TrySendError::Closed(_)) => Err(RealtimeError::Cancelled),
        }
    }

    /// Take the result stream. It can be taken once; later calls return `None`.
    pub fn results(&self) -> Option<ToolResults> {
        self.results.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Stream of tool output events, one per submitted call, in completion order.
///
/// Never ends while the coordinator is alive. After the coordinator is
/// dropped it ends once every in-flight call has produced its event. Dropping
/// the stream aborts calls that are still running.
pub struct ToolResults {
    tools: Arc<ToolRegistry>,
    inbox: mpsc::Receiver<PendingToolCall>,
    inbox_closed: bool,
    in_flight: JoinSet<Event>,
}

impl ToolResults {
    /// Number of tool calls currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Resolve and validate a call. Returns an event right away when the call
    /// cannot run; otherwise spawns it and returns `None`.
    fn dispatch(&mut self, call: PendingToolCall) -> Option<Event> {
        let Some(tool) = self.tools.get(&call.name) else {
            let err = RealtimeError::ToolNotFound {
                name: call.name.clone(),
                available: self.tools.list(),
            };
            warn!(call_id = %call.call_id, %err, "Tool call failed");
            return Some(Event::tool_error(&call.call_id, err));
        };

        let args: Value = match serde_json::from_str(&call.raw_arguments) {
            Ok(args) => args,
            Err(e) => {
                let err = RealtimeError::ToolArguments {
                    arguments: call.raw_arguments.clone(),
                    reason: e.to_string(),
                };
                warn!(call_id = %call.call_id, %err, "Tool call failed");
                return Some(Event::tool_error(&call.call_id, err));
            }
        };

        info!(call_id = %call.call_id, tool = %call.name, "Dispatching tool call");
        self.in_flight.spawn(run_tool(tool, call, args));
        None
    }
}

impl Stream for ToolResults {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = &mut *self;
        loop {
            if !this.inbox_closed {
                match this.inbox.poll_recv(cx) {
                    Poll::Ready(Some(call)) => {
                        if let Some(event) = this.dispatch(call) {
                            return Poll::Ready(Some(event));
                        }
                        continue;
                    }
                    Poll::Ready(None) => this.inbox_closed = true,
                    Poll::Pending => {}
                }
            }

            match this.in_flight.poll_join_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(e))) => {
                    // run_tool catches panics, so this is an abort.
                    debug!(%e, "Tool task ended without a result");
                    continue;
                }
                Poll::Ready(None) if this.inbox_closed => return Poll::Ready(None),
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Execution task body: invoke the tool and package the result for `call_id`.
async fn run_tool(tool: Arc<dyn Tool>, call: PendingToolCall, args: Value) -> Event {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(tool.invoke(args)).catch_unwind().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(output)) => {
            debug!(call_id = %call.call_id, tool = %call.name, elapsed_ms, "Tool call finished");
            Event::tool_output(&call.call_id, output.into_text())
        }
        Ok(Err(e)) => {
            warn!(call_id = %call.call_id, tool = %call.name, elapsed_ms, %e, "Tool returned an error");
            Event::tool_error(&call.call_id, e)
        }
        Err(_) => {
            error!(call_id = %call.call_id, tool = %call.name, elapsed_ms, "Tool panicked");
            Event::tool_error(&call.call_id, format!("tool {} panicked", call.name))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::ToolOutput;

    /// Sleeps for `args.delay_ms`, then echoes `args`.
    struct EchoTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "search"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"delay_ms": {"type": "integer"}}})
        }
        async fn invoke(&self, args: Value) -> anyhow::Result<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ms) = args.get("delay_ms").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(ToolOutput::Json(args))
        }
    }

    struct FailingTool {
        panic: bool,
    }

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            if self.panic { "panicky" } else { "failing" }
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn invoke(&self, _args: Value) -> anyhow::Result<ToolOutput> {
            if self.panic {
                panic!("tool exploded");
            }
            anyhow::bail!("upstream unavailable")
        }
    }

    fn setup() -> (Arc<EchoTool>, ToolCallCoordinator, ToolResults) {
        let echo = Arc::new(EchoTool {
            calls: AtomicUsize::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register(echo.clone());
        registry.register(Arc::new(FailingTool { panic: false }));
        registry.register(Arc::new(FailingTool { panic: true }));
        let coordinator = ToolCallCoordinator::new(Arc::new(registry));
        let results = coordinator.results().unwrap();
        (echo, coordinator, results)
    }

    async fn next_within(results: &mut ToolResults, ms: u64) -> Option<Event> {
        tokio::time::timeout(Duration::from_millis(ms), results.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_tool_not_found_yields_error_immediately() {
        let (_echo, coordinator, mut results) = setup();
        coordinator
            .submit(PendingToolCall::new("c1", "nonexistent", "{}"))
            .unwrap();

        let event = results.next().now_or_never().flatten().expect("ready in one poll");
        assert_eq!(event.output_call_id(), Some("c1"));
        assert!(event.output_text().unwrap().starts_with("Error: tool nonexistent not found"));
        assert_eq!(results.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_malformed_arguments_never_invoke_tool() {
        let (echo, coordinator, mut results) = setup();
        coordinator
            .submit(PendingToolCall::new("c2", "search", "not-json"))
            .unwrap();

        let event = results.next().now_or_never().flatten().expect("ready in one poll");
        assert_eq!(event.output_call_id(), Some("c2"));
        assert!(event.output_text().unwrap().contains("failed to parse arguments `not-json`"));
        assert_eq!(results.in_flight(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_successful_call_serializes_output() {
        let (echo, coordinator, mut results) = setup();
        coordinator
            .submit(PendingToolCall::new("c3", "search", r#"{"query":"rust"}"#))
            .unwrap();

        let event = next_within(&mut results, 1000).await.unwrap();
        assert_eq!(event.output_call_id(), Some("c3"));
        assert_eq!(event.output_text(), Some(r#"{"query":"rust"}"#));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_submit_conflicts_and_first_is_not_lost() {
        let (echo, coordinator, mut results) = setup();
        coordinator
            .submit(PendingToolCall::new("first", "search", "{}"))
            .unwrap();
        let err = coordinator
            .submit(PendingToolCall::new("second", "search", "{}"))
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Conflict { ref call_id } if call_id == "second"));

        let event = next_within(&mut results, 1000).await.unwrap();
        assert_eq!(event.output_call_id(), Some("first"));
        assert!(next_within(&mut results, 100).await.is_none());
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slot_frees_once_dispatched() {
        let (_echo, coordinator, mut results) = setup();
        coordinator
            .submit(PendingToolCall::new("a", "nonexistent", "{}"))
            .unwrap();
        next_within(&mut results, 1000).await.unwrap();
        coordinator
            .submit(PendingToolCall::new("b", "nonexistent", "{}"))
            .unwrap();
        let event = next_within(&mut results, 1000).await.unwrap();
        assert_eq!(event.output_call_id(), Some("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submits_admit_exactly_one() {
        let (_echo, coordinator, _results) = setup();
        let coordinator = Arc::new(coordinator);
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                coordinator.submit(PendingToolCall::new(format!("c{i}"), "search", "{}"))
            }));
        }

        let mut accepted = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => accepted += 1,
                Err(RealtimeError::Conflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(conflicts, 15);
    }

    #[tokio::test]
    async fn test_results_arrive_in_completion_order() {
        let (_echo, coordinator, mut results) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = results.next().await {
                let _ = tx.send(event);
            }
        });

        coordinator
            .submit(PendingToolCall::new("slow", "search", r#"{"delay_ms":300}"#))
            .unwrap();
        let fast = PendingToolCall::new("fast", "search", r#"{"delay_ms":10}"#);
        loop {
            match coordinator.submit(fast.clone()) {
                Ok(()) => break,
                Err(RealtimeError::Conflict { .. }) => {
                    tokio::time::sleep(Duration::from_millis(5)).await
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.output_call_id(), Some("fast"));
        assert_eq!(second.output_call_id(), Some("slow"));
    }

    #[tokio::test]
    async fn test_tool_error_and_panic_become_error_events() {
        let (_echo, coordinator, mut results) = setup();

        coordinator
            .submit(PendingToolCall::new("e1", "failing", "{}"))
            .unwrap();
        let event = next_within(&mut results, 1000).await.unwrap();
        assert_eq!(event.output_call_id(), Some("e1"));
        assert_eq!(event.output_text(), Some("Error: upstream unavailable"));

        coordinator
            .submit(PendingToolCall::new("e2", "panicky", "{}"))
            .unwrap();
        let event = next_within(&mut results, 1000).await.unwrap();
        assert_eq!(event.output_call_id(), Some("e2"));
        assert!(event.output_text().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_results_can_only_be_taken_once() {
        let (_echo, coordinator, _results) = setup();
        assert!(coordinator.results().is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_after_coordinator_dropped_and_drained() {
        let (_echo, coordinator, mut results) = setup();
        coordinator
            .submit(PendingToolCall::new("last", "search", r#"{"delay_ms":20}"#))
            .unwrap();
        drop(coordinator);

        let event = next_within(&mut results, 1000).await.unwrap();
        assert_eq!(event.output_call_id(), Some("last"));
        assert!(results.next().await.is_none());
    }

    #[tokio::test]
    async fn test_submit_after_results_dropped_is_cancelled() {
        let (_echo, coordinator, results) = setup();
        drop(results);
        let err = coordinator
            .submit(PendingToolCall::new("late", "search", "{}"))
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Cancelled));
    }
}
