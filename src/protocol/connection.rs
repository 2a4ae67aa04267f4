//! Bidirectional stream handling for C4 (spec.md §4.4). One task per
//! connected worker drains its inbound stream and dispatches to the
//! Worker Registry (C3), the Execution State Machine (C7, except log
//! chunks which bypass it), and the Event & Log Fanout (C9); a second,
//! implicit "task" is just the outbound `mpsc` channel this worker's
//! queue feeds, preserving enqueue order (spec.md §5).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use futures::Stream;
use scc::HashMap as ConcurrentHashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::execution::ExecutionDirectory;
use crate::fanout::Fanout;
use crate::model::{
    EventType, ExecutionId, ExecutionStatus, ExecutionUpdate, EventUpdate, LogStream, LogUpdate,
    PoolId, StatusChangeUpdate, WorkerCapabilities, WorkerId, WorkerStatus,
};
use crate::worker_registry::WorkerRegistry;

use super::proto;

/// Tracks each connected worker's outbound channel so C8/C6 can push
/// `ExecutionAssignment`/`CancelSignal` without holding a reference to
/// the live gRPC stream itself.
#[derive(Default)]
pub struct ConnectionRegistry {
    outbound: ConcurrentHashMap<WorkerId, mpsc::UnboundedSender<proto::OrchestratorMessage>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            outbound: ConcurrentHashMap::new(),
        }
    }

    fn register(&self, worker_id: WorkerId, sender: mpsc::UnboundedSender<proto::OrchestratorMessage>) {
        let _ = self.outbound.insert(worker_id, sender);
    }

    async fn remove(&self, worker_id: &WorkerId) {
        self.outbound.remove_async(worker_id).await;
    }

    /// Enqueues a message on the worker's outbound channel; enqueue
    /// order is preserved because the channel is a single FIFO queue
    /// per worker (spec.md §4.4).
    pub async fn send(&self, worker_id: &WorkerId, message: proto::OrchestratorMessage) -> bool {
        let Some(sender) = self.outbound.read_async(worker_id, |_, tx| tx.clone()).await else {
            return false;
        };
        sender.send(message).is_ok()
    }
}

pub struct WorkerProtocolHandler {
    worker_registry: Arc<WorkerRegistry>,
    executions: Arc<ExecutionDirectory>,
    fanout: Arc<Fanout>,
    connections: Arc<ConnectionRegistry>,
}

impl WorkerProtocolHandler {
    pub fn new(
        worker_registry: Arc<WorkerRegistry>,
        executions: Arc<ExecutionDirectory>,
        fanout: Arc<Fanout>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            worker_registry,
            executions,
            fanout,
            connections,
        }
    }
}

fn event_type_from_wire(value: i32) -> EventType {
    use proto::EventType as WireEventType;
    match WireEventType::try_from(value).unwrap_or(WireEventType::Unspecified) {
        WireEventType::Unspecified | WireEventType::StatusUpdate => EventType::StatusUpdate,
        WireEventType::StageStarted => EventType::StageStarted,
        WireEventType::StageCompleted => EventType::StageCompleted,
        WireEventType::StepStarted => EventType::StepStarted,
        WireEventType::StepCompleted => EventType::StepCompleted,
        WireEventType::ExecutionStarted => EventType::ExecutionStarted,
        WireEventType::ExecutionCompleted => EventType::ExecutionCompleted,
        WireEventType::ExecutionFailed => EventType::ExecutionFailed,
        WireEventType::ExecutionCancelled => EventType::ExecutionCancelled,
    }
}

fn log_stream_from_wire(value: i32) -> LogStream {
    use proto::LogStream as WireLogStream;
    match WireLogStream::try_from(value).unwrap_or(WireLogStream::Unspecified) {
        WireLogStream::Unspecified | WireLogStream::Stdout => LogStream::Stdout,
        WireLogStream::Stderr => LogStream::Stderr,
        WireLogStream::System => LogStream::System,
    }
}

fn millis_to_timestamp(ts_millis: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(ts_millis).single().unwrap_or_else(Utc::now)
}

/// The `ExecutionStatus` transition an inbound `StatusUpdate`'s event
/// type implies, if any - most event types (stage/step progress) are
/// fanned out to C9 without driving the state machine.
fn implied_transition(event_type: EventType) -> Option<ExecutionStatus> {
    match event_type {
        EventType::ExecutionStarted => Some(ExecutionStatus::Started),
        EventType::ExecutionCompleted => Some(ExecutionStatus::Completed),
        EventType::ExecutionFailed => Some(ExecutionStatus::Failed),
        EventType::ExecutionCancelled => Some(ExecutionStatus::Cancelled),
        _ => None,
    }
}

impl WorkerProtocolHandler {
    async fn dispatch_status_update(&self, update: proto::StatusUpdate) {
        let Ok(execution_id) = ExecutionId::new(update.execution_id.clone()) else {
            warn!("status update with empty execution id dropped");
            return;
        };
        let event_type = event_type_from_wire(update.event_type);
        let timestamp = millis_to_timestamp(update.ts_millis);

        if let Some(to) = implied_transition(event_type) {
            if let Some(machine) = self.executions.get(&execution_id).await {
                if let Err(err) = machine.transition(to, None).await {
                    warn!(%execution_id, %err, "dropping status update that implies an illegal transition");
                }
            }
        }

        self.fanout
            .publish(ExecutionUpdate::Event(EventUpdate {
                execution_id,
                event_type,
                message: update.message,
                timestamp,
            }))
            .await;
    }

    async fn dispatch_log_chunk(&self, chunk: proto::LogChunk) {
        let Ok(execution_id) = ExecutionId::new(chunk.execution_id.clone()) else {
            warn!("log chunk with empty execution id dropped");
            return;
        };
        self.fanout
            .publish(ExecutionUpdate::Log(LogUpdate {
                execution_id,
                stream: log_stream_from_wire(chunk.stream),
                content: chunk.content,
                timestamp: millis_to_timestamp(chunk.ts_millis),
            }))
            .await;
    }

    /// Returns `true` if the result was applied (i.e. the execution was
    /// in a state where a terminal result makes sense), so the caller
    /// can suppress a redundant `WORKER_DISCONNECTED` on stream close.
    async fn dispatch_execution_result(
        &self,
        worker_id: &WorkerId,
        result: proto::ExecutionResult,
    ) -> bool {
        let Ok(execution_id) = ExecutionId::new(result.execution_id.clone()) else {
            warn!("execution result with empty execution id dropped");
            return false;
        };
        let Some(machine) = self.executions.get(&execution_id).await else {
            warn!(%execution_id, "execution result for unknown execution dropped");
            return false;
        };

        let to = if result.success {
            ExecutionStatus::Completed
        } else if machine.is_cancel_requested() {
            // A `CancelSignal` already went out for this execution; the
            // worker's negative result is the cancellation taking
            // effect, not an ordinary failure (spec.md §8 scenario S6).
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Failed
        };
        let details = result.details.clone();
        let exit_code = result.exit_code;
        let applied = machine
            .transition_with(to, None, |execution| {
                execution.exit_code = Some(exit_code);
                if !result.success {
                    execution.error_message = Some(details);
                }
            })
            .await
            .is_ok();

        if applied {
            self.fanout
                .publish(ExecutionUpdate::Status(StatusChangeUpdate {
                    execution_id,
                    status: to,
                    timestamp: Utc::now(),
                }))
                .await;
            if let Err(err) = self.worker_registry.release(worker_id).await {
                warn!(%worker_id, %err, "failed to release worker after terminal execution result");
            }
        }
        applied
    }

    async fn handle_disconnect(&self, worker_id: &WorkerId, terminal_result_received: bool) {
        let worker = self.worker_registry.get(worker_id).await.ok();
        if let Err(err) = self.worker_registry.mark_offline(worker_id).await {
            warn!(%worker_id, %err, "failed to mark disconnected worker offline");
        }

        if terminal_result_received {
            return;
        }

        if let Some(execution_id) = worker.and_then(|w| w.active_execution_id) {
            if let Some(machine) = self.executions.get(&execution_id).await {
                let result = machine
                    .transition_with(ExecutionStatus::Failed, None, |execution| {
                        execution.error_message = Some("WORKER_DISCONNECTED".to_string());
                    })
                    .await;
                if result.is_ok() {
                    self.fanout
                        .publish(ExecutionUpdate::Status(StatusChangeUpdate {
                            execution_id,
                            status: ExecutionStatus::Failed,
                            timestamp: Utc::now(),
                        }))
                        .await;
                }
            }
        }
    }
}

pub type ConnectStream = Pin<Box<dyn Stream<Item = Result<proto::OrchestratorMessage, Status>> + Send + 'static>>;

#[async_trait::async_trait]
impl proto::worker_protocol_server::WorkerProtocol for WorkerProtocolHandler {
    type ConnectStream = ConnectStream;

    async fn connect(
        &self,
        request: Request<Streaming<proto::WorkerMessage>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await
            .map_err(|status| Status::invalid_argument(format!("failed to read first message: {status}")))?
            .ok_or_else(|| Status::invalid_argument("stream closed before registration"))?;

        let register = match first.payload {
            Some(proto::worker_message::Payload::Register(register)) => register,
            _ => {
                return Err(Status::failed_precondition(
                    "PROTOCOL_VIOLATION: first message must be RegisterRequest",
                ));
            }
        };

        let worker_id = WorkerId::new(register.worker_id.clone())
            .map_err(|_| Status::invalid_argument("worker_id must not be empty"))?;
        let pool_id = PoolId::new(register.pool_id.clone())
            .map_err(|_| Status::invalid_argument("pool_id must not be empty"))?;
        let capabilities = register.capabilities.unwrap_or_default();
        let worker_capabilities = WorkerCapabilities {
            cpu_millicores: capabilities.cpu_millicores,
            memory_bytes: capabilities.memory_bytes,
            storage_bytes: capabilities.storage_bytes,
            labels: capabilities.labels.into_iter().collect::<HashMap<_, _>>(),
            tools: capabilities.tools,
        };

        let session_token = uuid::Uuid::new_v4().to_string();
        self.worker_registry
            .register(worker_id.clone(), pool_id, worker_capabilities, session_token)
            .await;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.connections.register(worker_id.clone(), outbound_tx);

        let worker_registry = self.worker_registry.clone();
        let executions = self.executions.clone();
        let fanout = self.fanout.clone();
        let connections = self.connections.clone();
        let handler = WorkerProtocolHandler {
            worker_registry: worker_registry.clone(),
            executions,
            fanout,
            connections: connections.clone(),
        };

        let worker_id_for_task = worker_id.clone();
        tokio::spawn(async move {
            let mut terminal_result_received = false;
            loop {
                match inbound.message().await {
                    Ok(Some(message)) => match message.payload {
                        Some(proto::worker_message::Payload::Register(_)) => {
                            warn!(worker_id = %worker_id_for_task, "duplicate Register message ignored");
                        }
                        Some(proto::worker_message::Payload::StatusUpdate(update)) => {
                            handler.dispatch_status_update(update).await;
                        }
                        Some(proto::worker_message::Payload::LogChunk(chunk)) => {
                            handler.dispatch_log_chunk(chunk).await;
                        }
                        Some(proto::worker_message::Payload::ExecutionResult(result)) => {
                            terminal_result_received = handler
                                .dispatch_execution_result(&worker_id_for_task, result)
                                .await
                                || terminal_result_received;
                        }
                        Some(proto::worker_message::Payload::Heartbeat(_)) => {
                            if let Err(err) = worker_registry.heartbeat(&worker_id_for_task).await {
                                warn!(worker_id = %worker_id_for_task, %err, "heartbeat for unknown worker");
                            }
                        }
                        None => {}
                    },
                    Ok(None) => {
                        info!(worker_id = %worker_id_for_task, "worker stream closed");
                        break;
                    }
                    Err(status) => {
                        warn!(worker_id = %worker_id_for_task, %status, "worker stream error");
                        break;
                    }
                }
            }

            handler.handle_disconnect(&worker_id_for_task, terminal_result_received).await;
            connections.remove(&worker_id_for_task).await;
        });

        let outbound_stream = UnboundedReceiverStream::new(outbound_rx).map(Ok);
        Ok(Response::new(Box::pin(outbound_stream)))
    }
}

use tokio_stream::StreamExt as _;
