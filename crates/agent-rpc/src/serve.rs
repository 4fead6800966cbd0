//! Integration-side protocol server
//!
//! An integration binary hands its [`Integration`] to [`serve_stdio`] from
//! `main`. The server announces the integration's capabilities, executes host
//! calls one at a time, and turns agent callbacks made during a call into
//! protocol messages. A panic inside a call is caught and reported to the host
//! as a panic reply; the server keeps running.

use crate::wire::{
    read_message, write_message, Call, CallOutcome, CallValue, Callback, CallbackOutcome,
    HostMessage, PluginMessage, PROTOCOL_VERSION,
};
use crate::{Agent, Integration, LogLevel, Record, Result, RpcError, StreamHandle, StreamId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>;
type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<CallbackOutcome>>>>;

/// Serve `integration` over the process's stdin and stdout
pub async fn serve_stdio<I: Integration>(integration: I) -> Result<()> {
    serve(integration, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve `integration` over an arbitrary byte transport
///
/// Returns when the host sends a shutdown message or closes the transport.
pub async fn serve<I, R, W>(mut integration: I, reader: R, writer: W) -> Result<()>
where
    I: Integration,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
    let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
    let closed = Arc::new(AtomicBool::new(false));

    {
        let mut w = writer.lock().await;
        write_message(
            &mut *w,
            &PluginMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                capabilities: integration.capabilities(),
            },
        )
        .await?;
    }

    let (call_tx, mut call_rx) = mpsc::channel::<(u64, Call)>(8);
    let router = tokio::spawn(route_host_messages(
        reader,
        call_tx,
        pending.clone(),
        closed.clone(),
    ));

    let agent = Arc::new(RemoteAgent {
        writer: writer.clone(),
        pending,
        closed,
        next_id: AtomicU64::new(1),
    });

    while let Some((id, call)) = call_rx.recv().await {
        debug!(id, call = call.name(), "Executing host call");
        let outcome = execute(&mut integration, call, &agent).await;
        let mut w = writer.lock().await;
        write_message(&mut *w, &PluginMessage::Reply { id, outcome }).await?;
    }

    match router.await {
        Ok(result) => result,
        Err(e) => Err(RpcError::Protocol(format!("message router failed: {}", e))),
    }
}

/// Read host messages until shutdown or EOF. Calls go to the executor,
/// callback replies to whoever is waiting for them.
async fn route_host_messages<R>(
    reader: R,
    calls: mpsc::Sender<(u64, Call)>,
    pending: Pending,
    closed: Arc<AtomicBool>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let result = loop {
        match read_message::<_, HostMessage>(&mut reader, &mut line).await {
            Ok(Some(HostMessage::Call { id, call })) => {
                if calls.send((id, call)).await.is_err() {
                    break Ok(());
                }
            }
            Ok(Some(HostMessage::CallbackReply { id, outcome })) => {
                let waiter = lock_pending(&pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => warn!(id, "Callback reply for unknown request"),
                }
            }
            Ok(Some(HostMessage::Shutdown)) | Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    closed.store(true, Ordering::SeqCst);
    lock_pending(&pending).clear();
    result
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<CallbackOutcome>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run one call against `integration`, with `agent` handed over on init.
/// Panics are not caught here.
pub async fn dispatch<I: Integration + ?Sized>(
    integration: &mut I,
    call: Call,
    agent: Arc<dyn Agent>,
) -> Result<CallValue> {
    match call {
        Call::Init => integration.init(agent).await.map(|_| CallValue::Init),
        Call::Export(config) => integration.export(config).await.map(CallValue::Export),
        Call::ValidateConfig(config) => integration
            .validate_config(config)
            .await
            .map(CallValue::ValidateConfig),
        Call::OnboardExport {
            object_type,
            config,
        } => integration
            .onboard_export(object_type, config)
            .await
            .map(CallValue::OnboardExport),
    }
}

async fn execute<I: Integration>(
    integration: &mut I,
    call: Call,
    agent: &Arc<RemoteAgent>,
) -> CallOutcome {
    let agent: Arc<dyn Agent> = agent.clone();
    match AssertUnwindSafe(dispatch(integration, call, agent))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => CallOutcome::Ok(value),
        Ok(Err(e)) => CallOutcome::Error(e.to_string()),
        Err(payload) => CallOutcome::Panic(panic_message(payload.as_ref())),
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// [`Agent`] proxy that forwards callbacks to the host
struct RemoteAgent {
    writer: SharedWriter,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl RemoteAgent {
    async fn request(&self, callback: Callback) -> Result<CallbackOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        if self.closed.load(Ordering::SeqCst) {
            lock_pending(&self.pending).remove(&id);
            return Err(host_gone());
        }

        let sent = {
            let mut w = self.writer.lock().await;
            write_message(&mut *w, &PluginMessage::Callback { id, callback }).await
        };
        if let Err(e) = sent {
            lock_pending(&self.pending).remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| host_gone())
    }
}

fn host_gone() -> RpcError {
    RpcError::Protocol("host closed the connection".to_string())
}

fn unexpected(outcome: CallbackOutcome) -> RpcError {
    RpcError::Protocol(format!("unexpected callback reply: {:?}", outcome))
}

#[async_trait]
impl Agent for RemoteAgent {
    async fn export_started(&self, object_type: &str) -> Result<StreamHandle> {
        let callback = Callback::ExportStarted {
            object_type: object_type.to_string(),
        };
        match self.request(callback).await? {
            CallbackOutcome::Stream(handle) => Ok(handle),
            CallbackOutcome::Error(e) => Err(RpcError::Integration(e)),
            other => Err(unexpected(other)),
        }
    }

    async fn send_exported(&self, stream: StreamId, records: Vec<Record>) -> Result<()> {
        match self
            .request(Callback::SendExported { stream, records })
            .await?
        {
            CallbackOutcome::Ack => Ok(()),
            CallbackOutcome::Error(e) => Err(RpcError::DeliveryFailed(e)),
            other => Err(unexpected(other)),
        }
    }

    async fn export_done(
        &self,
        stream: StreamId,
        last_processed: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match self
            .request(Callback::ExportDone {
                stream,
                last_processed,
            })
            .await?
        {
            CallbackOutcome::Ack => Ok(()),
            CallbackOutcome::Error(e) => Err(RpcError::Integration(e)),
            other => Err(unexpected(other)),
        }
    }

    async fn log(&self, level: LogLevel, message: String) {
        let mut w = self.writer.lock().await;
        if let Err(e) = write_message(&mut *w, &PluginMessage::Log { level, message }).await {
            warn!(error = %e, "Failed to forward log line to host");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Capabilities, ExportConfig, ExportResult, IncrementalSender, IntegrationConfig,
        IntegrationId, OnboardExportResult, OnboardExportType, ValidationResult,
    };
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    #[derive(Default)]
    struct Fake {
        agent: Option<Arc<dyn Agent>>,
    }

    #[async_trait]
    impl Integration for Fake {
        fn capabilities(&self) -> Capabilities {
            Capabilities::all()
        }

        async fn init(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
            self.agent = Some(agent);
            Ok(())
        }

        async fn export(&mut self, _config: ExportConfig) -> Result<ExportResult> {
            let agent = self
                .agent
                .clone()
                .ok_or_else(|| RpcError::integration("not initialized"))?;
            let sender = IncrementalSender::new(agent, "work.issue").await?;
            let mut r = Record::new();
            r.insert("ref_id".to_string(), serde_json::json!("1"));
            sender.send_one(r).await?;
            let sent = sender.done().await?;
            let mut result = ExportResult::default();
            result.records_sent.insert("work.issue".to_string(), sent);
            Ok(result)
        }

        async fn validate_config(&mut self, _config: ExportConfig) -> Result<ValidationResult> {
            panic!("validation exploded");
        }

        async fn onboard_export(
            &mut self,
            _object_type: OnboardExportType,
            _config: ExportConfig,
        ) -> Result<OnboardExportResult> {
            Err(RpcError::integration("onboarding unavailable"))
        }
    }

    struct Host {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        line: String,
    }

    impl Host {
        async fn recv(&mut self) -> PluginMessage {
            read_message(&mut self.reader, &mut self.line)
                .await
                .unwrap()
                .expect("plugin closed the stream")
        }

        async fn send(&mut self, msg: HostMessage) {
            write_message(&mut self.writer, &msg).await.unwrap();
        }
    }

    fn start() -> (Host, tokio::task::JoinHandle<Result<()>>) {
        let (host_side, plugin_side) = duplex(64 * 1024);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
        let server = tokio::spawn(serve(Fake::default(), plugin_read, plugin_write));
        let (host_read, host_write) = tokio::io::split(host_side);
        let host = Host {
            reader: BufReader::new(host_read),
            writer: host_write,
            line: String::new(),
        };
        (host, server)
    }

    fn config() -> ExportConfig {
        ExportConfig {
            integration: IntegrationConfig::new(IntegrationId::untyped("fake")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_hello_then_shutdown() {
        let (mut host, server) = start();
        match host.recv().await {
            PluginMessage::Hello {
                protocol_version,
                capabilities,
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(capabilities, Capabilities::all());
            }
            other => panic!("expected hello, got {:?}", other),
        }
        host.send(HostMessage::Shutdown).await;
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_export_round_trips_callbacks() {
        let (mut host, server) = start();
        host.recv().await;

        host.send(HostMessage::Call {
            id: 1,
            call: Call::Init,
        })
        .await;
        assert!(matches!(
            host.recv().await,
            PluginMessage::Reply {
                id: 1,
                outcome: CallOutcome::Ok(CallValue::Init)
            }
        ));

        host.send(HostMessage::Call {
            id: 2,
            call: Call::Export(config()),
        })
        .await;

        let mut batches = 0;
        loop {
            match host.recv().await {
                PluginMessage::Callback { id, callback } => {
                    let outcome = match callback {
                        Callback::ExportStarted { object_type } => {
                            assert_eq!(object_type, "work.issue");
                            CallbackOutcome::Stream(StreamHandle {
                                stream_id: StreamId(0),
                                last_processed: None,
                            })
                        }
                        Callback::SendExported { records, .. } => {
                            batches += records.len();
                            CallbackOutcome::Ack
                        }
                        Callback::ExportDone { last_processed, .. } => {
                            assert!(last_processed.is_some());
                            CallbackOutcome::Ack
                        }
                    };
                    host.send(HostMessage::CallbackReply { id, outcome }).await;
                }
                PluginMessage::Reply { id, outcome } => {
                    assert_eq!(id, 2);
                    match outcome {
                        CallOutcome::Ok(CallValue::Export(result)) => {
                            assert_eq!(result.records_sent.get("work.issue"), Some(&1));
                        }
                        other => panic!("expected export result, got {:?}", other),
                    }
                    break;
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
        assert_eq!(batches, 1);

        host.writer.shutdown().await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_panic_becomes_reply() {
        let (mut host, server) = start();
        host.recv().await;

        host.send(HostMessage::Call {
            id: 5,
            call: Call::ValidateConfig(config()),
        })
        .await;
        match host.recv().await {
            PluginMessage::Reply {
                id: 5,
                outcome: CallOutcome::Panic(msg),
            } => assert!(msg.contains("validation exploded")),
            other => panic!("expected panic reply, got {:?}", other),
        }

        // Still serving after the panic
        host.send(HostMessage::Call {
            id: 6,
            call: Call::OnboardExport {
                object_type: OnboardExportType::Users,
                config: config(),
            },
        })
        .await;
        match host.recv().await {
            PluginMessage::Reply {
                id: 6,
                outcome: CallOutcome::Error(msg),
            } => assert_eq!(msg, "onboarding unavailable"),
            other => panic!("expected error reply, got {:?}", other),
        }

        host.send(HostMessage::Shutdown).await;
        server.await.unwrap().unwrap();
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
