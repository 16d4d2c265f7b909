//! Scripted spalloc server for integration tests.
//!
//! The server accepts one connection at a time on an ephemeral port and
//! answers each command through a handler closure. Tests can push
//! notifications or raw lines into the live connection and drop it to
//! simulate the server going away.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use spalloc_client::ProtocolClient;

/// Test timeout to prevent hanging tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How the mock answers one command.
pub enum Reply {
    Return(Value),
    Exception(String),
    /// Answer after a delay, letting later commands overtake this one
    Delayed(Duration, Value),
    /// Never answer
    Silent,
}

type Handler = Arc<dyn Fn(&str, &[Value], &Map<String, Value>) -> Reply + Send + Sync>;

enum Control {
    Send(String),
    Disconnect,
}

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

pub struct MockServer {
    port: u16,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<Mutex<usize>>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Start a server answering every command with `handler`.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Value], &Map<String, Value>) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let port = listener.local_addr().expect("no local addr").port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let (control, control_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(handler),
            Arc::clone(&received),
            Arc::clone(&connections),
            control_rx,
        ));

        Self {
            port,
            received,
            connections,
            control,
            task,
        }
    }

    /// Server answering `version` with a compatible version and every
    /// other command with `null`.
    pub async fn compatible() -> Self {
        Self::start(|command, _, _| match command {
            "version" => Reply::Return(json!("1.0.0")),
            _ => Reply::Return(Value::Null),
        })
        .await
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A client for this server with the test timeout as default.
    pub fn client(&self) -> ProtocolClient {
        ProtocolClient::with_timeout("127.0.0.1", self.port, Some(TEST_TIMEOUT))
    }

    /// Push a notification into the live connection.
    pub fn notify(&self, notification: Value) {
        self.send_raw(notification.to_string());
    }

    /// Push a job state change notification.
    pub fn job_state_changed(&self, job_id: u64, state: u8, reason: Option<&str>) {
        self.notify(json!({
            "kind": "job_state_changed",
            "job_id": job_id,
            "payload": {"state": state, "reason": reason}
        }));
    }

    /// Push a raw line (a newline is appended).
    pub fn send_raw(&self, line: impl Into<String>) {
        let _ = self.control.send(Control::Send(line.into()));
    }

    /// Drop the live connection.
    pub fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    /// Stop accepting connections and drop the live one.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    /// Every command received so far, as sent.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    /// Names of the commands received so far.
    pub fn commands(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|m| m["command"].as_str().map(str::to_string))
            .collect()
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        *self.connections.lock()
    }

    /// Wait until `count` commands named `command` have arrived.
    pub async fn wait_for_command(&self, command: &str, count: usize) -> Vec<Value> {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let matching: Vec<Value> = self
                    .received()
                    .into_iter()
                    .filter(|m| m["command"] == command)
                    .collect();
                if matching.len() >= count {
                    return matching;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for '{}'", command))
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Handler,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<Mutex<usize>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        *connections.lock() += 1;
        serve(stream, &handler, &received, &mut control).await;
    }
}

async fn write_line(writer: &Writer, line: &str) -> bool {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await.is_ok() && writer.write_all(b"\n").await.is_ok()
}

async fn serve(
    stream: TcpStream,
    handler: &Handler,
    received: &Mutex<Vec<Value>>,
    control: &mut mpsc::UnboundedReceiver<Control>,
) {
    let (read_half, write_half) = stream.into_split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    return;
                };
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                received.lock().push(message.clone());

                let command = message["command"].as_str().unwrap_or_default().to_string();
                let args = message["args"].as_array().cloned().unwrap_or_default();
                let kwargs = message["kwargs"].as_object().cloned().unwrap_or_default();
                let id = message["correlation_id"].clone();

                match handler(&command, &args, &kwargs) {
                    Reply::Return(value) => {
                        let response = json!({"correlation_id": id, "return": value});
                        if !write_line(&writer, &response.to_string()).await {
                            return;
                        }
                    }
                    Reply::Exception(text) => {
                        let response = json!({"correlation_id": id, "exception": text});
                        if !write_line(&writer, &response.to_string()).await {
                            return;
                        }
                    }
                    Reply::Delayed(delay, value) => {
                        let writer = Arc::clone(&writer);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let response = json!({"correlation_id": id, "return": value});
                            write_line(&writer, &response.to_string()).await;
                        });
                    }
                    Reply::Silent => {}
                }
            }
            control = control.recv() => match control {
                Some(Control::Send(line)) => {
                    if !write_line(&writer, &line).await {
                        return;
                    }
                }
                Some(Control::Disconnect) | None => {
                    let _ = writer.lock().await.shutdown().await;
                    return;
                }
            }
        }
    }
}
