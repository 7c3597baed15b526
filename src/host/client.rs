//! Async client for one plugin subprocess.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};

use super::error::{PluginError, PluginResult};
use crate::protocol::{
    codes, methods, CloseArgs, DeleteArgs, ErrorInfo, HandshakeArgs, HandshakeReturn,
    InitializeArgs, InsertArgs, PluginConfig, QueryArgs, QueryConstraint, QueryReturn,
    RequestEnvelope, ResponseEnvelope, Row, TableSchema, UpdateArgs, PROTOCOL_VERSION,
};

/// How long connection setup (spawn + handshake) may take before the
/// executable is considered not to be a plugin. Table RPCs themselves are
/// never timed out by the framework.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Async client for a plugin subprocess.
///
/// The client spawns the plugin executable and communicates via NDJSON
/// (newline-delimited JSON) over stdin/stdout. Each request has a unique ID
/// for correlation with responses, enabling concurrent requests from many
/// logical connections over one pipe pair.
///
/// Prefer obtaining clients through [`super::ConnectionPool`], which
/// guarantees one subprocess per executable path.
pub struct PluginClient {
    /// Writer for sending requests to plugin stdin.
    stdin: Arc<Mutex<BufWriter<ChildStdin>>>,

    /// Map of pending request IDs to response channels.
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>>,

    /// Handle to the plugin child process, kept for explicit kill.
    child: Mutex<Child>,

    /// Handle to the background reader task.
    reader_task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient").finish_non_exhaustive()
    }
}

impl PluginClient {
    /// Spawn the executable and perform the handshake.
    ///
    /// The child is killed again if the handshake fails or does not complete
    /// within the setup timeout.
    pub async fn connect<P: AsRef<Path>>(executable: P) -> PluginResult<Self> {
        let mut child = Command::new(executable.as_ref())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(PluginError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            PluginError::SpawnFailed(std::io::Error::other("stdin not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PluginError::SpawnFailed(std::io::Error::other("stdout not captured"))
        })?;

        let stdin = Arc::new(Mutex::new(BufWriter::new(stdin)));
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let reader_task = Self::spawn_reader_task(stdout, pending.clone());

        let client = Self {
            stdin,
            pending,
            child: Mutex::new(child),
            reader_task,
        };

        client.handshake().await?;
        Ok(client)
    }

    /// Exchange protocol version and magic cookie with the plugin.
    async fn handshake(&self) -> PluginResult<()> {
        let exchange = self.request::<_, HandshakeReturn>(methods::HANDSHAKE, HandshakeArgs::current());

        let result = match tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::HandshakeFailed(format!(
                "no handshake response within {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            ))),
        };

        match result {
            Ok(reply) if reply.protocol_version == PROTOCOL_VERSION => Ok(()),
            Ok(reply) => {
                self.kill().await;
                Err(PluginError::HandshakeFailed(format!(
                    "plugin speaks protocol {}, expected {PROTOCOL_VERSION}",
                    reply.protocol_version
                )))
            }
            Err(err) => {
                self.kill().await;
                if err.is_disconnected() {
                    // The executable never spoke the protocol at all.
                    Err(PluginError::HandshakeFailed(
                        "plugin exited before completing the handshake".to_string(),
                    ))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Spawn the background task that reads responses from the plugin.
    fn spawn_reader_task(
        stdout: ChildStdout,
        pending: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        // EOF - plugin exited.
                        break;
                    }
                    Ok(_) => match serde_json::from_str::<ResponseEnvelope>(&line) {
                        Ok(response) => {
                            let mut pending = pending.lock().await;
                            if let Some(tx) = pending.remove(&response.id) {
                                let _ = tx.send(response);
                            }
                        }
                        Err(err) => {
                            // A plugin that prints to stdout corrupts the
                            // frame stream; skip the line and keep going.
                            tracing::warn!(error = %err, "failed to parse plugin response");
                        }
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to read from plugin");
                        break;
                    }
                }
            }

            // Plugin exited - fail all pending requests.
            let mut pending = pending.lock().await;
            for (id, tx) in pending.drain() {
                let response = ResponseEnvelope {
                    id,
                    success: false,
                    result: None,
                    error: Some(ErrorInfo {
                        code: codes::PLUGIN_EXITED.to_string(),
                        message: "plugin process exited unexpectedly".to_string(),
                    }),
                };
                let _ = tx.send(response);
            }
        })
    }

    /// Send a request and wait for its response.
    ///
    /// There is deliberately no timeout here: a connector may block
    /// indefinitely on its own remote calls, and that policy belongs to the
    /// connector. If the subprocess dies, the reader task fails the request
    /// with [`PluginError::PluginExited`] instead.
    pub async fn request<P, R>(&self, method: &str, params: P) -> PluginResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = uuid::Uuid::new_v4().to_string();

        let request = RequestEnvelope {
            id: id.clone(),
            method: method.to_string(),
            params: serde_json::to_value(params).map_err(PluginError::SerializeFailed)?,
        };

        // Register the response channel before writing, so a fast response
        // cannot race the registration.
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id.clone(), tx);
        }

        let write_result: PluginResult<()> = async {
            let mut stdin = self.stdin.lock().await;
            let line =
                serde_json::to_string(&request).map_err(PluginError::SerializeFailed)? + "\n";
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(PluginError::WriteFailed)?;
            stdin.flush().await.map_err(PluginError::WriteFailed)?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let response = rx.await?;

        if response.success {
            let result = response.result.unwrap_or(serde_json::Value::Null);
            serde_json::from_value(result).map_err(PluginError::DeserializeFailed)
        } else {
            let error = response.error.unwrap_or_else(|| ErrorInfo {
                code: "UNKNOWN".to_string(),
                message: "unknown error".to_string(),
            });
            Err(PluginError::classify(&error.code, &error.message))
        }
    }

    /// Whether the plugin process is still running.
    pub fn is_alive(&self) -> bool {
        // If the reader task has finished, the plugin has exited.
        !self.reader_task.is_finished()
    }

    /// Kill the plugin process. Idempotent.
    pub async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(err) = child.kill().await {
            tracing::debug!(error = %err, "plugin process already gone");
        }
    }
}

// The five table operations of the protocol.
impl PluginClient {
    /// Negotiate the schema of (connection, table). Must be called before
    /// any other operation on that pair.
    pub async fn initialize(
        &self,
        connection_id: i64,
        table_index: usize,
        config: PluginConfig,
    ) -> PluginResult<TableSchema> {
        self.request(
            methods::INITIALIZE,
            InitializeArgs {
                connection_id,
                table_index,
                config,
            },
        )
        .await
    }

    /// Fetch rows for a SELECT query. Returns the rows and whether the
    /// cursor is exhausted.
    pub async fn query(
        &self,
        connection_id: i64,
        table_index: usize,
        cursor_index: usize,
        constraint: QueryConstraint,
    ) -> PluginResult<(Vec<Row>, bool)> {
        let result: QueryReturn = self
            .request(
                methods::QUERY,
                QueryArgs {
                    connection_id,
                    table_index,
                    cursor_index,
                    constraint,
                },
            )
            .await?;
        Ok((result.rows, result.no_more_rows))
    }

    /// Insert rows into the table.
    pub async fn insert(
        &self,
        connection_id: i64,
        table_index: usize,
        rows: Vec<Row>,
    ) -> PluginResult<()> {
        let _: serde_json::Value = self
            .request(
                methods::INSERT,
                InsertArgs {
                    connection_id,
                    table_index,
                    rows,
                },
            )
            .await?;
        Ok(())
    }

    /// Update rows of the table.
    pub async fn update(
        &self,
        connection_id: i64,
        table_index: usize,
        rows: Vec<Row>,
    ) -> PluginResult<()> {
        let _: serde_json::Value = self
            .request(
                methods::UPDATE,
                UpdateArgs {
                    connection_id,
                    table_index,
                    rows,
                },
            )
            .await?;
        Ok(())
    }

    /// Delete rows from the table by primary key.
    pub async fn delete(
        &self,
        connection_id: i64,
        table_index: usize,
        primary_keys: Vec<serde_json::Value>,
    ) -> PluginResult<()> {
        let _: serde_json::Value = self
            .request(
                methods::DELETE,
                DeleteArgs {
                    connection_id,
                    table_index,
                    primary_keys,
                },
            )
            .await?;
        Ok(())
    }

    /// Tear down every table the connection opened.
    pub async fn close(&self, connection_id: i64) -> PluginResult<()> {
        let _: serde_json::Value = self
            .request(methods::CLOSE, CloseArgs { connection_id })
            .await?;
        Ok(())
    }
}
