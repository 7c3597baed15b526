//! Plugin entry point: registration, the NDJSON serve loop, and the parent
//! watchdog.
//!
//! A plugin binary builds a [`Plugin`], registers one table factory per
//! manifest index, and hands control to [`Plugin::serve`]. The serve loop
//! reads request envelopes from stdin, refuses table RPCs until the host has
//! completed the handshake, and handles each request on a blocking task so
//! that a connector stalled on its own remote call never blocks requests for
//! other tables. Responses are written to stdout as they complete,
//! correlated by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Stdout};
use tokio::sync::Mutex;

use super::dispatcher::{DispatchError, Dispatcher};
use super::table::{Table, TableFactoryArgs, TableResult};
use crate::protocol::{
    codes, methods, CloseArgs, DeleteArgs, HandshakeArgs, HandshakeReturn, InitializeArgs,
    InsertArgs, QueryArgs, QueryReturn, RequestEnvelope, ResponseEnvelope, TableSchema,
    UpdateArgs, PROTOCOL_VERSION,
};

/// How often the watchdog checks that the spawning process is still alive.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

// At most one dispatcher may be served per process lifetime: two serve loops
// would interleave frames on the same stdout.
static SERVED: AtomicBool = AtomicBool::new(false);

/// Errors raised while building or serving a plugin.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The table index is already registered.
    #[error("table index {0} is already registered")]
    DuplicateTable(usize),

    /// A dispatcher is already being served by this process.
    #[error("a plugin is already served; at most one dispatcher may run per process")]
    AlreadyServing,

    /// Reading from stdin failed.
    #[error("failed to read from host: {0}")]
    Io(#[from] std::io::Error),
}

/// A plugin under construction.
///
/// Registration is closed once serving begins: [`Plugin::serve`] consumes
/// the value, so no further [`Plugin::register_table`] call can compile
/// against a serving plugin.
#[derive(Default)]
pub struct Plugin {
    factories: HashMap<usize, super::table::TableFactory>,
}

impl Plugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a table index.
    ///
    /// The index must be unique and match the position of the table in the
    /// externally published manifest.
    pub fn register_table<F>(&mut self, table_index: usize, factory: F) -> Result<(), ServeError>
    where
        F: Fn(TableFactoryArgs) -> TableResult<(Box<dyn Table>, TableSchema)>
            + Send
            + Sync
            + 'static,
    {
        if self.factories.contains_key(&table_index) {
            return Err(ServeError::DuplicateTable(table_index));
        }
        self.factories.insert(table_index, Box::new(factory));
        Ok(())
    }

    /// Serve the plugin over stdin/stdout until the host disconnects.
    ///
    /// Returns `Ok(())` on a clean disconnect (stdin EOF or handshake
    /// refusal); the process should exit afterwards.
    pub async fn serve(self) -> Result<(), ServeError> {
        if SERVED.swap(true, Ordering::SeqCst) {
            return Err(ServeError::AlreadyServing);
        }

        spawn_watchdog();

        let dispatcher = Arc::new(Dispatcher::new(self.factories));
        let stdout = Arc::new(Mutex::new(BufWriter::new(tokio::io::stdout())));
        let handshaken = Arc::new(AtomicBool::new(false));

        let mut reader = BufReader::new(tokio::io::stdin());
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                // Host closed the pipe.
                tracing::debug!("stdin closed, shutting down");
                break;
            }
            if line.trim().is_empty() {
                continue;
            }

            let request: RequestEnvelope = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(err) => {
                    // Without an id there is nothing to correlate a
                    // response to; drop the frame.
                    tracing::warn!(error = %err, "discarding unparseable request");
                    continue;
                }
            };

            if request.method == methods::HANDSHAKE {
                if !handle_handshake(&request, &stdout, &handshaken).await {
                    // Refused: terminate rather than serve a peer speaking
                    // another protocol.
                    return Ok(());
                }
                continue;
            }

            if !handshaken.load(Ordering::SeqCst) {
                let response = ResponseEnvelope::failure(
                    request.id,
                    codes::HANDSHAKE_REQUIRED,
                    "table RPCs are not accepted before a successful handshake",
                );
                write_response(&stdout, &response).await;
                continue;
            }

            let dispatcher = dispatcher.clone();
            let stdout = stdout.clone();
            tokio::spawn(async move {
                let id = request.id.clone();
                let response =
                    match tokio::task::spawn_blocking(move || handle_request(&dispatcher, request))
                        .await
                    {
                        Ok(response) => response,
                        Err(join_err) => ResponseEnvelope::failure(
                            id,
                            codes::PLUGIN_PANIC,
                            format!("request handler aborted: {join_err}"),
                        ),
                    };
                write_response(&stdout, &response).await;
            });
        }

        Ok(())
    }
}

/// Validate the handshake and answer it. Returns false if the connection
/// must be refused.
async fn handle_handshake(
    request: &RequestEnvelope,
    stdout: &Arc<Mutex<BufWriter<Stdout>>>,
    handshaken: &Arc<AtomicBool>,
) -> bool {
    let peer: HandshakeArgs = match serde_json::from_value(request.params.clone()) {
        Ok(args) => args,
        Err(err) => {
            let response = ResponseEnvelope::failure(
                request.id.clone(),
                codes::INVALID_REQUEST,
                format!("malformed handshake: {err}"),
            );
            write_response(stdout, &response).await;
            return false;
        }
    };

    if !HandshakeArgs::current().matches(&peer) {
        tracing::warn!(
            peer_version = peer.protocol_version,
            "refusing connection: handshake mismatch"
        );
        let response = ResponseEnvelope::failure(
            request.id.clone(),
            codes::HANDSHAKE_MISMATCH,
            format!(
                "expected protocol {PROTOCOL_VERSION} with cookie {}={}",
                crate::protocol::MAGIC_COOKIE_KEY,
                crate::protocol::MAGIC_COOKIE_VALUE
            ),
        );
        write_response(stdout, &response).await;
        return false;
    }

    handshaken.store(true, Ordering::SeqCst);
    let result = HandshakeReturn {
        protocol_version: PROTOCOL_VERSION,
    };
    let response = match serde_json::to_value(result) {
        Ok(value) => ResponseEnvelope::success(request.id.clone(), value),
        Err(err) => ResponseEnvelope::failure(
            request.id.clone(),
            codes::INVALID_REQUEST,
            err.to_string(),
        ),
    };
    write_response(stdout, &response).await;
    true
}

/// Decode the request, dispatch it, and build the response envelope.
fn handle_request(dispatcher: &Dispatcher, request: RequestEnvelope) -> ResponseEnvelope {
    let id = request.id;

    macro_rules! params {
        ($ty:ty) => {
            match serde_json::from_value::<$ty>(request.params) {
                Ok(args) => args,
                Err(err) => {
                    return ResponseEnvelope::failure(
                        id,
                        codes::INVALID_REQUEST,
                        format!("invalid parameters for {}: {err}", request.method),
                    )
                }
            }
        };
    }

    fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, DispatchError> {
        serde_json::to_value(value).map_err(|e| DispatchError::Table(e.to_string().into()))
    }

    let result = match request.method.as_str() {
        methods::INITIALIZE => {
            let args = params!(InitializeArgs);
            dispatcher
                .initialize(args.connection_id, args.table_index, args.config)
                .and_then(to_value)
        }
        methods::QUERY => {
            let args = params!(QueryArgs);
            dispatcher
                .query(
                    args.connection_id,
                    args.table_index,
                    args.cursor_index,
                    args.constraint,
                )
                .and_then(|(rows, no_more_rows)| to_value(QueryReturn { rows, no_more_rows }))
        }
        methods::INSERT => {
            let args = params!(InsertArgs);
            dispatcher
                .insert(args.connection_id, args.table_index, args.rows)
                .map(|()| serde_json::Value::Null)
        }
        methods::UPDATE => {
            let args = params!(UpdateArgs);
            dispatcher
                .update(args.connection_id, args.table_index, args.rows)
                .map(|()| serde_json::Value::Null)
        }
        methods::DELETE => {
            let args = params!(DeleteArgs);
            dispatcher
                .delete(args.connection_id, args.table_index, args.primary_keys)
                .map(|()| serde_json::Value::Null)
        }
        methods::CLOSE => {
            let args = params!(CloseArgs);
            dispatcher
                .close(args.connection_id)
                .map(|()| serde_json::Value::Null)
        }
        other => {
            return ResponseEnvelope::failure(
                id,
                codes::METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            )
        }
    };

    match result {
        Ok(value) => ResponseEnvelope::success(id, value),
        Err(err) => {
            let info = err.to_error_info();
            ResponseEnvelope::failure(id, &info.code, info.message)
        }
    }
}

/// Serialize and write one response line.
async fn write_response(stdout: &Arc<Mutex<BufWriter<Stdout>>>, response: &ResponseEnvelope) {
    let line = match serde_json::to_string(response) {
        Ok(line) => line + "\n",
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize response");
            return;
        }
    };

    let mut stdout = stdout.lock().await;
    if let Err(err) = stdout.write_all(line.as_bytes()).await {
        tracing::error!(error = %err, "failed to write response");
        return;
    }
    if let Err(err) = stdout.flush().await {
        tracing::error!(error = %err, "failed to flush response");
    }
}

/// Exit the process when the spawning process goes away.
///
/// The parent pid is captured once at serve time; any later change means the
/// original parent died and this process was reparented (to init or a
/// subreaper). This prevents orphaned plugin subprocesses after a host
/// crash even when stdin is held open by an intermediary.
#[cfg(unix)]
fn spawn_watchdog() {
    let initial = std::os::unix::process::parent_id();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        loop {
            interval.tick().await;
            let current = std::os::unix::process::parent_id();
            if current != initial || current == 1 {
                tracing::debug!("host process is gone, exiting");
                std::process::exit(0);
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_watchdog() {
    // Non-unix hosts rely on the stdin-EOF path in the serve loop.
}
