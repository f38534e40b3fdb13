use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Parser;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
mod config;
mod driver;
mod payloads;

use config::WorkerConfig;
use driver::AnyConnector;
use payloads::QueryPayload;
use qbind_db::{QueryError, run_query};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WireCodec {
    Json,
    Msgpack,
}

const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Deserialize)]
struct RequestEnvelope {
    request_id: u64,
    entry: String,
    codec: String,
    payload: Option<ByteBuf>,
    payload_b64: Option<String>,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    request_id: u64,
    status: String,
    codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<ByteBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<HashMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<String>,
}

#[derive(Serialize)]
struct ResponseEnvelopeJson {
    request_id: u64,
    status: String,
    codec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<HashMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<String>,
}

struct DecodedRequest {
    envelope: RequestEnvelope,
    wire: WireCodec,
    queued_at: Instant,
}

#[derive(Debug)]
struct ExecError {
    status: &'static str,
    message: String,
}

impl ExecError {
    fn invalid_input(message: impl Into<String>) -> Self {
        ExecError {
            status: "InvalidInput",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        ExecError {
            status: "InternalError",
            message: message.into(),
        }
    }
}

impl From<QueryError> for ExecError {
    fn from(err: QueryError) -> Self {
        let status = match &err {
            QueryError::ParameterBinding { .. } => "InvalidInput",
            QueryError::Connection(_) => "ConnectError",
            QueryError::QueryExecution(_) => "QueryError",
            QueryError::ConnectionRelease(_) => "InternalError",
        };
        ExecError {
            status,
            message: err.to_string(),
        }
    }
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = payload.len() as u32;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn decode_request(bytes: &[u8]) -> Result<DecodedRequest, String> {
    if let Ok(env) = rmp_serde::from_slice::<RequestEnvelope>(bytes) {
        return Ok(DecodedRequest {
            envelope: env,
            wire: WireCodec::Msgpack,
            queued_at: Instant::now(),
        });
    }
    let env = serde_json::from_slice::<RequestEnvelope>(bytes)
        .map_err(|err| format!("Invalid request: {err}"))?;
    Ok(DecodedRequest {
        envelope: env,
        wire: WireCodec::Json,
        queued_at: Instant::now(),
    })
}

fn extract_payload(envelope: &RequestEnvelope) -> Result<Vec<u8>, String> {
    if let Some(payload) = &envelope.payload {
        return Ok(payload.clone().into_vec());
    }
    if let Some(encoded) = &envelope.payload_b64 {
        return BASE64
            .decode(encoded)
            .map_err(|err| format!("Invalid payload base64: {err}"));
    }
    Ok(Vec::new())
}

fn encode_response(response: &ResponseEnvelope, wire: WireCodec) -> Result<Vec<u8>, String> {
    match wire {
        WireCodec::Msgpack => rmp_serde::to_vec_named(response).map_err(|err| err.to_string()),
        WireCodec::Json => {
            let payload_b64 = response
                .payload
                .as_ref()
                .map(|payload| BASE64.encode(payload.as_ref()));
            let json = ResponseEnvelopeJson {
                request_id: response.request_id,
                status: response.status.clone(),
                codec: response.codec.clone(),
                payload_b64,
                metrics: response.metrics.clone(),
                error: response.error.clone(),
                entry: response.entry.clone(),
            };
            serde_json::to_vec(&json).map_err(|err| err.to_string())
        }
    }
}

fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8], codec: &str) -> Result<T, String> {
    match codec {
        "msgpack" => rmp_serde::from_slice(payload).map_err(|err| err.to_string()),
        "json" => serde_json::from_slice(payload).map_err(|err| err.to_string()),
        _ => Err(format!("Unsupported payload codec '{codec}'")),
    }
}

fn encode_payload<T: Serialize>(payload: &T, codec: &str) -> Result<Vec<u8>, String> {
    match codec {
        "msgpack" => rmp_serde::to_vec_named(payload).map_err(|err| err.to_string()),
        "json" => serde_json::to_vec(payload).map_err(|err| err.to_string()),
        _ => Err(format!("Unsupported payload codec '{codec}'")),
    }
}

/// Runs a `query` entry and returns the encoded items plus their count.
fn query_entry(
    envelope: &RequestEnvelope,
    payload_bytes: &[u8],
    connector: &AnyConnector,
) -> Result<(String, Vec<u8>, usize), ExecError> {
    let payload = decode_payload::<QueryPayload>(payload_bytes, &envelope.codec)
        .map_err(ExecError::invalid_input)?;
    let (credentials, request) = payload.into_parts();
    let items = run_query(connector, &credentials, &request)?;
    let encoded = encode_payload(&items, &envelope.codec).map_err(ExecError::internal)?;
    Ok((envelope.codec.clone(), encoded, items.len()))
}

fn execute_entry(
    envelope: &RequestEnvelope,
    connector: &AnyConnector,
) -> Result<(String, Vec<u8>, usize), ExecError> {
    let payload_bytes = extract_payload(envelope).map_err(ExecError::invalid_input)?;
    match envelope.entry.as_str() {
        "__ping__" => Ok(("raw".to_string(), Vec::new(), 0)),
        "query" => query_entry(envelope, &payload_bytes, connector),
        _ => Err(ExecError::invalid_input(format!(
            "Unknown entry '{}'.",
            envelope.entry
        ))),
    }
}

fn handle_request(
    request: DecodedRequest,
    queue_depth: usize,
    connector: &AnyConnector,
) -> (WireCodec, ResponseEnvelope) {
    let wire = request.wire;
    let envelope = request.envelope;
    let request_id = envelope.request_id;
    let exec_start = Instant::now();
    let queue_ms = exec_start
        .duration_since(request.queued_at)
        .as_millis()
        .min(u128::from(u64::MAX)) as u64;
    let mut metrics = HashMap::new();
    metrics.insert("queue_ms".to_string(), queue_ms);
    metrics.insert("queue_depth".to_string(), queue_depth as u64);

    let result = execute_entry(&envelope, connector);
    let exec_ms = exec_start.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
    metrics.insert("exec_ms".to_string(), exec_ms);

    match result {
        Ok((codec, payload, items)) => {
            metrics.insert("items".to_string(), items as u64);
            tracing::debug!(request_id, items, exec_ms, "request completed");
            (
                wire,
                ResponseEnvelope {
                    request_id,
                    status: "Ok".to_string(),
                    codec,
                    payload: Some(ByteBuf::from(payload)),
                    metrics: Some(metrics),
                    error: None,
                    entry: Some(envelope.entry),
                },
            )
        }
        Err(err) => {
            tracing::info!(request_id, status = err.status, error = %err.message, "request failed");
            (
                wire,
                ResponseEnvelope {
                    request_id,
                    status: err.status.to_string(),
                    codec: "raw".to_string(),
                    payload: None,
                    metrics: Some(metrics),
                    error: Some(err.message),
                    entry: Some(envelope.entry),
                },
            )
        }
    }
}

fn response_with_status(wire: WireCodec, request_id: u64, status: &'static str, error: &str) {
    let mut stdout = io::stdout();
    let response = ResponseEnvelope {
        request_id,
        status: status.to_string(),
        codec: "raw".to_string(),
        payload: None,
        metrics: None,
        error: Some(error.to_string()),
        entry: None,
    };
    if let Ok(encoded) = encode_response(&response, wire) {
        let _ = write_frame(&mut stdout, &encoded);
    }
}

fn main() -> io::Result<()> {
    let config = WorkerConfig::parse();
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_max_level(config.log_level)
        .init();

    let thread_count = config.thread_count();
    let max_queue = config.queue_capacity();
    tracing::info!(threads = thread_count, max_queue, "qbind worker starting");

    let (request_tx, request_rx) = bounded::<DecodedRequest>(max_queue);
    let (response_tx, response_rx) = bounded::<(WireCodec, ResponseEnvelope)>(max_queue);
    let connector = Arc::new(AnyConnector::default());

    for _ in 0..thread_count {
        let request_rx = request_rx.clone();
        let response_tx = response_tx.clone();
        let connector = connector.clone();
        thread::spawn(move || worker_loop(request_rx, response_tx, connector));
    }

    let writer = thread::spawn(move || write_loop(response_rx));

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                response_with_status(WireCodec::Json, 0, "InvalidInput", &err.to_string());
                break;
            }
        };
        let decoded = match decode_request(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                response_with_status(WireCodec::Json, 0, "InvalidInput", &err);
                continue;
            }
        };
        match request_tx.try_send(decoded) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                tracing::warn!(request_id = request.envelope.request_id, "worker queue full");
                response_with_status(
                    request.wire,
                    request.envelope.request_id,
                    "Busy",
                    "Worker queue full",
                );
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    drop(request_tx);
    drop(response_tx);
    let _ = writer.join();
    tracing::info!("qbind worker stopped");
    Ok(())
}

fn worker_loop(
    request_rx: Receiver<DecodedRequest>,
    response_tx: Sender<(WireCodec, ResponseEnvelope)>,
    connector: Arc<AnyConnector>,
) {
    while let Ok(request) = request_rx.recv() {
        let queue_depth = request_rx.len();
        let response = handle_request(request, queue_depth, &connector);
        let _ = response_tx.send(response);
    }
}

fn write_loop(response_rx: Receiver<(WireCodec, ResponseEnvelope)>) {
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    while let Ok((wire, response)) = response_rx.recv() {
        let encoded = match encode_response(&response, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded) {
            tracing::error!(error = %err, "failed to write response");
            break;
        }
    }
}
