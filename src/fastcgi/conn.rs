//! 单个 FastCGI 连接：组装请求、交给路由处理并写回响应。
//!
//! 读取端在独立任务中解析记录；STDIN 在请求分发之后才陆续到达，经有界通道
//! 流式送入请求体，因此上传不会整体缓存在内存中。

use axum::Router;
use axum::body::Body as AxumBody;
use axum::extract::Request;
use axum::extract::connect_info::ConnectInfo;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::stream;
use http_body_util::BodyExt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tower::ServiceExt;
use tracing::{debug, warn};

use super::FcgiError;
use super::record::{
    BeginRequest, ProtocolStatus, ROLE_RESPONDER, Record, RecordType, encode_params,
    encode_record, encode_stream, end_request_body, parse_params, read_record,
    unknown_type_body,
};
use crate::storage::encode_url_path;

const EVENT_QUEUE: usize = 16;
const STDIN_QUEUE: usize = 8;

type BodyChunk = Result<Bytes, io::Error>;

/// 读取任务交给写出端的事件，按到达顺序逐个处理。
enum Event {
    Management(Record),
    Refuse(u16, ProtocolStatus),
    Aborted { id: u16, keep_conn: bool },
    Dispatch(Dispatch),
}

/// PARAMS 已收齐、可以交给路由的请求。
struct Dispatch {
    id: u16,
    keep_conn: bool,
    params: Bytes,
    body: AxumBody,
}

/// 读取端正在接收的请求；每个连接同一时刻只有一个。
struct Incoming {
    id: u16,
    keep_conn: bool,
    stage: Stage,
}

enum Stage {
    Params(BytesMut),
    /// 处理方丢弃请求体后为 `None`，剩余 STDIN 直接丢弃。
    Stdin(Option<mpsc::Sender<BodyChunk>>),
}

/// 处理一个连接上的全部记录，直到对端关闭或请求未要求保持连接。
pub async fn serve_connection<S>(stream: S, router: Router) -> Result<(), FcgiError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (events_tx, mut events) = mpsc::channel(EVENT_QUEUE);
    let demux = tokio::spawn(read_requests(reader, events_tx));

    let outcome = answer_events(&mut events, &mut writer, &router).await;
    if !matches!(outcome, Ok(true)) {
        demux.abort();
        let _ = demux.await;
        return outcome.map(drop);
    }
    match demux.await {
        Ok(result) => result,
        Err(err) => Err(io::Error::other(err).into()),
    }
}

/// 依次处理事件；对端关闭时返回 `true`，请求结束后主动关闭时返回 `false`。
async fn answer_events<W>(
    events: &mut mpsc::Receiver<Event>,
    writer: &mut W,
    router: &Router,
) -> Result<bool, FcgiError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = events.recv().await {
        let keep_conn = match event {
            Event::Management(record) => {
                handle_management(writer, &record).await?;
                true
            }
            Event::Refuse(id, status) => {
                write_end_request(writer, id, status).await?;
                true
            }
            Event::Aborted { id, keep_conn } => {
                debug!(request_id = id, "fastcgi request aborted");
                write_end_request(writer, id, ProtocolStatus::RequestComplete).await?;
                keep_conn
            }
            Event::Dispatch(dispatch) => {
                let keep_conn = dispatch.keep_conn;
                respond(writer, router, dispatch).await?;
                keep_conn
            }
        };
        if !keep_conn {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn read_requests<R>(reader: R, events: mpsc::Sender<Event>) -> Result<(), FcgiError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut incoming: Option<Incoming> = None;
    let result = demultiplex(&mut reader, &events, &mut incoming).await;

    // 连接在 STDIN 结束前断开：让处理方读到错误而不是被截断的请求体。
    if let Some(Incoming {
        stage: Stage::Stdin(Some(body)),
        ..
    }) = incoming
    {
        let _ = body
            .send(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "fastcgi stdin ended early",
            )))
            .await;
    }
    result
}

async fn demultiplex<R>(
    reader: &mut R,
    events: &mpsc::Sender<Event>,
    incoming: &mut Option<Incoming>,
) -> Result<(), FcgiError>
where
    R: AsyncRead + Unpin,
{
    while let Some(record) = read_record(reader).await? {
        let event = if record.request_id == 0 {
            Some(Event::Management(record))
        } else {
            on_request_record(record, incoming).await?
        };
        if let Some(event) = event
            && events.send(event).await.is_err()
        {
            return Ok(());
        }
    }
    Ok(())
}

async fn on_request_record(
    record: Record,
    incoming: &mut Option<Incoming>,
) -> Result<Option<Event>, FcgiError> {
    let id = record.request_id;
    match record.record_type {
        RecordType::BeginRequest => {
            let begin = BeginRequest::parse(&record.content)?;
            if incoming.is_some() {
                return Ok(Some(Event::Refuse(id, ProtocolStatus::CantMpxConn)));
            }
            if begin.role != ROLE_RESPONDER {
                return Ok(Some(Event::Refuse(id, ProtocolStatus::UnknownRole)));
            }
            *incoming = Some(Incoming {
                id,
                keep_conn: begin.keep_conn(),
                stage: Stage::Params(BytesMut::new()),
            });
        }
        RecordType::AbortRequest => {
            let Some(aborted) = incoming.take_if(|active| active.id == id) else {
                return Ok(None);
            };
            match aborted.stage {
                Stage::Params(_) => {
                    return Ok(Some(Event::Aborted {
                        id,
                        keep_conn: aborted.keep_conn,
                    }));
                }
                // 已分发的请求照常写出响应与 END_REQUEST，请求体以错误结束。
                Stage::Stdin(Some(body)) => {
                    let _ = body
                        .send(Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "fastcgi request aborted",
                        )))
                        .await;
                }
                Stage::Stdin(None) => {}
            }
        }
        RecordType::Params => {
            let Some(active) = incoming.as_mut().filter(|active| active.id == id) else {
                return Ok(None);
            };
            let Stage::Params(params) = &mut active.stage else {
                return Ok(None);
            };
            if !record.content.is_empty() {
                params.extend_from_slice(&record.content);
                return Ok(None);
            }
            let params = std::mem::take(params).freeze();
            let (body_tx, body_rx) = mpsc::channel(STDIN_QUEUE);
            active.stage = Stage::Stdin(Some(body_tx));
            return Ok(Some(Event::Dispatch(Dispatch {
                id,
                keep_conn: active.keep_conn,
                params,
                body: stdin_body(body_rx),
            })));
        }
        RecordType::Stdin => {
            let Some(active) = incoming.as_mut().filter(|active| active.id == id) else {
                return Ok(None);
            };
            let Stage::Stdin(body) = &mut active.stage else {
                debug!(request_id = id, "stdin before params ended, dropped");
                return Ok(None);
            };
            if record.content.is_empty() {
                *incoming = None;
            } else if let Some(sender) = body.as_ref()
                && sender.send(Ok(record.content)).await.is_err()
            {
                *body = None;
            }
        }
        other => {
            debug!(record_type = ?other, request_id = id, "ignoring fastcgi record");
        }
    }
    Ok(None)
}

fn stdin_body(chunks: mpsc::Receiver<BodyChunk>) -> AxumBody {
    AxumBody::from_stream(stream::unfold(chunks, |mut chunks| async move {
        chunks.recv().await.map(|chunk| (chunk, chunks))
    }))
}

async fn handle_management<W>(writer: &mut W, record: &Record) -> Result<(), FcgiError>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    match record.record_type {
        RecordType::GetValues => {
            let requested = parse_params(&record.content)?;
            let mut values = BytesMut::new();
            if requested.iter().any(|(name, _)| name == "FCGI_MPXS_CONNS") {
                encode_params(&mut values, [("FCGI_MPXS_CONNS", "0")]);
            }
            encode_record(&mut out, RecordType::GetValuesResult, 0, &values);
        }
        other => {
            encode_record(&mut out, RecordType::UnknownType, 0, &unknown_type_body(other));
        }
    }
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

async fn respond<W>(writer: &mut W, router: &Router, dispatch: Dispatch) -> Result<(), FcgiError>
where
    W: AsyncWrite + Unpin,
{
    let params = parse_params(&dispatch.params)?;
    let response = match build_request(&params, dispatch.body) {
        Ok(request) => router
            .clone()
            .oneshot(request)
            .await
            .unwrap_or_else(|never| match never {}),
        Err(err) => {
            warn!(request_id = dispatch.id, error = %err, "invalid fastcgi request");
            (StatusCode::BAD_REQUEST, err.to_string()).into_response()
        }
    };
    write_response(writer, dispatch.id, response).await?;
    write_end_request(writer, dispatch.id, ProtocolStatus::RequestComplete).await
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.is_empty())
}

/// 根据 CGI 环境变量构建 HTTP 请求。
///
/// 没有 `REQUEST_URI` 时由已解码的 `SCRIPT_NAME` 与 `PATH_INFO` 拼出路径，
/// 逐段重新转义后再解析。
pub fn build_request(params: &[(String, String)], body: AxumBody) -> Result<Request, FcgiError> {
    let method = param(params, "REQUEST_METHOD").unwrap_or("GET");
    let uri = match param(params, "REQUEST_URI") {
        Some(uri) => uri.to_string(),
        None => {
            let mut uri = encode_url_path(&format!(
                "{}{}",
                param(params, "SCRIPT_NAME").unwrap_or_default(),
                param(params, "PATH_INFO").unwrap_or_default()
            ));
            if uri.is_empty() {
                uri.push('/');
            }
            if let Some(query) = param(params, "QUERY_STRING") {
                uri.push('?');
                uri.push_str(query);
            }
            uri
        }
    };

    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in params {
        let header_name = match name.as_str() {
            "CONTENT_TYPE" => Some("content-type".to_string()),
            "CONTENT_LENGTH" => Some("content-length".to_string()),
            other => other
                .strip_prefix("HTTP_")
                .map(|suffix| suffix.to_ascii_lowercase().replace('_', "-")),
        };
        if let Some(header_name) = header_name
            && !value.is_empty()
        {
            builder = builder.header(header_name, value.as_str());
        }
    }

    let mut request = builder
        .body(body)
        .map_err(|err| FcgiError::InvalidRequest(err.to_string()))?;
    if let (Some(addr), Some(port)) = (param(params, "REMOTE_ADDR"), param(params, "REMOTE_PORT"))
        && let (Ok(ip), Ok(port)) = (addr.parse::<IpAddr>(), port.parse::<u16>())
    {
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::new(ip, port)));
    }
    Ok(request)
}

/// 以 CGI 响应格式（`Status:` 行 + 头 + 空行 + 正文）写出 STDOUT 流。
async fn write_response<W>(
    writer: &mut W,
    request_id: u16,
    response: Response,
) -> Result<(), FcgiError>
where
    W: AsyncWrite + Unpin,
{
    let (parts, mut body) = response.into_parts();

    let mut head = Vec::new();
    head.extend_from_slice(
        format!(
            "Status: {} {}\r\n",
            parts.status.as_u16(),
            parts.status.canonical_reason().unwrap_or_default()
        )
        .as_bytes(),
    );
    for (name, value) in &parts.headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    let mut out = BytesMut::new();
    encode_stream(&mut out, RecordType::Stdout, request_id, &head);
    writer.write_all(&out).await?;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| FcgiError::Io(io::Error::other(err.to_string())))?;
        if let Ok(data) = frame.into_data() {
            out.clear();
            encode_stream(&mut out, RecordType::Stdout, request_id, &data);
            writer.write_all(&out).await?;
        }
    }

    out.clear();
    encode_record(&mut out, RecordType::Stdout, request_id, &[]);
    writer.write_all(&out).await?;
    Ok(())
}

async fn write_end_request<W>(
    writer: &mut W,
    request_id: u16,
    status: ProtocolStatus,
) -> Result<(), FcgiError>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    encode_record(
        &mut out,
        RecordType::EndRequest,
        request_id,
        &end_request_body(0, status),
    );
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}
