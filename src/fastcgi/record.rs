//! FastCGI 记录编解码（协议版本 1）。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::FcgiError;

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 65535;

pub const ROLE_RESPONDER: u16 = 1;
pub const FLAG_KEEP_CONN: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl From<u8> for RecordType {
    fn from(value: u8) -> Self {
        match value {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u8 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(other) => other,
        }
    }
}

/// `FCGI_END_REQUEST` 中的 protocolStatus。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    UnknownRole = 3,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub request_id: u16,
    pub content: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn parse(content: &[u8]) -> Result<Self, FcgiError> {
        let mut buf = content;
        if buf.remaining() < 8 {
            return Err(FcgiError::MalformedRecord("FCGI_BEGIN_REQUEST"));
        }
        let role = buf.get_u16();
        let flags = buf.get_u8();
        Ok(Self { role, flags })
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

/// 读取一条记录；连接在记录边界处关闭时返回 `None`。
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>, FcgiError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let mut buf = &header[..];
    let version = buf.get_u8();
    if version != VERSION_1 {
        return Err(FcgiError::UnsupportedVersion(version));
    }
    let record_type = RecordType::from(buf.get_u8());
    let request_id = buf.get_u16();
    let content_len = buf.get_u16() as usize;
    let padding_len = buf.get_u8() as usize;

    let mut content = vec![0u8; content_len + padding_len];
    reader.read_exact(&mut content).await?;
    content.truncate(content_len);

    Ok(Some(Record {
        record_type,
        request_id,
        content: Bytes::from(content),
    }))
}

/// 追加一条记录，内容补齐到 8 字节对齐。`content` 不得超过 [`MAX_CONTENT_LEN`]。
pub fn encode_record(out: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;
    out.reserve(HEADER_LEN + content.len() + padding);
    out.put_u8(VERSION_1);
    out.put_u8(record_type.into());
    out.put_u16(request_id);
    out.put_u16(content.len() as u16);
    out.put_u8(padding as u8);
    out.put_u8(0);
    out.put_slice(content);
    out.put_bytes(0, padding);
}

/// 把任意长度的流数据拆成多条记录，不写结束用的空记录。
pub fn encode_stream(out: &mut BytesMut, record_type: RecordType, request_id: u16, data: &[u8]) {
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        encode_record(out, record_type, request_id, chunk);
    }
}

pub fn end_request_body(app_status: u32, status: ProtocolStatus) -> [u8; 8] {
    let mut body = [0u8; 8];
    body[..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = status as u8;
    body
}

pub fn unknown_type_body(record_type: RecordType) -> [u8; 8] {
    let mut body = [0u8; 8];
    body[0] = record_type.into();
    body
}

fn read_length(buf: &mut &[u8]) -> Result<usize, FcgiError> {
    if !buf.has_remaining() {
        return Err(FcgiError::MalformedParams);
    }
    if buf.chunk()[0] >> 7 == 0 {
        return Ok(buf.get_u8() as usize);
    }
    if buf.remaining() < 4 {
        return Err(FcgiError::MalformedParams);
    }
    Ok((buf.get_u32() & 0x7fff_ffff) as usize)
}

/// 解析 name-value 对（PARAMS 与 GET_VALUES 共用）。
pub fn parse_params(content: &[u8]) -> Result<Vec<(String, String)>, FcgiError> {
    let mut buf = content;
    let mut pairs = Vec::new();
    while buf.has_remaining() {
        let name_len = read_length(&mut buf)?;
        let value_len = read_length(&mut buf)?;
        if buf.remaining() < name_len + value_len {
            return Err(FcgiError::MalformedParams);
        }
        let name = String::from_utf8_lossy(&buf[..name_len]).into_owned();
        buf.advance(name_len);
        let value = String::from_utf8_lossy(&buf[..value_len]).into_owned();
        buf.advance(value_len);
        pairs.push((name, value));
    }
    Ok(pairs)
}

fn put_length(out: &mut BytesMut, len: usize) {
    if len < 0x80 {
        out.put_u8(len as u8);
    } else {
        out.put_u32(len as u32 | 0x8000_0000);
    }
}

pub fn encode_params<'a, I>(out: &mut BytesMut, pairs: I)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (name, value) in pairs {
        put_length(out, name.len());
        put_length(out, value.len());
        out.put_slice(name.as_bytes());
        out.put_slice(value.as_bytes());
    }
}
