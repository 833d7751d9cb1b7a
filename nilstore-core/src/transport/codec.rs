//! Wire framing for the peer-to-peer fetch protocol
//!
//! Request: one JSON object, then the writer closes its half of the stream.
//!
//! Response:
//! ```text
//! [u32 BE header_len][header JSON: {status, error?, headers?, body_len}][body]
//! ```

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

pub const FETCH_PROTOCOL: &str = "/nilstore/fetch/1.0.0";

/// Cap on a buffered response, enforced while reading
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// Cap on an incoming request body
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("response of {0} bytes is shorter than the length prefix")]
    TooShort(usize),

    #[error("declared header length {declared} is invalid for {available} remaining bytes")]
    InvalidHeaderLength { declared: usize, available: usize },

    #[error("body length {body_len} overruns buffer ({available} bytes available)")]
    BodyOverrun { body_len: u64, available: usize },

    #[error("malformed header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub manifest_root: String,
    pub deal_id: u64,
    pub owner: String,
    pub file_path: String,
    pub range_start: u64,
    pub range_len: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onchain_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ResponseHeader {
    status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub error: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            error: None,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn failure(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub fn encode_request(request: &FetchRequest) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(request)
}

pub fn decode_request(bytes: &[u8]) -> Result<FetchRequest, serde_json::Error> {
    serde_json::from_slice(bytes)
}

pub fn encode_response(response: &FetchResponse) -> Result<Vec<u8>, serde_json::Error> {
    let header = serde_json::to_vec(&ResponseHeader {
        status: response.status,
        error: response.error.clone(),
        headers: response.headers.clone(),
        body_len: response.body.len() as u64,
    })?;
    let mut out = Vec::with_capacity(4 + header.len() + response.body.len());
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&response.body);
    Ok(out)
}

/// Parse a complete response envelope. Nothing is returned unless the whole
/// envelope is well-formed.
pub fn decode_response(bytes: &[u8]) -> Result<FetchResponse, FramingError> {
    if bytes.len() < 4 {
        return Err(FramingError::TooShort(bytes.len()));
    }
    let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let available = bytes.len() - 4;
    if declared == 0 || declared > available {
        return Err(FramingError::InvalidHeaderLength {
            declared,
            available,
        });
    }

    let header_end = 4 + declared;
    let header: ResponseHeader = serde_json::from_slice(&bytes[4..header_end])?;

    let body_available = bytes.len() - header_end;
    let body_end = usize::try_from(header.body_len)
        .ok()
        .and_then(|len| header_end.checked_add(len))
        .filter(|end| *end <= bytes.len())
        .ok_or(FramingError::BodyOverrun {
            body_len: header.body_len,
            available: body_available,
        })?;

    Ok(FetchResponse {
        status: header.status,
        error: header.error,
        headers: header.headers,
        body: bytes[header_end..body_end].to_vec(),
    })
}

/// Read a stream to EOF, failing as soon as more than `limit` bytes arrive.
pub async fn read_limited<R>(io: &mut R, limit: usize) -> Result<Vec<u8>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = io.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > limit {
            return Err(FramingError::TooLarge { limit });
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn invalid_data(err: FramingError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// request-response codec for [`FETCH_PROTOCOL`]
#[derive(Debug, Clone, Default)]
pub struct FetchCodec;

#[async_trait]
impl request_response::Codec for FetchCodec {
    type Protocol = StreamProtocol;
    type Request = FetchRequest;
    type Response = FetchResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let bytes = read_limited(io, MAX_REQUEST_BYTES).await.map_err(invalid_data)?;
        decode_request(&bytes).map_err(|e| invalid_data(e.into()))
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let bytes = read_limited(io, MAX_RESPONSE_BYTES).await.map_err(invalid_data)?;
        decode_response(&bytes).map_err(invalid_data)
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes = encode_request(&request).map_err(|e| invalid_data(e.into()))?;
        io.write_all(&bytes).await?;
        io.close().await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        response: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes = encode_response(&response).map_err(|e| invalid_data(e.into()))?;
        io.write_all(&bytes).await?;
        io.close().await
    }
}
