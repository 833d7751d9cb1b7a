//! File-range retrieval across every configured transport
//!
//! A [`Retriever`] turns one [`RetrievalRequest`] into router candidates:
//! the local cache, the gateway, the provider directly, and each configured
//! peer. The router decides the order and handles fallback and backoff.

use libp2p::{Multiaddr, PeerId};
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, Url};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, LocalCache};
use crate::ids::{DealId, ValidationError};
use crate::manifest::ManifestRoot;
use crate::metadata::MetadataUnit;
use crate::metrics::Metrics;
use crate::range::plan_range_chunks;
use crate::transport::{
    parse_peer_addr, Backend, Candidate, DecisionTrace, ErrorClass, FetchRequest, P2pClient,
    RouteFailure, TransportError, TransportRouter,
};

pub const FETCH_PATH: &str = "/gateway/fetch";
pub const HEADER_PROVIDER: &str = "x-nil-provider";
pub const HEADER_SESSION: &str = "x-nil-session-id";

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Route(#[from] RouteFailure),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl RetrievalError {
    pub fn reason(&self) -> &'static str {
        match self {
            RetrievalError::Validation(_) => "invalid",
            RetrievalError::Cache(_) => "malformed",
            RetrievalError::Route(failure) => failure.error.reason(),
            RetrievalError::Client(_) => "invalid",
        }
    }

    pub fn trace(&self) -> Option<&DecisionTrace> {
        match self {
            RetrievalError::Route(failure) => Some(&failure.trace),
            _ => None,
        }
    }
}

/// A byte range of one file in a committed deal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalRequest {
    pub deal_id: DealId,
    pub manifest_root: ManifestRoot,
    pub owner: String,
    pub file_path: String,
    pub range_start: u64,
    /// Zero reads to the end of the file
    pub range_len: u64,
    pub onchain_session: Option<String>,
    pub download_session: Option<String>,
    /// Reject responses served by any other provider
    pub expected_provider: Option<String>,
}

impl RetrievalRequest {
    pub fn new(deal_id: DealId, manifest_root: ManifestRoot, owner: &str, file_path: &str) -> Self {
        Self {
            deal_id,
            manifest_root,
            owner: owner.to_string(),
            file_path: file_path.to_string(),
            range_start: 0,
            range_len: 0,
            onchain_session: None,
            download_session: None,
            expected_provider: None,
        }
    }

    pub fn with_range(mut self, start: u64, len: u64) -> Self {
        self.range_start = start;
        self.range_len = len;
        self
    }

    pub fn is_whole_file(&self) -> bool {
        self.range_start == 0 && self.range_len == 0
    }

    fn range_header(&self) -> Option<String> {
        match (self.range_start, self.range_len) {
            (0, 0) => None,
            (start, 0) => Some(format!("bytes={}-", start)),
            (start, len) => Some(format!("bytes={}-{}", start, start.saturating_add(len - 1))),
        }
    }

    fn wire(&self, range_start: u64, range_len: u64) -> FetchRequest {
        FetchRequest {
            manifest_root: self.manifest_root.to_string(),
            deal_id: self.deal_id.0,
            owner: self.owner.clone(),
            file_path: self.file_path.clone(),
            range_start,
            range_len,
            onchain_session: self.onchain_session.clone(),
            download_session: self.download_session.clone(),
        }
    }

    fn fetch_url(&self, base: &str) -> Result<Url, ValidationError> {
        let mut url = Url::parse(&format!(
            "{}{}/{}",
            base.trim_end_matches('/'),
            FETCH_PATH,
            self.manifest_root
        ))
        .map_err(|_| ValidationError::InvalidAddress(base.to_string()))?;
        url.query_pairs_mut()
            .append_pair("deal_id", &self.deal_id.to_string())
            .append_pair("owner", &self.owner)
            .append_pair("file_path", &self.file_path);
        Ok(url)
    }
}

/// Result of a successful retrieval
#[derive(Debug)]
pub struct Retrieved {
    pub data: Vec<u8>,
    pub backend: Backend,
    pub trace: DecisionTrace,
}

/// Network endpoints a retriever may use
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub gateway_base: Option<String>,
    pub provider_base: Option<String>,
    /// Multiaddrs ending in `/p2p/<peer id>`
    pub p2p_peers: Vec<String>,
}

pub struct Retriever {
    http: Client,
    router: TransportRouter,
    endpoints: Endpoints,
    peers: Vec<(PeerId, Multiaddr)>,
    cache: Option<LocalCache>,
    p2p: Option<Arc<P2pClient>>,
    metrics: Metrics,
}

impl Retriever {
    pub fn new(router: TransportRouter, endpoints: Endpoints) -> Result<Self, RetrievalError> {
        let peers = endpoints
            .p2p_peers
            .iter()
            .map(|addr| parse_peer_addr(addr))
            .collect::<Result<Vec<_>, _>>()?;
        let http = Client::builder()
            .timeout(router.options().request_timeout)
            .build()?;

        Ok(Self {
            http,
            router,
            endpoints,
            peers,
            cache: None,
            p2p: None,
            metrics: Metrics::new(),
        })
    }

    pub fn with_cache(mut self, cache: LocalCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_p2p(mut self, client: Arc<P2pClient>) -> Self {
        self.p2p = Some(client);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn router(&self) -> &TransportRouter {
        &self.router
    }

    pub async fn fetch(
        &self,
        request: &RetrievalRequest,
        cancel: &CancellationToken,
    ) -> Result<Retrieved, RetrievalError> {
        if request.file_path.trim().is_empty() {
            return Err(ValidationError::InvalidPath(request.file_path.clone()).into());
        }

        let mut candidates = Vec::new();

        if let Some(cache) = &self.cache {
            candidates.push(self.cache_candidate(cache.clone(), request));
        }
        if let Some(base) = &self.endpoints.gateway_base {
            candidates.push(self.http_candidate(Backend::Gateway, base, request)?);
        }
        if let Some(base) = &self.endpoints.provider_base {
            candidates.push(self.http_candidate(Backend::DirectSp, base, request)?);
        }
        if let Some(client) = &self.p2p {
            match self.plan_p2p(request).await? {
                Some(plan) => {
                    for (peer, addr) in &self.peers {
                        candidates.push(p2p_candidate(
                            Arc::clone(client),
                            *peer,
                            addr.clone(),
                            request,
                            plan.clone(),
                        ));
                    }
                }
                None => debug!("Skipping p2p: range length unknown"),
            }
        }

        let op = format!("fetch {}", request.file_path);
        let routed = self.router.execute(&op, candidates, cancel).await?;
        self.metrics.bytes_fetched(routed.value.len());

        if routed.backend != Backend::LocalCache && request.is_whole_file() {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache
                    .put_file_entry(request.deal_id, &request.file_path, routed.value.clone())
                    .await
                {
                    warn!("Failed to cache downloaded file: {}", e);
                }
            }
        }

        info!(
            backend = %routed.backend,
            bytes = routed.value.len(),
            file = %request.file_path,
            "Fetch complete"
        );
        Ok(Retrieved {
            data: routed.value,
            backend: routed.backend,
            trace: routed.trace,
        })
    }

    /// Chunk plan for peer requests, as `(start, len)` pairs relative to the
    /// file. Uses the cached file layout when present so chunks respect unit
    /// and blob boundaries.
    async fn plan_p2p(&self, request: &RetrievalRequest) -> Result<Option<Vec<(u64, u64)>>, RetrievalError> {
        let record = match &self.cache {
            Some(cache) => match cache.get_unit(request.deal_id, 0).await? {
                Some(bytes) => MetadataUnit::parse(&bytes)
                    .ok()
                    .and_then(|m| m.find(&request.file_path)),
                None => None,
            },
            None => None,
        };

        let (start_offset, size) = match (&record, request.range_len) {
            (Some(r), _) => (r.start_offset, r.size),
            (None, 0) => return Ok(None),
            (None, len) => match request.range_start.checked_add(len) {
                Some(end) => (0, end),
                None => return Ok(None),
            },
        };
        let len = if request.range_len == 0 {
            size.saturating_sub(request.range_start)
        } else {
            request.range_len
        };

        let chunks = plan_range_chunks(start_offset, size, request.range_start, len)?;
        Ok(Some(
            chunks
                .into_iter()
                .map(|c| (c.range_start, c.range_len))
                .collect(),
        ))
    }

    fn cache_candidate(&self, cache: LocalCache, request: &RetrievalRequest) -> Candidate<Vec<u8>> {
        let request = request.clone();
        let metrics = self.metrics.clone();
        Candidate::new(Backend::LocalCache, "local", move |_| {
            let cache = cache.clone();
            let request = request.clone();
            let metrics = metrics.clone();
            async move {
                match serve_from_cache(&cache, &request).await {
                    Ok(Some(data)) => {
                        metrics.cache_hit();
                        Ok(data)
                    }
                    Ok(None) => {
                        metrics.cache_miss();
                        Err(TransportError::new(ErrorClass::NotFound, "not cached"))
                    }
                    Err(e) => {
                        metrics.cache_miss();
                        Err(TransportError::new(ErrorClass::Unknown, e.to_string()))
                    }
                }
            }
        })
    }

    fn http_candidate(
        &self,
        backend: Backend,
        base: &str,
        request: &RetrievalRequest,
    ) -> Result<Candidate<Vec<u8>>, ValidationError> {
        let url = request.fetch_url(base)?;
        let client = self.http.clone();
        let mut headers = HeaderMap::new();
        if let Some(range) = request.range_header() {
            headers.insert(RANGE, header_value(&range)?);
        }
        if let Some(session) = &request.download_session {
            headers.insert(HEADER_SESSION, header_value(session)?);
        }
        let expected = request.expected_provider.clone();

        Ok(Candidate::new(backend, base.to_string(), move |_| {
            let request = client.get(url.clone()).headers(headers.clone());
            let expected = expected.clone();
            async move {
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(TransportError::http(status.as_u16(), body));
                }
                let provider = response
                    .headers()
                    .get(HEADER_PROVIDER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                check_provider(expected.as_deref(), provider.as_deref())?;
                Ok(response.bytes().await?.to_vec())
            }
        }))
    }
}

fn header_value(value: &str) -> Result<reqwest::header::HeaderValue, ValidationError> {
    value
        .parse()
        .map_err(|_| ValidationError::InvalidRange(format!("bad header value {:?}", value)))
}

fn check_provider(expected: Option<&str>, actual: Option<&str>) -> Result<(), TransportError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match actual {
        None => Err(TransportError::new(
            ErrorClass::InvalidResponse,
            "missing X-Nil-Provider",
        )),
        Some(actual) if actual != expected => Err(TransportError::new(
            ErrorClass::ProviderMismatch,
            format!("provider mismatch: expected {} got {}", expected, actual),
        )),
        Some(_) => Ok(()),
    }
}

fn p2p_candidate(
    client: Arc<P2pClient>,
    peer: PeerId,
    addr: Multiaddr,
    request: &RetrievalRequest,
    plan: Vec<(u64, u64)>,
) -> Candidate<Vec<u8>> {
    let request = request.clone();
    let endpoint = format!("{}/p2p/{}", addr, peer);
    Candidate::new(Backend::Libp2p, endpoint, move |_| {
        let client = Arc::clone(&client);
        let addr = addr.clone();
        let request = request.clone();
        let plan = plan.clone();
        async move {
            let mut data = Vec::new();
            for (start, len) in plan {
                let response = client.fetch(peer, addr.clone(), request.wire(start, len)).await?;
                let provider = response.headers.get(HEADER_PROVIDER).map(String::as_str);
                check_provider(request.expected_provider.as_deref(), provider)?;
                if response.body.len() as u64 != len {
                    return Err(TransportError::new(
                        ErrorClass::InvalidResponse,
                        format!("expected {} bytes, peer sent {}", len, response.body.len()),
                    ));
                }
                data.extend_from_slice(&response.body);
            }
            Ok(data)
        }
    })
}

/// The requested range from the cache.
///
/// A downloaded file entry is served unless the deal's cached slab belongs
/// to another manifest. Without an entry, the range is decoded from cached
/// units of the matching slab.
async fn serve_from_cache(
    cache: &LocalCache,
    request: &RetrievalRequest,
) -> Result<Option<Vec<u8>>, CacheError> {
    let cached_root = cache.manifest_root(request.deal_id).await?;
    if cached_root.is_some_and(|root| root != request.manifest_root) {
        return Ok(None);
    }
    let len = (request.range_len > 0).then_some(request.range_len);

    if let Some(file) = cache.get_file_entry(request.deal_id, &request.file_path).await? {
        return Ok(slice_range(&file, request.range_start, len).map(<[u8]>::to_vec));
    }
    if cached_root.is_none() {
        return Ok(None);
    }

    cache
        .read_file_range(request.deal_id, &request.file_path, request.range_start, len)
        .await
}

/// `[start, start + len)` of `file`, clamped to its end. `None` past EOF.
fn slice_range(file: &[u8], start: u64, len: Option<u64>) -> Option<&[u8]> {
    let size = file.len() as u64;
    if start >= size {
        return None;
    }
    let end = match len {
        Some(len) => start.saturating_add(len).min(size),
        None => size,
    };
    Some(&file[start as usize..end as usize])
}
