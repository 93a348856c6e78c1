use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::message;
use crate::series::{ColumnSeriesMap, DataSet, SeriesError};

const RPC_CONTENT_TYPE: &str = "application/x-msgpack";

/// Errors returned by the batch call path.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("encode request: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode response: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// The server answered with a non-200 status; `detail` carries the
    /// response body text.
    #[error("response error ({status}): {detail}")]
    Status { status: u16, detail: String },
    /// The call reached the service but the service reported an error.
    #[error("service error: {0}")]
    Service(String),
    #[error(transparent)]
    Series(#[from] SeriesError),
}

/// Client for one time-series data service endpoint.
///
/// Each `Client` is self-contained: it owns its parsed base endpoint,
/// its HTTP connection pool, and its request-id counter. Subscriptions
/// opened through it each own their socket and task pair, so clients
/// and subscriptions never share mutable state.
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
    request_ids: AtomicU64,
}

/// One query against a series bucket, in the shape the service expects.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_record_count: Option<u32>,
    pub limit_from_start: bool,
}

impl QueryRequest {
    /// Query everything in `destination` (e.g. `"XYZ/1Min/OHLCV"`).
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            epoch_start: None,
            epoch_end: None,
            limit_record_count: None,
            limit_from_start: false,
        }
    }

    /// Restrict to rows with epochs in `[start, end]` (builder style).
    pub fn between(mut self, start: i64, end: i64) -> Self {
        self.epoch_start = Some(start);
        self.epoch_end = Some(end);
        self
    }

    /// Cap the row count, counting from the end of the range.
    pub fn limit(mut self, count: u32) -> Self {
        self.limit_record_count = Some(count);
        self
    }

    /// Make `limit` count from the start of the range instead.
    pub fn limit_from_start(mut self) -> Self {
        self.limit_from_start = true;
        self
    }
}

/// One dataset to persist, keyed by the buckets in its `DataSet`.
#[derive(Debug, Clone, Serialize)]
pub struct WriteRequest {
    pub data: DataSet,
    pub is_variable_length: bool,
}

#[derive(Serialize)]
struct RpcRequest<'a, T> {
    method: &'a str,
    params: (&'a T,),
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct MultiQueryRequest<'a> {
    requests: &'a [QueryRequest],
}

#[derive(Deserialize)]
struct MultiQueryResponse {
    #[serde(default)]
    responses: Vec<QueryResponse>,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: DataSet,
}

#[derive(Serialize)]
struct MultiWriteRequest<'a> {
    requests: &'a [WriteRequest],
}

#[derive(Deserialize)]
struct MultiWriteResponse {
    #[serde(default)]
    responses: Vec<WriteResponse>,
}

#[derive(Deserialize)]
struct WriteResponse {
    #[serde(default)]
    error: Option<String>,
}

impl Client {
    /// Create a client for the service at `base_url`.
    ///
    /// The endpoint is parsed eagerly so a malformed URL fails here
    /// rather than on the first call.
    pub fn new(base_url: &str) -> Result<Self, RpcError> {
        let base_url = Url::parse(base_url)?;
        Ok(Self {
            base_url,
            http: reqwest::Client::new(),
            request_ids: AtomicU64::new(1),
        })
    }

    /// The service base endpoint this client talks to.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Run a batch of queries and collect the results per series
    /// bucket.
    pub async fn query(&self, requests: &[QueryRequest]) -> Result<ColumnSeriesMap, RpcError> {
        let reply: MultiQueryResponse = self
            .call("DataService.Query", &MultiQueryRequest { requests })
            .await?;
        let mut out = ColumnSeriesMap::new();
        for response in reply.responses {
            response.result.merge_into(&mut out)?;
        }
        Ok(out)
    }

    /// Persist a batch of datasets. The first per-dataset error the
    /// service reports is surfaced as [`RpcError::Service`].
    pub async fn write(&self, requests: &[WriteRequest]) -> Result<(), RpcError> {
        let reply: MultiWriteResponse = self
            .call("DataService.Write", &MultiWriteRequest { requests })
            .await?;
        for response in reply.responses {
            if let Some(error) = response.error.filter(|e| !e.is_empty()) {
                return Err(RpcError::Service(error));
            }
        }
        Ok(())
    }

    /// POST one msgpack-RPC envelope to `<base>/rpc` and decode the
    /// reply envelope.
    async fn call<T, R>(&self, method: &str, args: &T) -> Result<R, RpcError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let id = self.request_ids.fetch_add(1, Ordering::Relaxed);
        let body = message::encode(&RpcRequest {
            method,
            params: (args,),
            id,
        })?;

        debug!(method, id, "rpc call");
        let response = self
            .http
            .post(self.rpc_endpoint())
            .header(reqwest::header::CONTENT_TYPE, RPC_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        if status != 200 {
            return Err(RpcError::Status {
                status,
                detail: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let reply: RpcResponse<R> = message::decode(&bytes)?;
        if let Some(error) = reply.error {
            return Err(RpcError::Service(error));
        }
        reply
            .result
            .ok_or_else(|| RpcError::Service("empty rpc result".to_string()))
    }

    fn rpc_endpoint(&self) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}/rpc", self.base_url.path().trim_end_matches('/'));
        url.set_path(&path);
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_endpoint() {
        assert!(matches!(Client::new("::not a url::"), Err(RpcError::Url(_))));
    }

    #[test]
    fn rpc_endpoint_respects_base_path() {
        let client = Client::new("http://localhost:5993").unwrap();
        assert_eq!(client.rpc_endpoint().as_str(), "http://localhost:5993/rpc");

        let client = Client::new("https://data.example.com/api/").unwrap();
        assert_eq!(
            client.rpc_endpoint().as_str(),
            "https://data.example.com/api/rpc"
        );
    }

    #[test]
    fn rpc_envelope_is_a_named_map() {
        let args = QueryRequest::new("XYZ/1Min/OHLCV").between(100, 200).limit(10);
        let buf = message::encode(&RpcRequest {
            method: "DataService.Query",
            params: (&MultiQueryRequest {
                requests: &[args],
            },),
            id: 7,
        })
        .expect("encode");

        let value: rmpv::Value = message::decode(&buf).expect("decode");
        let map = value.as_map().expect("envelope should be a map");
        let keys: Vec<&str> = map.iter().filter_map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["method", "params", "id"]);
        // params travels as a one-element array, net/rpc style
        let params = &map[1].1;
        assert_eq!(params.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn query_request_omits_unset_bounds() {
        let buf = message::encode(&QueryRequest::new("XYZ/1Min/OHLCV")).expect("encode");
        let value: rmpv::Value = message::decode(&buf).expect("decode");
        let keys: Vec<&str> = value
            .as_map()
            .expect("map")
            .iter()
            .filter_map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, ["destination", "limit_from_start"]);
    }
}
