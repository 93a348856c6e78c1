//! Batch call path against canned-HTTP stub servers.

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use tickstream::{
    Client, Column, ColumnSeries, DataSet, QueryRequest, RpcError, SeriesKey, WriteRequest,
    message,
};

/// Serve one HTTP request with a fixed response; the raw request bytes
/// are reported back for inspection.
async fn serve_rpc(status: &'static str, body: Vec<u8>) -> (String, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (request_tx, request_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = listener.accept().await {
            let request = read_request(&mut sock).await;
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/x-msgpack\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                body.len()
            );
            sock.write_all(head.as_bytes()).await.expect("write head");
            sock.write_all(&body).await.expect("write body");
            sock.flush().await.expect("flush");
            let _ = request_tx.send(request);
        }
    });
    (format!("http://{}", addr), request_rx)
}

/// Read headers plus a content-length body off the socket.
async fn read_request(sock: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = sock.read(&mut chunk).await.expect("read request");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + content_length {
                break;
            }
        }
    }
    buf
}

#[derive(Serialize)]
struct Envelope<R> {
    result: R,
    error: Option<String>,
    id: u64,
}

#[derive(Serialize)]
struct QueryReply {
    responses: Vec<QueryResp>,
}

#[derive(Serialize)]
struct QueryResp {
    result: DataSet,
}

#[derive(Serialize)]
struct WriteReply {
    responses: Vec<WriteResp>,
}

#[derive(Serialize)]
struct WriteResp {
    error: Option<String>,
}

fn sample_dataset(key: &str) -> DataSet {
    let series = ColumnSeries::new()
        .add_column("Epoch", Column::I64(vec![10, 20, 30]))
        .add_column("Close", Column::F64(vec![1.5, 2.5, 3.5]));
    DataSet::from_column_series(&SeriesKey::new(key), &series)
}

#[tokio::test]
async fn query_round_trips_the_envelope() {
    let reply = Envelope {
        result: QueryReply {
            responses: vec![QueryResp {
                result: sample_dataset("XYZ/1Min/OHLCV"),
            }],
        },
        error: None,
        id: 1,
    };
    let (endpoint, request_rx) =
        serve_rpc("200 OK", message::encode(&reply).expect("encode reply")).await;

    let client = Client::new(&endpoint).expect("client");
    let result = client
        .query(&[QueryRequest::new("XYZ/1Min/OHLCV").between(10, 30)])
        .await
        .expect("query");

    let series = &result[&SeriesKey::new("XYZ/1Min/OHLCV")];
    assert_eq!(series.len(), 3);
    assert_eq!(
        series.column("Epoch").unwrap().as_i64(),
        Some(&[10, 20, 30][..])
    );
    assert_eq!(
        series.column("Close").unwrap().as_f64(),
        Some(&[1.5, 2.5, 3.5][..])
    );

    // the request itself: POST /rpc, msgpack content type, named method
    let request = request_rx.await.expect("request observed");
    let text = String::from_utf8_lossy(&request);
    assert!(text.starts_with("POST /rpc HTTP/1.1"), "{}", text);
    assert!(text.to_lowercase().contains("content-type: application/x-msgpack"));
    let body_at = request.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let envelope: rmpv::Value = message::decode(&request[body_at..]).expect("request body");
    let method = envelope
        .as_map()
        .and_then(|m| m.iter().find(|(k, _)| k.as_str() == Some("method")))
        .and_then(|(_, v)| v.as_str());
    assert_eq!(method, Some("DataService.Query"));
}

#[tokio::test]
async fn non_200_surfaces_the_body_text() {
    let (endpoint, _request_rx) = serve_rpc(
        "500 Internal Server Error",
        b"no such bucket: XYZ/1Min/OHLCV".to_vec(),
    )
    .await;

    let client = Client::new(&endpoint).expect("client");
    let err = client
        .query(&[QueryRequest::new("XYZ/1Min/OHLCV")])
        .await
        .expect_err("500 must fail");
    match err {
        RpcError::Status { status, detail } => {
            assert_eq!(status, 500);
            assert_eq!(detail, "no such bucket: XYZ/1Min/OHLCV");
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn service_error_in_the_envelope_fails_the_call() {
    let reply = Envelope {
        result: Option::<u8>::None,
        error: Some("query parse failure".to_string()),
        id: 1,
    };
    let (endpoint, _request_rx) =
        serve_rpc("200 OK", message::encode(&reply).expect("encode reply")).await;

    let client = Client::new(&endpoint).expect("client");
    let err = client
        .query(&[QueryRequest::new("XYZ/1Min/OHLCV")])
        .await
        .expect_err("service error must fail");
    assert!(
        matches!(err, RpcError::Service(ref msg) if msg == "query parse failure"),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn write_surfaces_per_dataset_errors() {
    let reply = Envelope {
        result: WriteReply {
            responses: vec![
                WriteResp { error: None },
                WriteResp {
                    error: Some("out of disk".to_string()),
                },
            ],
        },
        error: None,
        id: 1,
    };
    let (endpoint, _request_rx) =
        serve_rpc("200 OK", message::encode(&reply).expect("encode reply")).await;

    let client = Client::new(&endpoint).expect("client");
    let err = client
        .write(&[WriteRequest {
            data: sample_dataset("XYZ/1Min/TICK"),
            is_variable_length: false,
        }])
        .await
        .expect_err("dataset error must fail the write");
    assert!(
        matches!(err, RpcError::Service(ref msg) if msg == "out of disk"),
        "{:?}",
        err
    );
}
