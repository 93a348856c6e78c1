pub mod client;
pub mod message;
pub mod series;
pub mod stream;

pub use client::{Client, QueryRequest, RpcError, WriteRequest};
pub use message::{Payload, SubscribeMessage, streams_equal};
pub use series::{
    Column, ColumnSeries, ColumnSeriesMap, ColumnType, DataSet, SeriesError, SeriesKey,
};
pub use stream::{
    HandlerError, SUBSCRIBE_TIMEOUT, StreamEnd, StreamHandle, SubscribeError, SubscribeOptions,
};
