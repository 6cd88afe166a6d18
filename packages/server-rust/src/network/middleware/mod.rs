//! Request middleware pipeline.
//!
//! Fixed order, outermost first: path normalization, request logging,
//! in-flight tracking, then the transport layers from [`build_http_layers`]
//! and the router.

pub mod in_flight;
pub mod normalize;
pub mod request_log;
pub mod stack;

pub use in_flight::{TrackInFlight, TrackInFlightLayer};
pub use normalize::{NormalizePath, NormalizePathLayer};
pub use request_log::{
    RequestCounters, RequestId, RequestLog, RequestLogConfig, RequestLogLayer, RequestVerdict,
    REQUEST_ID_HEADER,
};
pub use stack::build_http_layers;
