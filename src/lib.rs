//! One funnel for HTTP requests over reqwest: status validation, decoding and
//! error remapping in a single place, consumable as an awaitable call or as a
//! cancellable single-value stream. Ships an in-memory mock transport for
//! fully deterministic tests.

pub mod adapter;
pub mod config;
pub mod decode;
pub mod funnel;
pub mod mock;
pub mod shape;
pub mod single;

pub use reqwest::Method;

/// Boxed error used wherever callers hand in their own error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use adapter::{
    ReqwestTransport, RequestId, RestBytes, RestError, RestErrorKind, RestFuture, RestRequest,
    RestResponse, RestResult, RestTransport,
};
pub use config::{ErrorMapper, FunnelConfig, FunnelConfigBuilder, HttpConfig, ResponsePolicy};
pub use decode::{DecodeError, Decoder, SonicDecoder};
pub use funnel::{Client, FunnelError, FunnelResult, ResponseEnvelope};
pub use mock::{
    MockBehavior, MockBehaviorPlan, MockResponse, MockRestAdapter, MockRestStateSnapshot,
    RestTransportState,
};
pub use shape::{Decoded, Empty, LazyRequest, PreparedRequest, Raw, RequestProducer, ResultShape};
pub use single::{DeliveryContext, Single, Subscription};
