//! Request producers and the result shapes they declare.
//!
//! A producer's [`ResultShape`] decides, at compile time, which extraction
//! the [`Client`](crate::Client) offers for it:
//!
//! ```compile_fail
//! use shared_request_funnel::{Client, PreparedRequest, RestRequest};
//!
//! async fn wrong_shape(client: Client) {
//!     let producer = PreparedRequest::raw(RestRequest::get("https://api.example.com/blob"));
//!     // `to_value` needs a `Decoded<T>` producer.
//!     let _: Vec<u8> = client.to_value(&producer).await.unwrap();
//! }
//! ```
//!
//! ```compile_fail
//! use shared_request_funnel::{Client, PreparedRequest, RestRequest};
//!
//! async fn wrong_shape(client: Client) {
//!     let producer = PreparedRequest::empty(RestRequest::post("https://api.example.com/ping"));
//!     // `to_raw` needs a `Raw` producer.
//!     let _ = client.to_raw(&producer).await;
//! }
//! ```

use std::{fmt, future::Future, marker::PhantomData};

use crate::BoxError;
use crate::adapter::{RestFuture, RestRequest};

mod sealed {
    pub trait Sealed {}
}

/// How a response body is interpreted.
pub trait ResultShape: sealed::Sealed + Send + Sync + 'static {}

/// The body is decoded into `T` by the configured decoder.
pub struct Decoded<T>(PhantomData<fn() -> T>);

/// The body is returned as-is.
#[derive(Debug)]
pub struct Raw;

/// No body is expected.
#[derive(Debug)]
pub struct Empty;

impl<T: 'static> sealed::Sealed for Decoded<T> {}
impl<T: 'static> ResultShape for Decoded<T> {}
impl sealed::Sealed for Raw {}
impl ResultShape for Raw {}
impl sealed::Sealed for Empty {}
impl ResultShape for Empty {}

impl<T> fmt::Debug for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decoded<{}>", std::any::type_name::<T>())
    }
}

/// Something that yields a ready-to-send request on every invocation.
pub trait RequestProducer: Send + Sync {
    type Shape: ResultShape;

    /// Builds the request. Failing here surfaces as
    /// [`FunnelError::Producer`](crate::FunnelError::Producer).
    fn produce(&self) -> RestFuture<Result<RestRequest, BoxError>>;
}

/// A producer holding an already built request.
pub struct PreparedRequest<S> {
    request: RestRequest,
    shape: PhantomData<S>,
}

impl<S: ResultShape> PreparedRequest<S> {
    pub fn new(request: RestRequest) -> Self {
        Self {
            request,
            shape: PhantomData,
        }
    }

    pub fn request(&self) -> &RestRequest {
        &self.request
    }
}

impl<T: 'static> PreparedRequest<Decoded<T>> {
    pub fn value(request: RestRequest) -> Self {
        Self::new(request)
    }
}

impl PreparedRequest<Raw> {
    pub fn raw(request: RestRequest) -> Self {
        Self::new(request)
    }
}

impl PreparedRequest<Empty> {
    pub fn empty(request: RestRequest) -> Self {
        Self::new(request)
    }
}

impl<S> fmt::Debug for PreparedRequest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedRequest")
            .field("request", &self.request)
            .field("shape", &std::any::type_name::<S>())
            .finish()
    }
}

impl<S: ResultShape> RequestProducer for PreparedRequest<S> {
    type Shape = S;

    fn produce(&self) -> RestFuture<Result<RestRequest, BoxError>> {
        let request = self.request.clone();
        Box::pin(async move { Ok(request) })
    }
}

/// A producer that builds its request asynchronously, and may fail doing so.
pub struct LazyRequest<F, S> {
    build: F,
    shape: PhantomData<S>,
}

impl<F, Fut, E, S> LazyRequest<F, S>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<RestRequest, E>> + Send + 'static,
    E: Into<BoxError>,
    S: ResultShape,
{
    pub fn new(build: F) -> Self {
        Self {
            build,
            shape: PhantomData,
        }
    }
}

impl<F, Fut, E, S> RequestProducer for LazyRequest<F, S>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<RestRequest, E>> + Send + 'static,
    E: Into<BoxError>,
    S: ResultShape,
{
    type Shape = S;

    fn produce(&self) -> RestFuture<Result<RestRequest, BoxError>> {
        let pending = (self.build)();
        Box::pin(async move { pending.await.map_err(Into::into) })
    }
}
