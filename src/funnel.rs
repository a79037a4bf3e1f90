use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::BoxError;
use crate::adapter::{
    ReqwestTransport, RequestId, RestBytes, RestError, RestTransport, SharedRestTransport,
};
use crate::config::FunnelConfig;
use crate::decode::{DecodeError, Decoder, SonicDecoder};
use crate::shape::{Decoded, Empty, Raw, RequestProducer};
use crate::single::Single;

pub type FunnelResult<T> = Result<T, FunnelError>;

/// The single error channel every request path exits through.
#[derive(Debug, thiserror::Error)]
pub enum FunnelError {
    #[error("failed to produce request: {0}")]
    Producer(#[source] BoxError),
    #[error(transparent)]
    Transport(RestError),
    /// Whatever the configured error mapper returned in place of a transport error.
    #[error(transparent)]
    Mapped(BoxError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl FunnelError {
    pub fn as_transport(&self) -> Option<&RestError> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }

    pub fn downcast_mapped<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Mapped(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Body and headers of a validated response.
#[derive(Clone, Debug)]
pub struct ResponseEnvelope {
    pub body: RestBytes,
    pub headers: Vec<(String, RestBytes)>,
}

/// Entry point for every request: one funnel, three result shapes, two front ends.
pub struct Client<D = SonicDecoder> {
    transport: Arc<SharedRestTransport>,
    config: FunnelConfig<D>,
}

impl<D> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<D> fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client<SonicDecoder> {
    pub fn new() -> Self {
        Self::with_transport(ReqwestTransport::new())
    }

    pub fn with_transport<T>(transport: T) -> Self
    where
        T: RestTransport + 'static,
    {
        Self::with_config(transport, FunnelConfig::default())
    }
}

impl Default for Client<SonicDecoder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Decoder> Client<D> {
    pub fn with_config<T>(transport: T, config: FunnelConfig<D>) -> Self
    where
        T: RestTransport + 'static,
    {
        Self {
            transport: Arc::new(transport),
            config,
        }
    }

    pub fn config(&self) -> &FunnelConfig<D> {
        &self.config
    }

    /// Runs one request through the transport, validation and error mapping.
    ///
    /// Dropping the returned future before the transport answers cancels the
    /// exchange through [`RestTransport::cancel`].
    pub async fn execute<P>(&self, producer: &P) -> FunnelResult<ResponseEnvelope>
    where
        P: RequestProducer + ?Sized,
    {
        let request = producer.produce().await.map_err(FunnelError::Producer)?;
        let id = RequestId::next();
        let method = request.method.clone();
        tracing::debug!(request_id = %id, %method, url = %request.url, "dispatching request");

        let guard = InFlight::new(Arc::clone(&self.transport), id);
        let outcome = self.transport.execute(id, request).await;
        guard.finish();

        let response = outcome
            .and_then(|response| self.config.policy().validate(&method, response))
            .map_err(|err| self.remap(id, err))?;

        tracing::debug!(
            request_id = %id,
            status = response.status,
            elapsed_ms = response.elapsed.as_millis() as u64,
            "request completed"
        );
        Ok(ResponseEnvelope {
            body: response.body,
            headers: response.headers,
        })
    }

    fn remap(&self, id: RequestId, error: RestError) -> FunnelError {
        tracing::debug!(
            request_id = %id,
            kind = ?error.kind(),
            status = ?error.status(),
            "request failed"
        );
        let Some(mapper) = self.config.error_mapper() else {
            return FunnelError::Transport(error);
        };
        match mapper(&error, error.body()) {
            Some(custom) => {
                tracing::debug!(request_id = %id, "error replaced by configured mapper");
                FunnelError::Mapped(custom)
            }
            None => FunnelError::Transport(error),
        }
    }

    pub async fn to_value<P, T>(&self, producer: &P) -> FunnelResult<T>
    where
        P: RequestProducer<Shape = Decoded<T>> + ?Sized,
        T: DeserializeOwned + 'static,
    {
        let envelope = self.execute(producer).await?;
        Ok(self.config.decoder().decode::<T>(&envelope.body)?)
    }

    pub async fn to_raw<P>(&self, producer: &P) -> FunnelResult<Bytes>
    where
        P: RequestProducer<Shape = Raw> + ?Sized,
    {
        Ok(self.execute(producer).await?.body)
    }

    pub async fn to_empty<P>(&self, producer: &P) -> FunnelResult<()>
    where
        P: RequestProducer<Shape = Empty> + ?Sized,
    {
        self.execute(producer).await.map(|_| ())
    }

    /// Reactive front end over [`Client::execute`]; every subscription runs the funnel once.
    pub fn envelope_single<P>(&self, producer: P) -> Single<ResponseEnvelope, FunnelError>
    where
        P: RequestProducer + 'static,
    {
        let client = self.clone();
        let producer = Arc::new(producer);
        Single::from_async(move || {
            let client = client.clone();
            let producer = Arc::clone(&producer);
            async move { client.execute(producer.as_ref()).await }
        })
        .observe_on(self.config.delivery().clone())
    }

    pub fn value_single<P, T>(&self, producer: P) -> Single<T, FunnelError>
    where
        P: RequestProducer<Shape = Decoded<T>> + 'static,
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let producer = Arc::new(producer);
        Single::from_async(move || {
            let client = client.clone();
            let producer = Arc::clone(&producer);
            async move { client.to_value(producer.as_ref()).await }
        })
        .observe_on(self.config.delivery().clone())
    }

    pub fn raw_single<P>(&self, producer: P) -> Single<Bytes, FunnelError>
    where
        P: RequestProducer<Shape = Raw> + 'static,
    {
        self.envelope_single(producer).map(|envelope| envelope.body)
    }

    pub fn empty_single<P>(&self, producer: P) -> Single<(), FunnelError>
    where
        P: RequestProducer<Shape = Empty> + 'static,
    {
        self.envelope_single(producer).map(|_| ())
    }
}

/// Cancels the transport exchange unless the response arrived first.
struct InFlight {
    transport: Arc<SharedRestTransport>,
    id: RequestId,
    armed: bool,
}

impl InFlight {
    fn new(transport: Arc<SharedRestTransport>, id: RequestId) -> Self {
        Self {
            transport,
            id,
            armed: true,
        }
    }

    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(
                request_id = %self.id,
                "request abandoned before completion, cancelling"
            );
            self.transport.cancel(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RestErrorKind;

    #[test]
    fn mapped_errors_can_be_downcast() {
        #[derive(Debug, thiserror::Error)]
        #[error("quota exceeded")]
        struct Quota;

        let err = FunnelError::Mapped(Box::new(Quota));
        assert!(err.downcast_mapped::<Quota>().is_some());
        assert!(err.as_transport().is_none());
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[test]
    fn transport_errors_are_exposed() {
        let err = FunnelError::Transport(RestError::rejected(500, "oops"));
        assert_eq!(err.as_transport().map(RestError::kind), Some(RestErrorKind::Rejected));
        assert!(!err.is_decode());
    }
}
