//! Transport and funnel configuration.

use std::{fmt, ops::Range, sync::Arc, time::Duration};

use reqwest::{Client as ReqwestClient, ClientBuilder, Method};

use crate::BoxError;
use crate::adapter::{RestError, RestResponse};
use crate::decode::{Decoder, SonicDecoder};
use crate::single::DeliveryContext;

/// Settings for the `reqwest` client behind [`ReqwestTransport`](crate::ReqwestTransport).
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout, unless the request sets its own.
    pub request_timeout: Duration,
    /// User agent string.
    pub user_agent: String,
    /// Maximum idle connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("shared-request-funnel/{}", env!("CARGO_PKG_VERSION")),
            pool_max_idle_per_host: 10,
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> Result<ReqwestClient, reqwest::Error> {
        ClientBuilder::new()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .user_agent(&self.user_agent)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build()
    }
}

/// Status and body validation applied to every response leaving the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePolicy {
    acceptable: Range<u16>,
    empty_statuses: Vec<u16>,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            acceptable: 200..300,
            empty_statuses: vec![200, 204, 205],
        }
    }
}

impl ResponsePolicy {
    pub fn with_acceptable(mut self, acceptable: Range<u16>) -> Self {
        self.acceptable = acceptable;
        self
    }

    pub fn with_empty_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.empty_statuses = statuses.into_iter().collect();
        self
    }

    pub fn acceptable(&self) -> &Range<u16> {
        &self.acceptable
    }

    pub fn empty_statuses(&self) -> &[u16] {
        &self.empty_statuses
    }

    /// Passes `response` through, or turns it into the error the funnel reports.
    ///
    /// HEAD responses never carry a body, so they are exempt from the empty-body check.
    pub fn validate(
        &self,
        method: &Method,
        response: RestResponse,
    ) -> Result<RestResponse, RestError> {
        if !self.acceptable.contains(&response.status) {
            return Err(RestError::rejected(response.status, response.body));
        }
        if response.body.is_empty()
            && *method != Method::HEAD
            && !self.empty_statuses.contains(&response.status)
        {
            return Err(RestError::empty_body(response.status));
        }
        Ok(response)
    }
}

/// Rewrites a transport failure into a caller-defined error.
///
/// Receives the original error and the response body when one was received.
/// Returning `None` keeps the original error.
pub type ErrorMapper = dyn Fn(&RestError, Option<&[u8]>) -> Option<BoxError> + Send + Sync;

/// Everything the funnel reads while handling a request.
///
/// Built once and shared read-only by every clone of the
/// [`Client`](crate::Client) that owns it.
pub struct FunnelConfig<D = SonicDecoder> {
    decoder: Arc<D>,
    error_mapper: Option<Arc<ErrorMapper>>,
    policy: ResponsePolicy,
    delivery: DeliveryContext,
}

impl FunnelConfig<SonicDecoder> {
    pub fn builder() -> FunnelConfigBuilder<SonicDecoder> {
        FunnelConfigBuilder {
            decoder: SonicDecoder,
            error_mapper: None,
            policy: ResponsePolicy::default(),
            delivery: None,
        }
    }
}

impl Default for FunnelConfig<SonicDecoder> {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl<D: Decoder> FunnelConfig<D> {
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn error_mapper(&self) -> Option<&ErrorMapper> {
        self.error_mapper.as_deref()
    }

    pub fn policy(&self) -> &ResponsePolicy {
        &self.policy
    }

    pub fn delivery(&self) -> &DeliveryContext {
        &self.delivery
    }
}

impl<D> Clone for FunnelConfig<D> {
    fn clone(&self) -> Self {
        Self {
            decoder: Arc::clone(&self.decoder),
            error_mapper: self.error_mapper.clone(),
            policy: self.policy.clone(),
            delivery: self.delivery.clone(),
        }
    }
}

impl<D> fmt::Debug for FunnelConfig<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunnelConfig")
            .field("decoder", &std::any::type_name::<D>())
            .field("error_mapper", &self.error_mapper.is_some())
            .field("policy", &self.policy)
            .field("delivery", &self.delivery)
            .finish()
    }
}

pub struct FunnelConfigBuilder<D> {
    decoder: D,
    error_mapper: Option<Arc<ErrorMapper>>,
    policy: ResponsePolicy,
    delivery: Option<DeliveryContext>,
}

impl<D: Decoder> FunnelConfigBuilder<D> {
    pub fn decoder<D2: Decoder>(self, decoder: D2) -> FunnelConfigBuilder<D2> {
        FunnelConfigBuilder {
            decoder,
            error_mapper: self.error_mapper,
            policy: self.policy,
            delivery: self.delivery,
        }
    }

    pub fn error_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&RestError, Option<&[u8]>) -> Option<BoxError> + Send + Sync + 'static,
    {
        self.error_mapper = Some(Arc::new(mapper));
        self
    }

    pub fn policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn empty_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.policy = self.policy.with_empty_statuses(statuses);
        self
    }

    pub fn delivery(mut self, delivery: DeliveryContext) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn build(self) -> FunnelConfig<D> {
        FunnelConfig {
            decoder: Arc::new(self.decoder),
            error_mapper: self.error_mapper,
            policy: self.policy,
            delivery: self.delivery.unwrap_or_else(DeliveryContext::shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::adapter::RestErrorKind;

    fn response(status: u16, body: &'static [u8]) -> RestResponse {
        RestResponse {
            status,
            headers: Vec::new(),
            body: Bytes::from_static(body),
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn default_http_config() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("shared-request-funnel/"));
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert!(config.build_client().is_ok());
    }

    #[test]
    fn empty_bodies_allowed_only_for_whitelisted_statuses() {
        let policy = ResponsePolicy::default();
        for status in [200, 204, 205] {
            assert!(policy.validate(&Method::GET, response(status, b"")).is_ok());
        }

        let err = policy
            .validate(&Method::POST, response(201, b""))
            .expect_err("201 without body is not in the empty set");
        assert_eq!(err.kind(), RestErrorKind::EmptyBody);
        assert_eq!(err.status(), Some(201));

        assert!(policy.validate(&Method::POST, response(201, b"{}")).is_ok());
    }

    #[test]
    fn head_responses_skip_the_empty_body_check() {
        let policy = ResponsePolicy::default();
        assert!(policy.validate(&Method::HEAD, response(202, b"")).is_ok());
    }

    #[test]
    fn statuses_outside_the_range_are_rejected_with_body() {
        let policy = ResponsePolicy::default();
        let err = policy
            .validate(&Method::GET, response(422, br#"{"error":"bad"}"#))
            .expect_err("422 is not acceptable");
        assert_eq!(err.kind(), RestErrorKind::Rejected);
        assert_eq!(err.status(), Some(422));
        assert_eq!(err.body(), Some(br#"{"error":"bad"}"#.as_slice()));

        let widened = ResponsePolicy::default().with_acceptable(200..500);
        assert!(widened.validate(&Method::GET, response(422, b"x")).is_ok());
    }

    #[test]
    fn builder_installs_mapper_and_empty_statuses() {
        let config = FunnelConfig::builder()
            .error_mapper(|_, _| None)
            .empty_statuses([204])
            .build();
        assert!(config.error_mapper().is_some());
        assert_eq!(config.policy().empty_statuses(), &[204]);
        assert!(FunnelConfig::default().error_mapper().is_none());
    }
}
