use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use flowgate::EntryBuilder;
use flowgate::ResourceType;
use flowgate::TrafficType;
use tower::BoxError;
use tower::Service;

use crate::GateError;

/// Brackets each request in a flowgate entry for one resource.
pub struct FlowControlService<S> {
    inner: S,
    resource: Arc<str>,
    traffic_type: TrafficType,
    batch_count: u32,
}

impl<S: Clone> Clone for FlowControlService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            resource: self.resource.clone(),
            traffic_type: self.traffic_type,
            batch_count: self.batch_count,
        }
    }
}

impl<S> FlowControlService<S> {
    pub fn new(
        inner: S,
        resource: Arc<str>,
        traffic_type: TrafficType,
        batch_count: u32,
    ) -> Self {
        Self {
            inner,
            resource,
            traffic_type,
            batch_count,
        }
    }
}

impl<S, Req> Service<Req> for FlowControlService<S>
where
    S: Service<Req, Error = BoxError>,
    S::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    // The decision is made in call(), so the future carries the entry to
    // completion; boxing keeps the type nameable.
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let built = EntryBuilder::new(self.resource.as_ref())
            .with_resource_type(ResourceType::Web)
            .with_traffic_type(self.traffic_type)
            .with_batch_count(self.batch_count)
            .build();

        match built {
            Err(blocked) => {
                let err = GateError::Blocked {
                    message: blocked.to_string(),
                };
                Box::pin(async move { Err(BoxError::from(err)) })
            }
            Ok(entry) => {
                let fut = self.inner.call(req);
                Box::pin(async move {
                    match fut.await {
                        Ok(response) => {
                            entry.exit();
                            Ok(response)
                        }
                        Err(err) => {
                            entry.trace_error(err.to_string());
                            entry.exit();
                            Err(err)
                        }
                    }
                })
            }
        }
    }
}
