use std::sync::Arc;

use flowgate::TrafficType;
use tower::Layer;

use crate::service::FlowControlService;

/// Applies flow control to requests under a fixed resource name.
#[derive(Debug, Clone)]
pub struct FlowControlLayer {
    resource: Arc<str>,
    traffic_type: TrafficType,
    batch_count: u32,
}

impl FlowControlLayer {
    /// Create a layer protecting `resource`.
    pub fn new(resource: impl Into<Arc<str>>) -> Self {
        FlowControlLayer {
            resource: resource.into(),
            traffic_type: TrafficType::default(),
            batch_count: 1,
        }
    }

    /// Mark entries from this layer as inbound or outbound traffic.
    /// Inbound entries also feed the process-wide inbound statistics.
    pub fn with_traffic_type(mut self, traffic_type: TrafficType) -> Self {
        self.traffic_type = traffic_type;
        self
    }

    /// How many units of work each request represents. Defaults to 1.
    pub fn with_batch_count(mut self, batch_count: u32) -> Self {
        self.batch_count = batch_count;
        self
    }
}

impl<S> Layer<S> for FlowControlLayer {
    type Service = FlowControlService<S>;

    fn layer(&self, service: S) -> Self::Service {
        FlowControlService::new(
            service,
            self.resource.clone(),
            self.traffic_type,
            self.batch_count,
        )
    }
}
