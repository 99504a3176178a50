use std::sync::Arc;

use graph_gateway_module::GraphGateway;

pub(super) struct GatewayState {
    pub(super) gateway: Arc<GraphGateway>,
}
