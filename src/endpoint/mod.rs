pub mod endpoint_manager;
pub mod endpoint_router;
pub mod service_endpoint;
