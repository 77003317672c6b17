pub mod endpoint_status;
pub mod multi_endpoint_container;
pub mod service_connection_container;
