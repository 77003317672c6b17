pub mod client_connection;
pub mod client_connection_manager;
pub mod connection_factory;
pub mod connection_handler;
pub mod service_connection;
