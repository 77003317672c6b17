pub mod service_messages;
pub mod service_protocol;
