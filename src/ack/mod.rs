pub mod ack_handler;
