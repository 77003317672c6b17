pub mod ack;
pub mod config;
pub mod connection;
pub mod container;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .with_test_writer()
            .try_init()
            .ok();
    }
}
