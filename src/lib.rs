pub mod client;
pub mod connection;
pub mod connman;
pub mod factory;
pub mod frames;
pub mod gaps;
pub mod util;

#[cfg(test)]
mod test_util;


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
