//! Broker-based actor communication.
//!
//! Actors are independent processes that talk through a message broker using three
//! primitives: request/reply ([`rpc`]), fan-out broadcasts ([`broadcast`]) and
//! competing-consumer work queues ([`queue`]). Every message travels as a JSON
//! [`Envelope`](envelope::Envelope) tagged with its payload type. An [`Actor`](actor::Actor)
//! owns one connection and makes sure only one process runs under its id.

pub mod actor;
pub mod broadcast;
pub mod broker;
pub mod config;
pub mod contracts;
pub mod emitter;
pub mod entities;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handler;
pub mod id;
pub mod liveness;
pub mod naming;
pub mod prelude;
pub mod queue;
pub mod rpc;
pub mod schema;
pub mod ttl_set;

#[cfg(test)]
mod test_utils;

#[doc(hidden)]
pub use inventory;

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use crate::test_utils::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

    /// Initialize tracing for tests
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("interact=debug".parse().unwrap())
                    .add_directive("test=debug".parse().unwrap()),
            )
            .with_span_events(FmtSpan::CLOSE)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .try_init();
    }

    #[tokio::test]
    async fn test_actors_over_one_broker() {
        init_tracing();
        let harness = BrokerHarness::new();
        let server = Actor::start(&harness.broker, harness.config("2")).await.unwrap();
        let client = Actor::start(&harness.broker, harness.config("1")).await.unwrap();

        server
            .register_rpc_handler(2, |numbers: Numbers| async move {
                Ok::<_, HandlerError>(Product {
                    value: numbers.first * numbers.second,
                })
            })
            .await
            .unwrap();

        let product: Product = client.call("2", Numbers { first: 4, second: 5 }).await.unwrap();
        assert_eq!(product.value, 20);

        client.dispose().await;
        server.dispose().await;
    }
}
