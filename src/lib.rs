pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod kafka;
pub mod producer;
pub mod topic;

pub use codec::PriceUpdate;
pub use config::Config;
pub use consumer::{ConsumerGroupClient, Delivery, RecordHandler};
pub use error::{DecodeError, Error, Result, TransportError};
pub use producer::{Acks, ProducerClient, Record, SendResult};
