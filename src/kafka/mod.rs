pub mod consumer;
pub mod producer;
pub mod topic_manager;


pub use consumer::KafkaConsumer;
pub use producer::KafkaProducer;
pub use topic_manager::TopicManager;

use crate::error::TransportError;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};

/// Maps a librdkafka failure onto the transport error taxonomy.
///
/// `topic` is the topic the request named, when there is exactly one.
pub(crate) fn classify(err: &KafkaError, topic: Option<&str>) -> TransportError {
    match (err.rdkafka_error_code(), topic) {
        (Some(code), _) if is_transient(code) => TransportError::Transient(err.to_string()),
        (
            Some(RDKafkaErrorCode::UnknownTopic | RDKafkaErrorCode::UnknownTopicOrPartition),
            Some(topic),
        ) => TransportError::UnknownTopic(topic.to_string()),
        _ => TransportError::Rejected(err.to_string()),
    }
}

fn is_transient(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::NotEnoughReplicas
            | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
            // Group coordination, seen while a rebalance is under way.
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::RebalanceInProgress
            | RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::UnknownMemberId
    )
}
