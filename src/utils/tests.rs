use super::error::{DriverError, PubSubError};
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn parse_level_falls_back_to_info() {
    assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
    assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
    assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
}

#[test]
fn driver_errors_convert_into_pubsub_errors() {
    let err: PubSubError = DriverError::Closed.into();
    assert!(matches!(err, PubSubError::Driver(DriverError::Closed)));
    assert_eq!(err.to_string(), "connection closed");
    assert_eq!(PubSubError::EmptyTopic.to_string(), "empty topic");
}
