//! Message bus and forward-progress machinery for mailpipe.
//!
//! - **Bus**: at-least-once topics with in-flight tracking and failed queues
//!   (Redis lists or in-memory)
//! - **Consumer**: per-topic worker loop settling messages by handler outcome
//! - **Processor**: idempotent stage execution over the document store
//! - **Scheduler**: periodic backoff-aware requeue of stuck documents
//! - **Operator**: inspect/requeue/purge of failed queues

pub mod bus;
pub mod consumer;
pub mod envelope;
pub mod memory;
pub mod operator;
pub mod processor;
pub mod redis;
pub mod retry;
pub mod scheduler;

pub use bus::{MessageBus, connect_bus};
pub use consumer::{Consumer, ConsumerConfig, ConsumerPool, HandlerOutcome, MessageHandler};
pub use envelope::{Delivery, Envelope, StageEvent, failed_queue_name, working_topic};
pub use memory::MemoryBus;
pub use operator::FailedQueueOperator;
pub use processor::{Stage, StageError, StageProcessor};
pub use redis::RedisBus;
pub use retry::{RetryConfig, publish_with_retry};
pub use scheduler::{CollectionReport, Decision, RetryScheduler, RunReport, SkipReason, evaluate};
