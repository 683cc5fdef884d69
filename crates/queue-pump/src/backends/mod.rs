//! Queue backend implementations.
//!
//! - [`SqsQueue`]: remote queue; retries and dead-lettering are delegated to
//!   the service's redrive policy
//! - [`FileQueue`]: local folder; retries and dead-lettering are done here

pub mod file;
pub mod sqs;
pub mod sqs_http;

pub use file::{FileQueue, QueueRecord, DEAD_LETTER_FOLDER};
pub use sqs::{ReceiveRequest, SqsQueue, SqsTransport};
pub use sqs_http::{HttpSqsTransport, SqsConnection, SqsError};
