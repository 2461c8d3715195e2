mod error;
mod layout;
mod publisher;
mod registry;
mod segment;
mod subscriber;

pub use error::SegmentError;
pub use layout::{ChunkHeader, SEGMENT_MAGIC, SEGMENT_VERSION, SegmentHeader, bytes_for_segment};
pub use publisher::{LoanedSample, Publisher};
pub use registry::{MAX_TOPIC_NAME_LEN, MAX_TOPICS, TopicId, TopicRegistry};
pub use segment::ShmSegment;
pub use subscriber::{Sample, Subscriber};
