pub mod radar;
pub use radar::{ObjectId, RadarObject, RadarPublisher, RadarSegment, RadarSubscriber};
