use iox_chunk::{Publisher, ShmSegment, Subscriber};
use iox_memory::Relocatable;

// ObjectId is stable for the lifetime of a tracked object, across all processes
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId(pub u32);

// One detection of the radar tracker
// POD -> plain old data, fixed size, no pointers
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RadarObject {
    pub ts_ns: u64,
    pub x_m: f64, // metres, vehicle frame
    pub y_m: f64,
    pub z_m: f64,
    pub velocity_mps: f32,
    pub object_id: ObjectId,
}

impl RadarObject {
    /// Straight-line distance from the sensor.
    #[inline]
    pub fn range_m(&self) -> f64 {
        (self.x_m * self.x_m + self.y_m * self.y_m + self.z_m * self.z_m).sqrt()
    }
}

// SAFETY: plain numbers only.
unsafe impl Relocatable for ObjectId {}
unsafe impl Relocatable for RadarObject {}

/// Segment shape shared by the publisher and subscriber binaries.
pub type RadarSegment = ShmSegment<RadarObject, 256, 4, 64>;
pub type RadarPublisher = Publisher<RadarObject, 256, 4, 64>;
pub type RadarSubscriber = Subscriber<RadarObject, 256, 4, 64>;
