mod cyclic_index;
mod index_queue;
mod resizeable_queue;
mod typed_allocator;

pub use cyclic_index::CyclicIndex;
pub use index_queue::{IndexQueue, InitialState};
pub use resizeable_queue::ResizeableLockFreeQueue;
pub use typed_allocator::TypedAllocator;
