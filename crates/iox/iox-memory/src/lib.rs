mod relocatable;
mod relocatable_ptr;

pub use relocatable::Relocatable;
pub use relocatable_ptr::RelocatablePtr;
