mod entry;
mod message;
mod option;

pub use entry::*;
pub use message::*;
pub use option::*;
