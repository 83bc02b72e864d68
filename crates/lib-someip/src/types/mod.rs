pub mod sd;

mod header;
mod message;
mod message_type;
mod primitives;
mod return_code;
mod tp;

pub use header::*;
pub use message::*;
pub use message_type::*;
pub use primitives::*;
pub use return_code::*;
pub use sd::*;
pub use tp::*;
