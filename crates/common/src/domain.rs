mod auction;
mod collaborators;
mod message;
mod record;
mod result;

pub use auction::*;
pub use collaborators::*;
pub use message::*;
pub use record::*;
pub use result::*;
