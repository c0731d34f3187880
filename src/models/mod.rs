pub mod blob;
pub mod pic;

pub use blob::*;
pub use pic::*;
