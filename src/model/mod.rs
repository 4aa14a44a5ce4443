pub mod category;
pub mod common;
pub mod definition;
pub mod instance;
pub mod propagation;
pub mod value;

pub use category::*;
pub use common::*;
pub use definition::*;
pub use instance::*;
pub use propagation::*;
pub use value::*;
