pub mod audit;
pub mod catalog;
pub mod coerce;
pub mod propagate;
pub mod spec_store;
pub mod validate;

pub use audit::*;
pub use catalog::*;
pub use coerce::*;
pub use propagate::*;
pub use spec_store::*;
pub use validate::*;
