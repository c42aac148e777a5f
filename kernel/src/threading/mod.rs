pub mod process;

pub use process::{ThreadContext, Tid};
