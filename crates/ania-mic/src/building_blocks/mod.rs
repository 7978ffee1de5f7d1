pub mod inception;
pub mod nn;
