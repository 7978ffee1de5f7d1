pub mod input;
pub mod tuner;
