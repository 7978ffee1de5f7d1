pub mod checkpoint;
pub mod fine_tune;
pub mod hyperparams;
pub mod optim;
pub mod search;
