pub mod building_blocks;
pub mod error;
pub mod inference;
pub mod models;
pub mod training;
pub mod utils;
