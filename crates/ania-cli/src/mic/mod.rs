pub mod fine_tune;
pub mod load_data;
pub mod report;
pub mod train;
pub mod util;
