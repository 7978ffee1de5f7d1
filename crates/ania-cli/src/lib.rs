pub mod mic;
