pub mod ania;
pub mod fcgr_ania;
pub mod head;
pub mod model_interface;
pub mod word_embedding_ania;
