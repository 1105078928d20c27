pub mod epub_deconstructor;
pub mod epub_generator;
pub mod html_utils;
pub mod models;
pub mod parser;
