//! Vesper lexical analysis: buffered input streams and the token
//! scanner.

pub mod lexer;
pub mod token;
pub mod zio;
