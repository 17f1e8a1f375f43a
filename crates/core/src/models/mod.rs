pub mod decoder;
pub mod flamingo;

pub use decoder::{TextDecoder, TextDecoderLayer};
pub use flamingo::FlamingoLm;
