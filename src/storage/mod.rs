//! Cassette storage: one text file per interaction in a scenario directory

mod format;
mod reader;
mod writer;

pub use format::{
    encode_request, encode_response, file_stem, parse_file_name, parse_interaction,
    recording_label, SEPARATOR,
};
pub use reader::load_dir;
pub use writer::create_cassette;
