//! Record mode: forward traffic in both directions and write it to cassettes

mod recorder;
mod serializer;

pub use recorder::Recorder;
pub use serializer::HttpSerializer;
