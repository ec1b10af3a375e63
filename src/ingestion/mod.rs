pub mod parser;
pub mod pipeline;
pub mod source;
pub mod watermark;

pub use parser::{BodyParamOrder, ParseError, SignalParser};
pub use pipeline::{Outcome, Pipeline, PipelineConfig};
pub use source::{MessageSource, SpoolDirSource};
pub use watermark::{Watermark, WatermarkStore};
