mod preprocessor;

pub use preprocessor::{
    ImageMetadata, MediaPreprocessor, PreprocessConfig, PreprocessError, PreprocessOutput,
    ProcessedMedia,
};
