pub mod builder;
pub mod config;
pub mod convert;
pub mod decoder;
pub mod encoder;
pub mod frozen;
pub mod normalizer;
pub mod trie;

pub use builder::{BuildError, DoubleArrayBuilder};
pub use config::{ConfigError, EncoderConfig, EncoderConfigBuilder, SENTENCE_PIECE_VERSION};
pub use decoder::{decode_string, Decoder, DecoderConfigBuilder, DecoderResult, DecoderStatus};
pub use encoder::{encode_string, EncodeOptions, Encoder, EncoderResult, EncoderStatus};
pub use normalizer::{Normalized, Normalizer};
pub use trie::{Match, TrieMatcher};
