pub mod codec;
pub mod error;
pub mod value;

pub use codec::{decode, decode_fast, decode_lenient, encode};
pub use error::{CodecError, CodecErrorKind};
pub use value::Value;
