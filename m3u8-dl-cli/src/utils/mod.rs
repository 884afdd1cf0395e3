mod headers;
pub mod progress;

pub use self::headers::{build_headers, parse_headers};
