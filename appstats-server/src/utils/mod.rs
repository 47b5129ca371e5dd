mod api;

pub use self::api::*;
