mod ai_reply;

pub use ai_reply::*;
