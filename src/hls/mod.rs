pub mod journal;
pub mod mirrors;
pub mod parser;
pub mod rewrite;
