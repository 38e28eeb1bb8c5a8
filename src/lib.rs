pub mod constant;
pub mod dberror;
pub mod config;
pub mod bintuco;
pub mod geometry;
pub mod shape;
pub mod schema;
pub mod record;
pub mod freelist;
pub mod storage;
pub mod heap;
pub mod rowindex;
pub mod rewriter;
pub mod table;
