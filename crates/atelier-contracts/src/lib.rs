pub mod cost;
pub mod history;
pub mod request;
pub mod storage;
