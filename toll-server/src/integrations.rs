pub mod postmark;
pub mod tolls;
