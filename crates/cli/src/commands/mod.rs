pub mod ask;
pub mod config_cmd;
pub mod detect_dump;
pub mod serve;
