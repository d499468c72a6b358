use thiserror::Error;

use crate::packet::PacketError;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;
