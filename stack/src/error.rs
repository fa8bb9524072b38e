use thiserror::Error;

#[derive(Error, Debug)]
pub enum StackError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("socket table full ({0} sockets)")]
    SocketTableFull(usize),

    #[error("redirect failed: {0}")]
    Redirect(String),

    #[error("mbuf error: {0}")]
    Mbuf(#[from] usernet_mbuf::MbufError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}
