use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MbufError {
    #[error("mbuf pool exhausted ({limit} buffers)")]
    Exhausted { limit: usize },

    #[error("stale mbuf handle")]
    Stale,

    #[error("cannot concatenate an mbuf onto itself")]
    SelfConcatenate,
}
