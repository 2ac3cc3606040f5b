use thiserror::Error;

use crate::container::domain::ivf_header::ContainerError;
use crate::encoder::domain::buffer_broker::EncoderError;
use crate::source::domain::frame_source::SourceError;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("encode pipeline already executed")]
    AlreadyExecuted,
}
