use std::{error::Error, fmt::Display, sync::mpsc};

#[derive(Debug)]
pub enum GazeGuiError {
    IOError(std::io::Error),
    MPSCSendError,
    JoinError,
}

impl Display for GazeGuiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#?}", self)
    }
}

impl Error for GazeGuiError {}

impl From<std::io::Error> for GazeGuiError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

impl<T> From<mpsc::SendError<T>> for GazeGuiError {
    fn from(_: mpsc::SendError<T>) -> Self {
        Self::MPSCSendError
    }
}
