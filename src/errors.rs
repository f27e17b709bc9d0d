use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroupByError {
    #[error("Failed to allocate {requested} bytes of device memory for {buffer} ({available} bytes available)")]
    Allocation {
        buffer: &'static str,
        requested: usize,
        available: usize,
    },
    #[error("Transfer failed: {0}")]
    Transfer(String),
    #[error("Failed to launch kernel {kernel}: {reason}")]
    KernelLaunch { kernel: &'static str, reason: String },
    #[error("Invalid aggregate expression: {0}")]
    InvalidExpression(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("Overflow or division by zero")]
    Overflow,
    #[error("Some assumption was violated. This is a bug: {0}")]
    FatalError(String),
}

impl GroupByError {
    pub fn launch(kernel: &'static str, reason: impl Into<String>) -> GroupByError {
        GroupByError::KernelLaunch {
            kernel,
            reason: reason.into(),
        }
    }
}

#[macro_export]
macro_rules! fatal {
    ($e:expr) => {
        $crate::errors::GroupByError::FatalError($e.to_owned())
    };
    ($fmt:expr, $($arg:tt)+) => {
        $crate::errors::GroupByError::FatalError(format!($fmt, $($arg)+))
    };
}

#[macro_export]
macro_rules! bail {
    ($kind:expr, $e:expr) => {
        return Err($kind($e.to_owned()))
    };
    ($kind:expr, $fmt:expr, $($arg:tt)+) => {
        return Err($kind(format!($fmt, $($arg)+)))
    };
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($crate::errors::GroupByError::FatalError($e.to_string()));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::errors::GroupByError::FatalError(format!($fmt, $($arg)+)));
        }
    };
}
