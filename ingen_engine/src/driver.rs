//! The audio driver contract.
//!
//! A driver owns the real-time callback: each cycle it writes system input
//! into the root graph's input-port buffers, calls
//! [`EngineProcess::run_cycle`](crate::engine::EngineProcess::run_cycle),
//! and reads system output back out of the root graph's output-port
//! buffers. Drivers that support it also mirror root graph ports as
//! system-visible ports.

use ingen_core::{Direction, Path, PortType};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("the driver does not support dynamic ports")]
    Unsupported,
    #[error("no system port for `{0}`")]
    PortNotFound(String),
    #[error("driver error: {0}")]
    Backend(String),
}

/// Description of a system-visible port mirroring a root graph port.
#[derive(Clone, Debug)]
pub struct EnginePort {
    pub path: Path,
    pub ty: PortType,
    pub direction: Direction,
}

#[allow(unused_variables)]
pub trait Driver: Send {
    fn sample_rate(&self) -> u32;
    fn block_size(&self) -> u32;

    /// Whether root graph ports can be added and removed while running.
    fn dynamic_ports(&self) -> bool {
        false
    }

    fn add_port(&mut self, port: EnginePort) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    fn remove_port(&mut self, path: &Path) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    fn rename_port(&mut self, old_path: &Path, new_path: &Path) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }
}
