//! Error handling helpers and primitives.

use anyhow::{Error, Result};
use std::net::IpAddr;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
/// Domain level error kinds surfaced by the driver. Operations attach one of
/// these to their `anyhow` chain as soon as the kind is known, so that callers
/// can match on it via `Error::downcast_ref`.
pub enum NetworkError {
    #[error("invalid parameter: {0}")]
    /// User supplied configuration which cannot be applied.
    InvalidParameter(String),

    #[error("not found: {0}")]
    /// An unknown network or endpoint was referenced.
    NotFound(String),

    #[error("forbidden: {0}")]
    /// The operation conflicts with an existing object of the same identity.
    Forbidden(String),

    #[error("conflict: {0}")]
    /// Two objects compete for the same resource, like overlapping subnets.
    Conflict(String),

    #[error("port {port}/{proto} already in use on {addr}")]
    /// A requested host port cannot be reserved.
    BusyPort {
        /// Host address the reservation was tried on.
        addr: IpAddr,
        /// Transport protocol of the reservation.
        proto: String,
        /// Requested host port.
        port: u16,
    },

    #[error("internal failure: {0}")]
    /// A syscall or firewall backend failure not attributable to user input.
    Internal(String),

    #[error("no such feature: {0}")]
    /// A collaborator does not support the requested operation.
    NoSuchFeature(String),
}

impl NetworkError {
    /// Check whether the provided error carries a `BusyPort` kind anywhere in
    /// its chain.
    pub fn is_busy_port(err: &Error) -> bool {
        err.chain()
            .any(|e| matches!(e.downcast_ref(), Some(NetworkError::BusyPort { .. })))
    }
}

/// Chain creates a string from an error stack.
pub fn chain(res: Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[derive(Debug, Default)]
/// Collects errors on paths which must never abort early, like teardown and
/// rollback. All steps run to completion and the failures are combined into a
/// single error afterwards.
pub struct ErrorAccumulator {
    errors: Vec<Error>,
}

impl ErrorAccumulator {
    /// Record the error of a failed step, if any.
    pub fn push<T>(&mut self, res: Result<T>) {
        if let Err(e) = res {
            self.errors.push(e);
        }
    }

    /// Whether no step failed so far.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert the collected failures into a single combined result.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let combined = self
            .errors
            .into_iter()
            .map(chain)
            .collect::<Vec<_>>()
            .join("; ");
        Err(anyhow::anyhow!(combined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn busy_port_detected_through_context() {
        let err = Error::new(NetworkError::BusyPort {
            addr: "0.0.0.0".parse().unwrap(),
            proto: "tcp".into(),
            port: 8080,
        })
        .context("allocate group port");

        assert!(NetworkError::is_busy_port(&err));
        assert!(!NetworkError::is_busy_port(&anyhow!("unrelated")));
    }

    #[test]
    fn accumulator_combines_all_errors() {
        let mut acc = ErrorAccumulator::default();
        acc.push(Ok(()));
        acc.push::<()>(Err(anyhow!("first failure")));
        acc.push::<()>(Err(anyhow!("second failure")));

        let res = acc.into_result();
        let msg = res.unwrap_err().to_string();
        assert!(msg.contains("first failure"));
        assert!(msg.contains("second failure"));
    }

    #[test]
    fn accumulator_empty_is_ok() {
        let mut acc = ErrorAccumulator::default();
        acc.push(Ok(()));
        assert!(acc.is_empty());
        assert!(acc.into_result().is_ok());
    }
}
