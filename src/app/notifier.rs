use thiserror::Error;

use crate::domain::models::PowerEvent;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Push channel for power events. Delivery is best effort: callers log
/// failures and keep monitoring.
pub trait Notifier: Send + 'static {
    fn notify(&self, event: &PowerEvent) -> Result<(), NotifierError>;
}
