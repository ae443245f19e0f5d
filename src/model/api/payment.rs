use serde::{Deserialize, Serialize};

/// The immediate, synthetic approval of a simulated payment.
/// The participant is only marked as paid once the settlement delay elapses.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PaymentReceipt {
    pub amount: f64,
    pub message: String,
}
