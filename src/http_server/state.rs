use std::sync::Arc;

use crate::staging::Staging;
use crate::store::{RetryLimits, Store};

pub struct AppState {
    pub store: Arc<Store>,
    pub staging: Staging,
    pub limits: RetryLimits,
}
