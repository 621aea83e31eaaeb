use super::types::HealthStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverHealth {
    pub status: HealthStatus,
    pub last_activity: DateTime<Utc>,
    pub error_count: u64,
    pub success_rate: f64,
    pub average_response_time: Duration,
    pub details: Option<HashMap<String, serde_json::Value>>,
}
