//! Read-only projections of the clinic application's user directory and
//! surgical case schedule.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Dentist,
    Assistant,
    StockStaff,
    CustomerService,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Dentist => "dentist",
            Role::Assistant => "assistant",
            Role::StockStaff => "stock_staff",
            Role::CustomerService => "customer_service",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Role, Self::Err> {
        Ok(match s {
            "admin" => Role::Admin,
            "dentist" => Role::Dentist,
            "assistant" => Role::Assistant,
            "stock_staff" => Role::StockStaff,
            "customer_service" => Role::CustomerService,
            _ => anyhow::bail!("unknown role `{s}`"),
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub full_name: String,
    pub role: Role,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialStatus {
    Ready,
    Pending,
    NotRequired,
}

impl std::str::FromStr for MaterialStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<MaterialStatus, Self::Err> {
        Ok(match s {
            "ready" => MaterialStatus::Ready,
            "pending" => MaterialStatus::Pending,
            "not_required" => MaterialStatus::NotRequired,
            _ => anyhow::bail!("unknown material status `{s}`"),
        })
    }
}

impl MaterialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterialStatus::Ready => "ready",
            MaterialStatus::Pending => "pending",
            MaterialStatus::NotRequired => "not_required",
        }
    }
}

/// A surgical case as seen by the daily digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseSummary {
    pub id: Uuid,
    pub case_number: String,
    pub patient_name: String,
    pub dentist_id: Option<Uuid>,
    pub surgery_date: NaiveDate,
    pub surgery_time: Option<NaiveTime>,
    pub procedure: String,
    pub material_status: MaterialStatus,
}
